use domain::{TodoId, UserId, UserIdentity};
use infrastructure::InMemoryBackend;
use shared::{init_tracing, Config, Session};
use std::sync::Arc;
use std::time::Duration;
use todo_app::{render, Collaborators, ListSnapshot, Route, SubscriptionState, TodoApp};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const HELP: &str = "commands: add <text> | toggle <n> | rm <n> | ls | dismiss | signin <user> | signout | help | quit";

/// REPL のコマンド
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Add(String),
    Toggle(usize),
    Remove(usize),
    List,
    Dismiss,
    SignIn(String),
    SignOut,
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (name, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match name {
            "add" => Ok(Command::Add(rest.to_string())),
            "toggle" => Self::position(rest).map(Command::Toggle),
            "rm" => Self::position(rest).map(Command::Remove),
            "ls" | "" => Ok(Command::List),
            "dismiss" => Ok(Command::Dismiss),
            "signin" if !rest.is_empty() => Ok(Command::SignIn(rest.to_string())),
            "signin" => Err("usage: signin <user>".to_string()),
            "signout" => Ok(Command::SignOut),
            "help" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(format!("unknown command: {other}")),
        }
    }

    /// 1 始まりの行番号
    fn position(arg: &str) -> Result<usize, String> {
        match arg.parse::<usize>() {
            Ok(n) if n > 0 => Ok(n),
            _ => Err(format!("expected a line number, got '{arg}'")),
        }
    }
}

/// 一覧の読み込みと購読開始を待つ（描画前に使う）
async fn settle(app: &TodoApp) {
    let Some(user) = app.current_user() else {
        return;
    };
    let mut state = app.subscriber().watch();
    let ready = state.wait_for(|state| {
        state.owner_id() == Some(&user.id) && !matches!(state, SubscriptionState::Subscribing { .. })
    });
    if tokio::time::timeout(Duration::from_secs(2), ready).await.is_err() {
        debug!("一覧の読み込み完了を待たずに描画します");
    }
}

fn print_list(app: &TodoApp) {
    match app.route() {
        Route::SignIn => println!("Signed out. Use 'signin <user>' to continue."),
        Route::TodoList => print!(
            "{}",
            render(&app.store().snapshot(), app.current_user().as_ref())
        ),
    }
}

/// 表示上の行番号（1始まり）に対応するToDoのID
fn item_id_at(snapshot: &ListSnapshot, line: usize) -> Option<TodoId> {
    snapshot
        .items
        .get(line.checked_sub(1)?)
        .map(|item| item.id.clone())
}

async fn execute(app: &TodoApp, backend: &InMemoryBackend, command: Command) -> anyhow::Result<()> {
    let store = app.store();
    // 操作の失敗はストアのエラーバナーに表示される
    let outcome = match command {
        Command::Add(content) => {
            store.set_draft(content);
            store.submit_draft().await
        }
        Command::Toggle(n) => match item_id_at(&store.snapshot(), n) {
            Some(id) => store.toggle(&id).await,
            None => {
                println!("no todo at line {n}");
                return Ok(());
            }
        },
        Command::Remove(n) => match item_id_at(&store.snapshot(), n) {
            Some(id) => store.remove(&id).await,
            None => {
                println!("no todo at line {n}");
                return Ok(());
            }
        },
        Command::Dismiss => {
            store.dismiss_error();
            Ok(())
        }
        Command::SignIn(user) => {
            let identity = UserIdentity::new(UserId::from_string(user)?, None);
            let mut route = app.watch_route();
            backend.sign_in(identity);
            let signed_in = route.wait_for(|route| *route == Route::TodoList);
            if tokio::time::timeout(Duration::from_secs(2), signed_in).await.is_err() {
                warn!("サインインの反映を確認できませんでした");
            }
            settle(app).await;
            Ok(())
        }
        Command::SignOut => app.sign_out().await,
        Command::List | Command::Help | Command::Quit => Ok(()),
    };

    if let Err(e) = outcome {
        debug!(error = %e, "コマンドが失敗しました");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = init_tracing() {
        eprintln!("トレーシング初期化エラー: {e}");
    }

    let config = Config::from_env()?;
    info!(environment = %config.environment, "ToDoクライアントを起動します");
    if config.backend_url.is_some() {
        warn!("デモはインメモリバックエンドで動作します（TODO_BACKEND_URL は使用しません）");
    }

    let backend = Arc::new(InMemoryBackend::new(config.feed_capacity));
    let demo_user = UserIdentity::new(UserId::from_string(config.demo_user.clone())?, None);
    backend.set_session(Some(Session::new(demo_user, "demo-token")));

    let app = Arc::new(TodoApp::new(Collaborators::in_memory(backend.clone())));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let runner = {
        let app = app.clone();
        tokio::spawn(async move {
            app.run(async {
                let _ = shutdown_rx.await;
            })
            .await;
        })
    };

    let mut route = app.watch_route();
    if tokio::time::timeout(Duration::from_secs(2), route.wait_for(|r| *r == Route::TodoList))
        .await
        .is_err()
    {
        debug!("起動時のセッションがありません");
    }
    settle(&app).await;

    println!("{HELP}");
    print_list(&app);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        match command {
            Command::Quit => break,
            Command::Help => println!("{HELP}"),
            command => {
                execute(&app, &backend, command).await?;
                print_list(&app);
            }
        }
    }

    let _ = shutdown_tx.send(());
    runner.await?;
    info!("ToDoクライアントを終了しました");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse("add buy milk"),
            Ok(Command::Add("buy milk".to_string()))
        );
        assert_eq!(Command::parse("toggle 2"), Ok(Command::Toggle(2)));
        assert_eq!(Command::parse("rm 1"), Ok(Command::Remove(1)));
        assert_eq!(Command::parse("  ls  "), Ok(Command::List));
        assert_eq!(Command::parse("signin u2"), Ok(Command::SignIn("u2".to_string())));
        assert_eq!(Command::parse("quit"), Ok(Command::Quit));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Command::parse("toggle 0").is_err());
        assert!(Command::parse("rm x").is_err());
        assert!(Command::parse("signin").is_err());
        assert!(Command::parse("frobnicate").is_err());
    }

    #[test]
    fn test_item_id_at_line() {
        let owner = UserId::from_string("u1").unwrap();
        let now = chrono::Utc::now();
        let first = domain::TodoItem::optimistic(owner.clone(), "first", now).unwrap();
        let second = domain::TodoItem::optimistic(owner, "second", now).unwrap();
        let snapshot = ListSnapshot {
            items: vec![first.clone(), second.clone()],
            ..ListSnapshot::default()
        };

        assert_eq!(item_id_at(&snapshot, 1), Some(first.id));
        assert_eq!(item_id_at(&snapshot, 2), Some(second.id));
        assert_eq!(item_id_at(&snapshot, 3), None);
        assert_eq!(item_id_at(&snapshot, 0), None);
        assert_eq!(item_id_at(&ListSnapshot::default(), 1), None);
    }
}
