//! アプリケーションコンテキスト
//!
//! 協調サービスのクライアントを受け取り、セッション・一覧・購読の3部品と
//! 画面遷移をまとめて管理する。

use crate::list_store::ListStore;
use crate::session::{SessionChange, SessionListener, SessionTracker};
use crate::subscriber::ChangeSubscriber;
use domain::UserIdentity;
use infrastructure::{AuthProvider, ChangeFeed, InMemoryBackend, TodoTable};
use shared::{AppError, AuthEvent};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// 表示中の画面
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SignIn,
    TodoList,
}

/// 注入する協調サービスのクライアント
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthProvider>,
    pub table: Arc<dyn TodoTable>,
    pub feed: Arc<dyn ChangeFeed>,
}

impl Collaborators {
    /// 1つのインメモリバックエンドで3つすべてを賄う
    pub fn in_memory(backend: Arc<InMemoryBackend>) -> Self {
        Self {
            auth: backend.clone(),
            table: backend.clone(),
            feed: backend,
        }
    }
}

pub struct TodoApp {
    session: SessionTracker,
    store: Arc<ListStore>,
    subscriber: ChangeSubscriber,
    user: watch::Sender<Option<UserIdentity>>,
    route: watch::Sender<Route>,
    /// サインイン・サインアウトのたびに進める。古い切り替え処理の後続を止める
    generation: AtomicU64,
}

impl TodoApp {
    pub fn new(collaborators: Collaborators) -> Self {
        let store = Arc::new(ListStore::new(collaborators.table));
        let (user, _) = watch::channel(None);
        let (route, _) = watch::channel(Route::SignIn);

        Self {
            session: SessionTracker::new(collaborators.auth),
            subscriber: ChangeSubscriber::new(collaborators.feed, store.clone()),
            store,
            user,
            route,
            generation: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<ListStore> {
        &self.store
    }

    pub fn subscriber(&self) -> &ChangeSubscriber {
        &self.subscriber
    }

    pub fn session(&self) -> &SessionTracker {
        &self.session
    }

    pub fn route(&self) -> Route {
        *self.route.borrow()
    }

    pub fn watch_route(&self) -> watch::Receiver<Route> {
        self.route.subscribe()
    }

    pub fn current_user(&self) -> Option<UserIdentity> {
        self.user.borrow().clone()
    }

    /// 起動時のセッション確認
    pub async fn start(&self) -> Route {
        let identity = self.session.current_session().await;
        self.apply_identity(identity).await;
        self.route()
    }

    /// 認証状態の変化を反映する
    pub async fn handle_session(&self, change: SessionChange) {
        debug!(event = ?change.event, "認証状態の変化を反映します");

        if change.event == AuthEvent::TokenRefreshed {
            let same_user = match (&change.identity, self.user.borrow().as_ref()) {
                (Some(next), Some(current)) => next.id == current.id,
                _ => false,
            };
            if same_user {
                // 同じユーザーのトークン更新では再取得しない
                self.user.send_replace(change.identity);
                return;
            }
        }

        self.apply_identity(change.identity).await;
    }

    async fn apply_identity(&self, identity: Option<UserIdentity>) {
        match identity {
            Some(identity) => self.activate(identity).await,
            None => self.deactivate().await,
        }
    }

    /// 一覧を読み込み、フィードを開いて一覧画面へ遷移する
    async fn activate(&self, identity: UserIdentity) {
        let owner_id = identity.id.clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(user_id = %owner_id, "ユーザーの一覧を開きます");

        self.user.send_replace(Some(identity));
        self.route.send_replace(Route::TodoList);

        self.store.rescope(&owner_id);
        // 失敗はストアのエラーとして表示済み
        if let Err(e) = self.store.load_all(&owner_id).await {
            warn!(user_id = %owner_id, error = %e, "初回の一覧取得に失敗しました");
        }
        if !self.is_current(generation) {
            debug!(user_id = %owner_id, "読み込み中に切り替わったため購読しません");
            return;
        }

        let attached = self
            .subscriber
            .attach_while(&owner_id, || self.is_current(generation))
            .await;
        if let Err(e) = attached {
            warn!(user_id = %owner_id, error = %e, "変更の購読を開始できませんでした");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// ユーザー単位の状態を破棄してサインイン画面へ戻る
    async fn deactivate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.subscriber.detach().await;
        self.store.reset();
        self.user.send_replace(None);
        self.route.send_replace(Route::SignIn);
        info!("サインイン画面へ戻ります");
    }

    /// サインアウトを要求し、通知を待たずに状態を破棄する
    pub async fn sign_out(&self) -> Result<(), AppError> {
        let result = self.session.sign_out().await;
        self.deactivate().await;
        result
    }

    /// 認証状態の監視を登録する。通知はチャネル経由で `handle_session` に渡す
    pub fn listen(&self) -> (SessionListener, mpsc::UnboundedReceiver<SessionChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.session.on_session_change(move |change| {
            // 受信側が終了済みなら捨ててよい
            let _ = tx.send(change);
        });
        (listener, rx)
    }

    /// 停止要求まで認証状態の変化を処理し続ける
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let (mut listener, mut changes) = self.listen();
        self.start().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                change = changes.recv() => match change {
                    Some(change) => self.handle_session(change).await,
                    None => break,
                },
            }
        }

        listener.unsubscribe();
        self.subscriber.detach().await;
        debug!("アプリケーションを終了します");
    }
}
