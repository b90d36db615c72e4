use domain::{ChangeEvent, NewTodo, TodoPatch, UserId};
use infrastructure::{ChangeFeed, InMemoryBackend, Order, RestTodoTable, RowFilter, TodoTable};
use shared::RemoteError;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// 統合テスト用のセットアップ（ローカルの PostgREST 互換バックエンドを想定）
fn setup_rest_table() -> (RestTodoTable, UserId) {
    let base_url =
        std::env::var("TODO_BACKEND_URL").unwrap_or_else(|_| "http://localhost:54321".to_string());
    let api_key = std::env::var("TODO_ANON_KEY").unwrap_or_else(|_| "anon".to_string());
    let table = RestTodoTable::new(base_url, "todos", api_key);

    let owner = UserId::from_string(format!("test_user_{}", unique_suffix())).unwrap();
    (table, owner)
}

fn unique_suffix() -> String {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default().to_string()
}

/// REST テーブルの作成・更新・削除の往復
#[tokio::test]
async fn test_rest_table_round_trip() {
    let (table, owner) = setup_rest_table();
    let filter = RowFilter::owner(owner.clone());

    match table.select_all(&filter, Order::CreatedAtDesc).await {
        Ok(rows) => {
            println!("✓ 一覧取得成功");
            assert!(rows.iter().all(|row| row.owner_id == owner));

            let created = table
                .insert(&NewTodo {
                    content: "統合テストToDo".to_string(),
                    owner_id: owner.clone(),
                })
                .await;

            match created {
                Ok(Some(row)) => {
                    println!("✓ 作成成功: {}", row.id);
                    let row_filter = RowFilter::row(row.id.clone(), owner.clone());
                    let updated = table.update(&TodoPatch::completed(true), &row_filter).await;
                    let deleted = table.delete(&row_filter).await;
                    match (updated, deleted) {
                        (Ok(()), Ok(())) => println!("✓ 更新・削除成功"),
                        (update, delete) => {
                            println!("⚠ 更新・削除スキップ: {:?} / {:?}", update, delete)
                        }
                    }
                }
                Ok(None) => println!("⚠ 表現が返されないためスキップ"),
                Err(e) => println!("⚠ 作成スキップ (行レベルセキュリティ?): {}", e),
            }
        }
        Err(RemoteError::Network(e)) => {
            println!("⚠ 統合テストスキップ (ローカルバックエンド未起動?): {}", e)
        }
        Err(e) => println!("⚠ 統合テストスキップ: {}", e),
    }
}

/// 同時作成がすべてフィードに届くこと
#[tokio::test]
async fn test_concurrent_inserts_reach_feed() {
    let backend = Arc::new(InMemoryBackend::default());
    let owner = UserId::from_string("u1").unwrap();
    let mut feed = backend
        .subscribe(&RowFilter::owner(owner.clone()))
        .await
        .unwrap();

    let inserts = (0..5).map(|n| {
        let backend = backend.clone();
        let owner = owner.clone();
        async move {
            backend
                .insert(&NewTodo {
                    content: format!("todo {n}"),
                    owner_id: owner,
                })
                .await
        }
    });
    let results = futures::future::join_all(inserts).await;
    assert!(results.iter().all(|result| matches!(result, Ok(Some(_)))));

    let mut received = 0;
    while received < 5 {
        match timeout(Duration::from_secs(1), feed.next()).await {
            Ok(Some(ChangeEvent::Insert { .. })) => received += 1,
            other => panic!("フィードからの挿入通知が不足しています: {other:?}"),
        }
    }

    let rows = backend
        .select_all(&RowFilter::owner(owner), Order::CreatedAtDesc)
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
}

/// 購読解除でフィードが解放される
#[tokio::test]
async fn test_unsubscribe_releases_feed() {
    let backend = InMemoryBackend::default();
    let owner = UserId::from_string("u1").unwrap();

    let feed = backend
        .subscribe(&RowFilter::owner(owner.clone()))
        .await
        .unwrap();
    assert_eq!(backend.active_feeds(), 1);
    backend.unsubscribe(feed).await;
    assert_eq!(backend.active_feeds(), 0);

    // 購読者がいなくても書き込みは成功する
    backend
        .insert(&NewTodo {
            content: "after".to_string(),
            owner_id: owner,
        })
        .await
        .unwrap();
    assert_eq!(backend.rows().len(), 1);
}
