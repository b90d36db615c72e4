//! ホスト型バックエンドとの協調インターフェース
//!
//! 認証・データストア・ライブフィードの3つをトレイトとして定義し、
//! アプリケーション側には `Arc<dyn _>` で注入する。

use async_trait::async_trait;
use domain::{ChangeEvent, NewTodo, TodoId, TodoItem, TodoPatch, UserId};
use shared::{AuthChange, RemoteError, Session};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// スコープ付きリモート操作のフィルタ。所有者は常に必須
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub owner_id: UserId,
    pub id: Option<TodoId>,
}

impl RowFilter {
    /// 所有者の全行
    pub fn owner(owner_id: UserId) -> Self {
        Self { owner_id, id: None }
    }

    /// 所有者の特定行
    pub fn row(id: TodoId, owner_id: UserId) -> Self {
        Self {
            owner_id,
            id: Some(id),
        }
    }

    pub fn matches(&self, item: &TodoItem) -> bool {
        item.owner_id == self.owner_id && self.id.as_ref().map_or(true, |id| &item.id == id)
    }
}

/// 一覧取得の並び順
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Order {
    #[default]
    CreatedAtDesc,
    CreatedAtAsc,
}

impl Order {
    /// PostgREST の order パラメータ表現
    pub fn as_query(&self) -> &'static str {
        match self {
            Order::CreatedAtDesc => "created_at.desc",
            Order::CreatedAtAsc => "created_at.asc",
        }
    }

    /// 安定ソートで並べ替える（同時刻の行は元の順序を保つ）
    pub fn sort(&self, items: &mut [TodoItem]) {
        match self {
            Order::CreatedAtDesc => items.sort_by(TodoItem::display_order),
            Order::CreatedAtAsc => items.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        }
    }
}

/// 認証プロバイダー
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// 現在のセッションを取得（なければ None）
    async fn get_session(&self) -> Result<Option<Session>, RemoteError>;

    /// 認証状態変化の受信口を登録する。受信側をドロップすると登録解除になる
    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthChange>;

    async fn sign_out(&self) -> Result<(), RemoteError>;
}

/// ToDoテーブル
#[async_trait]
pub trait TodoTable: Send + Sync {
    async fn select_all(&self, filter: &RowFilter, order: Order)
        -> Result<Vec<TodoItem>, RemoteError>;

    /// 作成して確定レコードを返す（表現を返さないバックエンドでは None）
    async fn insert(&self, record: &NewTodo) -> Result<Option<TodoItem>, RemoteError>;

    async fn update(&self, patch: &TodoPatch, filter: &RowFilter) -> Result<(), RemoteError>;

    async fn delete(&self, filter: &RowFilter) -> Result<(), RemoteError>;
}

/// ライブフィード
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// フィルタに一致する挿入・更新・削除を購読する
    async fn subscribe(&self, filter: &RowFilter) -> Result<FeedSubscription, RemoteError>;

    async fn unsubscribe(&self, subscription: FeedSubscription) {
        subscription.close().await;
    }
}

/// 購読チャンネル名
pub fn channel_name(owner_id: &UserId) -> String {
    format!("todos-channel-{owner_id}")
}

/// ライブフィードの購読ハンドル。ドロップ時に転送タスクを停止する
#[derive(Debug)]
pub struct FeedSubscription {
    channel: String,
    events: mpsc::Receiver<ChangeEvent>,
    forwarder: Option<JoinHandle<()>>,
}

impl FeedSubscription {
    pub fn new(
        channel: impl Into<String>,
        events: mpsc::Receiver<ChangeEvent>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            channel: channel.into(),
            events,
            forwarder,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// 次の変更通知を待つ。フィードが閉じられたら None
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// フィードを閉じ、転送タスクの終了まで待つ
    pub async fn close(mut self) {
        self.events.close();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            let _ = forwarder.await;
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
