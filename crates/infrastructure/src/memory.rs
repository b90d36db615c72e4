//! プロセス内で完結するバックエンド
//!
//! 行の保存、セッション通知、所有者ごとの変更配信を1つの構造体で提供する。
//! デモ実行とテストで使い、失敗の注入とリクエストの一時停止ができる。

use crate::client::{
    channel_name, AuthProvider, ChangeFeed, FeedSubscription, Order, RowFilter, TodoTable,
};
use crate::models::RawChangePayload;
use async_trait::async_trait;
use chrono::Utc;
use domain::{ChangeEvent, NewTodo, TodoId, TodoItem, TodoPatch, UserId, UserIdentity};
use shared::{AuthChange, RemoteError, Session};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

/// 失敗を注入できる操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOperation {
    GetSession,
    SignOut,
    SelectAll,
    Insert,
    Update,
    Delete,
    Subscribe,
}

/// 所有者付きの変更通知（生ペイロードで配信する）
#[derive(Debug, Clone)]
struct ChangeNotice {
    owner_id: UserId,
    payload: RawChangePayload,
}

#[derive(Default)]
struct BackendState {
    rows: Vec<TodoItem>,
    session: Option<Session>,
    failures: HashMap<BackendOperation, VecDeque<RemoteError>>,
}

/// アクティブなフィード数を転送タスクの生存期間で数える
struct ActiveFeedGuard(Arc<AtomicUsize>);

impl ActiveFeedGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveFeedGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    auth_tx: broadcast::Sender<AuthChange>,
    changes_tx: broadcast::Sender<ChangeNotice>,
    active_feeds: Arc<AtomicUsize>,
    paused: watch::Sender<bool>,
    feed_capacity: usize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(64)
    }
}

impl InMemoryBackend {
    pub fn new(feed_capacity: usize) -> Self {
        let capacity = feed_capacity.max(1);
        let (auth_tx, _) = broadcast::channel(16);
        let (changes_tx, _) = broadcast::channel(capacity);
        let (paused, _) = watch::channel(false);

        Self {
            state: Mutex::new(BackendState::default()),
            auth_tx,
            changes_tx,
            active_feeds: Arc::new(AtomicUsize::new(0)),
            paused,
            feed_capacity: capacity,
        }
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 次回の呼び出しを失敗させる（複数回呼ぶと順に消費される）
    pub fn fail_next(&self, operation: BackendOperation, error: RemoteError) {
        self.state()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    fn take_failure(&self, operation: BackendOperation) -> Result<(), RemoteError> {
        match self
            .state()
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(error) => {
                debug!(?operation, error = %error, "注入された失敗を返します");
                Err(error)
            }
            None => Ok(()),
        }
    }

    /// テーブルへのリクエストを一時停止する（楽観的状態の観測用）
    pub fn pause_requests(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_requests(&self) {
        self.paused.send_replace(false);
    }

    async fn wait_until_resumed(&self) {
        let mut paused = self.paused.subscribe();
        while *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                break;
            }
        }
    }

    /// ユーザーをサインインさせ、SignedIn を通知する
    pub fn sign_in(&self, user: UserIdentity) -> Session {
        let session = Session::new(user, format!("token-{}", uuid::Uuid::new_v4()));
        self.state().session = Some(session.clone());
        info!(user_id = %session.user_id(), "サインインしました");
        let _ = self.auth_tx.send(AuthChange::signed_in(session.clone()));
        session
    }

    /// アクセストークンを更新し、TokenRefreshed を通知する
    pub fn refresh_token(&self) -> Option<Session> {
        let refreshed = {
            let mut state = self.state();
            let session = state.session.as_mut()?;
            session.access_token = format!("token-{}", uuid::Uuid::new_v4());
            session.clone()
        };
        let _ = self.auth_tx.send(AuthChange::token_refreshed(refreshed.clone()));
        Some(refreshed)
    }

    /// 通知なしでセッションを差し替える（起動時の状態を作るため）
    pub fn set_session(&self, session: Option<Session>) {
        self.state().session = session;
    }

    pub fn rows(&self) -> Vec<TodoItem> {
        self.state().rows.clone()
    }

    pub fn active_feeds(&self) -> usize {
        self.active_feeds.load(Ordering::SeqCst)
    }

    fn publish(&self, owner_id: &UserId, event: &ChangeEvent) {
        match RawChangePayload::from_event(event) {
            Ok(payload) => {
                // 購読者がいない場合の送信失敗は無視してよい
                let _ = self.changes_tx.send(ChangeNotice {
                    owner_id: owner_id.clone(),
                    payload,
                });
            }
            Err(e) => warn!(error = %e, "変更通知のエンコードに失敗しました"),
        }
    }
}

#[async_trait]
impl AuthProvider for InMemoryBackend {
    async fn get_session(&self) -> Result<Option<Session>, RemoteError> {
        self.take_failure(BackendOperation::GetSession)?;
        let now = Utc::now();
        Ok(self
            .state()
            .session
            .clone()
            .filter(|session| !session.is_expired(now)))
    }

    fn on_auth_state_change(&self) -> broadcast::Receiver<AuthChange> {
        self.auth_tx.subscribe()
    }

    async fn sign_out(&self) -> Result<(), RemoteError> {
        self.take_failure(BackendOperation::SignOut)?;
        let previous = self.state().session.take();
        if let Some(session) = previous {
            info!(user_id = %session.user_id(), "サインアウトしました");
        }
        let _ = self.auth_tx.send(AuthChange::signed_out());
        Ok(())
    }
}

#[async_trait]
impl TodoTable for InMemoryBackend {
    async fn select_all(
        &self,
        filter: &RowFilter,
        order: Order,
    ) -> Result<Vec<TodoItem>, RemoteError> {
        self.wait_until_resumed().await;
        self.take_failure(BackendOperation::SelectAll)?;

        let mut rows: Vec<TodoItem> = self
            .state()
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();
        order.sort(&mut rows);
        Ok(rows)
    }

    async fn insert(&self, record: &NewTodo) -> Result<Option<TodoItem>, RemoteError> {
        self.wait_until_resumed().await;
        self.take_failure(BackendOperation::Insert)?;

        let now = Utc::now();
        let id = TodoId::from_string(uuid::Uuid::new_v4().to_string())
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        let row = TodoItem {
            id,
            content: record.content.clone(),
            completed: false,
            owner_id: record.owner_id.clone(),
            created_at: now,
            updated_at: now,
        };

        self.state().rows.push(row.clone());
        self.publish(
            &row.owner_id,
            &ChangeEvent::Insert {
                record: row.clone(),
            },
        );
        Ok(Some(row))
    }

    async fn update(&self, patch: &TodoPatch, filter: &RowFilter) -> Result<(), RemoteError> {
        self.wait_until_resumed().await;
        self.take_failure(BackendOperation::Update)?;

        let now = Utc::now();
        let updated: Vec<TodoItem> = {
            let mut state = self.state();
            state
                .rows
                .iter_mut()
                .filter(|row| filter.matches(row))
                .map(|row| {
                    patch.apply_to(row, now);
                    row.clone()
                })
                .collect()
        };

        for row in updated {
            self.publish(
                &row.owner_id,
                &ChangeEvent::Update {
                    record: row.clone(),
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, filter: &RowFilter) -> Result<(), RemoteError> {
        self.wait_until_resumed().await;
        self.take_failure(BackendOperation::Delete)?;

        let removed: Vec<TodoItem> = {
            let mut state = self.state();
            let (removed, kept): (Vec<TodoItem>, Vec<TodoItem>) = std::mem::take(&mut state.rows)
                .into_iter()
                .partition(|row| filter.matches(row));
            state.rows = kept;
            removed
        };

        for row in removed {
            self.publish(&row.owner_id, &ChangeEvent::Delete { id: row.id });
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe(&self, filter: &RowFilter) -> Result<FeedSubscription, RemoteError> {
        self.take_failure(BackendOperation::Subscribe)?;

        let owner_id = filter.owner_id.clone();
        let channel = channel_name(&owner_id);
        let mut notices = self.changes_tx.subscribe();
        let (events_tx, events_rx) = mpsc::channel(self.feed_capacity);
        let guard = ActiveFeedGuard::new(self.active_feeds.clone());

        let task_channel = channel.clone();
        let forwarder = tokio::spawn(async move {
            let _guard = guard;
            loop {
                match notices.recv().await {
                    Ok(notice) if notice.owner_id == owner_id => {
                        let event = match notice.payload.into_change_event() {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(channel = %task_channel, error = %e, "変更通知をデコードできません");
                                continue;
                            }
                        };
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %task_channel, skipped, "変更通知が溢れました");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(channel = %task_channel, "フィード転送タスクを終了します");
        });

        info!(channel = %channel, "ライブフィードを開始しました");
        Ok(FeedSubscription::new(channel, events_rx, Some(forwarder)))
    }
}
