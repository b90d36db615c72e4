//! ライブフィードの購読管理
//!
//! 所有者ごとに1本だけフィードを開き、届いた変更をそのままストアへ渡す。

use crate::list_store::ListStore;
use domain::UserId;
use infrastructure::{ChangeFeed, FeedSubscription, RowFilter};
use shared::telemetry::trace_remote_operation;
use shared::{AppError, RemoteError};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 購読の状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing { owner_id: UserId },
    Active { owner_id: UserId, channel: String },
    Error { owner_id: UserId, message: String },
}

impl SubscriptionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SubscriptionState::Active { .. })
    }

    pub fn owner_id(&self) -> Option<&UserId> {
        match self {
            SubscriptionState::Unsubscribed => None,
            SubscriptionState::Subscribing { owner_id }
            | SubscriptionState::Active { owner_id, .. }
            | SubscriptionState::Error { owner_id, .. } => Some(owner_id),
        }
    }
}

struct ActiveFeed {
    owner_id: UserId,
    stop: oneshot::Sender<()>,
    pump: JoinHandle<()>,
}

pub struct ChangeSubscriber {
    feed: Arc<dyn ChangeFeed>,
    store: Arc<ListStore>,
    active: Mutex<Option<ActiveFeed>>,
    state: Arc<watch::Sender<SubscriptionState>>,
}

impl ChangeSubscriber {
    pub fn new(feed: Arc<dyn ChangeFeed>, store: Arc<ListStore>) -> Self {
        let (state, _) = watch::channel(SubscriptionState::Unsubscribed);
        Self {
            feed,
            store,
            active: Mutex::new(None),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// 所有者のフィードを開く。別の所有者のフィードがあれば先に閉じる
    pub async fn attach(&self, owner_id: &UserId) -> Result<(), AppError> {
        self.attach_while(owner_id, || true).await
    }

    /// `is_current` が真の間だけフィードを開く
    ///
    /// 判定は購読の排他区間の中で購読開始の前後に行う。途中で偽になれば
    /// 開いたフィードを閉じ、エラーは報告しない。
    pub async fn attach_while<F>(&self, owner_id: &UserId, is_current: F) -> Result<(), AppError>
    where
        F: Fn() -> bool,
    {
        let mut active = self.active.lock().await;
        if !is_current() {
            debug!(owner_id = %owner_id, "対象ユーザーが切り替わったため購読しません");
            return Ok(());
        }

        if let Some(current) = active.as_ref() {
            if &current.owner_id == owner_id && !current.pump.is_finished() {
                debug!(owner_id = %owner_id, "同じ所有者のフィードが有効です");
                return Ok(());
            }
        }
        if let Some(previous) = active.take() {
            Self::stop_feed(previous).await;
        }

        self.state.send_replace(SubscriptionState::Subscribing {
            owner_id: owner_id.clone(),
        });

        let filter = RowFilter::owner(owner_id.clone());
        let subscription = match trace_remote_operation(
            "subscribe",
            Some(owner_id.as_str()),
            self.feed.subscribe(&filter),
        )
        .await
        {
            Ok(subscription) => subscription,
            Err(_) if !is_current() => {
                self.state.send_replace(SubscriptionState::Unsubscribed);
                return Ok(());
            }
            Err(e) => {
                let app_error = AppError::subscription(&e);
                self.state.send_replace(SubscriptionState::Error {
                    owner_id: owner_id.clone(),
                    message: e.to_string(),
                });
                self.store.report(app_error.clone());
                return Err(app_error);
            }
        };

        if !is_current() {
            debug!(owner_id = %owner_id, "購読開始中に対象ユーザーが切り替わりました");
            self.feed.unsubscribe(subscription).await;
            self.state.send_replace(SubscriptionState::Unsubscribed);
            return Ok(());
        }

        let channel = subscription.channel().to_string();
        self.state.send_replace(SubscriptionState::Active {
            owner_id: owner_id.clone(),
            channel: channel.clone(),
        });
        info!(owner_id = %owner_id, channel = %channel, "変更の購読を開始しました");

        let (stop, stopped) = oneshot::channel();
        let pump = tokio::spawn(Self::pump(
            self.feed.clone(),
            self.store.clone(),
            self.state.clone(),
            owner_id.clone(),
            subscription,
            stopped,
        ));

        *active = Some(ActiveFeed {
            owner_id: owner_id.clone(),
            stop,
            pump,
        });
        Ok(())
    }

    /// フィードを閉じる。以後の通知はストアに届かない
    pub async fn detach(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            let owner_id = previous.owner_id.clone();
            Self::stop_feed(previous).await;
            info!(owner_id = %owner_id, "変更の購読を終了しました");
        }
        self.state.send_replace(SubscriptionState::Unsubscribed);
    }

    async fn stop_feed(feed: ActiveFeed) {
        // ポンプが既に終了していれば送信は失敗してよい
        let _ = feed.stop.send(());
        if let Err(e) = feed.pump.await {
            if !e.is_cancelled() {
                warn!(owner_id = %feed.owner_id, error = %e, "購読タスクが異常終了しました");
            }
        }
    }

    async fn pump(
        feed: Arc<dyn ChangeFeed>,
        store: Arc<ListStore>,
        state: Arc<watch::Sender<SubscriptionState>>,
        owner_id: UserId,
        mut subscription: FeedSubscription,
        mut stopped: oneshot::Receiver<()>,
    ) {
        let closed_by_remote = loop {
            tokio::select! {
                _ = &mut stopped => break false,
                event = subscription.next() => match event {
                    Some(event) => {
                        debug!(owner_id = %owner_id, kind = %event.kind(), todo_id = %event.todo_id(), "変更を受信しました");
                        store.apply_change(&owner_id, event);
                    }
                    None => break true,
                },
            }
        };

        let channel = subscription.channel().to_string();
        feed.unsubscribe(subscription).await;

        if closed_by_remote {
            let error = RemoteError::Closed(channel);
            warn!(owner_id = %owner_id, error = %error, "フィードが予期せず閉じられました");
            state.send_replace(SubscriptionState::Error {
                owner_id,
                message: error.to_string(),
            });
            store.report(AppError::subscription(&error));
        }
    }
}

impl Drop for ChangeSubscriber {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_owner() {
        let owner = UserId::from_string("u1").unwrap();
        assert_eq!(SubscriptionState::Unsubscribed.owner_id(), None);

        let active = SubscriptionState::Active {
            owner_id: owner.clone(),
            channel: "todos-channel-u1".to_string(),
        };
        assert!(active.is_active());
        assert_eq!(active.owner_id(), Some(&owner));

        let error = SubscriptionState::Error {
            owner_id: owner.clone(),
            message: "closed".to_string(),
        };
        assert!(!error.is_active());
    }
}
