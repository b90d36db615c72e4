//! 認証状態の追跡

use domain::UserIdentity;
use infrastructure::AuthProvider;
use shared::telemetry::{record_app_error, trace_remote_operation};
use shared::{AppError, AuthChange, AuthEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 認証状態変化の通知（イベント発生時点のユーザーを運ぶ）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub event: AuthEvent,
    pub identity: Option<UserIdentity>,
}

impl From<AuthChange> for SessionChange {
    fn from(change: AuthChange) -> Self {
        let identity = change.identity().cloned();
        Self {
            event: change.event,
            identity,
        }
    }
}

pub struct SessionTracker {
    auth: Arc<dyn AuthProvider>,
}

impl SessionTracker {
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        Self { auth }
    }

    /// 現在のユーザーを取得する。確認に失敗した場合はサインアウト扱い
    pub async fn current_session(&self) -> Option<UserIdentity> {
        match trace_remote_operation("get_session", None, self.auth.get_session()).await {
            Ok(session) => session.map(|session| session.user),
            Err(e) => {
                record_app_error(&AppError::session(&e), "current_session");
                None
            }
        }
    }

    /// 認証状態の変化ごとにハンドラを呼び出す
    ///
    /// 取りこぼした通知は再送せず読み飛ばす。返されたハンドルで登録を解除する。
    pub fn on_session_change<F>(&self, handler: F) -> SessionListener
    where
        F: Fn(SessionChange) + Send + 'static,
    {
        let mut changes = self.auth.on_auth_state_change();
        let task = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(change) => {
                        debug!(event = ?change.event, "認証状態の変化を受信しました");
                        handler(SessionChange::from(change));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "古い認証通知を読み飛ばしました");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("認証状態の監視を終了します");
        });

        SessionListener { task: Some(task) }
    }

    pub async fn sign_out(&self) -> Result<(), AppError> {
        trace_remote_operation("sign_out", None, self.auth.sign_out())
            .await
            .map_err(|e| {
                let app_error = AppError::session(&e);
                record_app_error(&app_error, "sign_out");
                app_error
            })?;
        info!("サインアウトを要求しました");
        Ok(())
    }
}

/// 認証状態監視の登録ハンドル。ドロップでも解除される
#[derive(Debug)]
pub struct SessionListener {
    task: Option<JoinHandle<()>>,
}

impl SessionListener {
    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for SessionListener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
