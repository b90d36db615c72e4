use chrono::{DateTime, Utc};
use domain::{UserId, UserIdentity};
use serde::{Deserialize, Serialize};

/// 認証プロバイダーが保持するセッション
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: UserIdentity,
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(user: UserIdentity, access_token: impl Into<String>) -> Self {
        Self {
            user,
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    /// 有効期限切れかどうか（期限なしは常に有効）
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// 認証状態変化の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// 認証状態変化の通知。イベント発生時点のセッションを保持する
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

impl AuthChange {
    pub fn signed_in(session: Session) -> Self {
        Self {
            event: AuthEvent::SignedIn,
            session: Some(session),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            event: AuthEvent::SignedOut,
            session: None,
        }
    }

    pub fn token_refreshed(session: Session) -> Self {
        Self {
            event: AuthEvent::TokenRefreshed,
            session: Some(session),
        }
    }

    /// 通知に含まれるユーザー（サインアウト時は None）
    pub fn identity(&self) -> Option<&UserIdentity> {
        self.session.as_ref().map(|session| &session.user)
    }
}
