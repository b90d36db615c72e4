use crate::errors::DomainError;
use crate::todo::{TodoId, TodoItem};
use crate::user::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ライブフィードで購読する変更の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }

    /// 文字列から変更種別を作成（大文字小文字は区別しない）
    pub fn from_string(kind: &str) -> Result<Self, DomainError> {
        match kind.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            _ => Err(DomainError::InvalidEvent(format!(
                "Unknown change kind: {kind}"
            ))),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// リモートストアから届く変更通知
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ChangeEvent {
    Insert { record: TodoItem },
    Update { record: TodoItem },
    Delete { id: TodoId },
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Insert { .. } => ChangeKind::Insert,
            ChangeEvent::Update { .. } => ChangeKind::Update,
            ChangeEvent::Delete { .. } => ChangeKind::Delete,
        }
    }

    /// 変更対象のToDo ID
    pub fn todo_id(&self) -> &TodoId {
        match self {
            ChangeEvent::Insert { record } | ChangeEvent::Update { record } => &record.id,
            ChangeEvent::Delete { id } => id,
        }
    }

    /// 変更されたレコード（削除イベントには含まれない）
    pub fn record(&self) -> Option<&TodoItem> {
        match self {
            ChangeEvent::Insert { record } | ChangeEvent::Update { record } => Some(record),
            ChangeEvent::Delete { .. } => None,
        }
    }

    /// 購読者のスコープに属するイベントかを検証
    pub fn validate_owner(&self, owner_id: &UserId) -> Result<(), DomainError> {
        match self.record() {
            Some(record) if !record.is_owned_by(owner_id) => Err(DomainError::OwnerMismatch {
                expected: owner_id.to_string(),
                actual: record.owner_id.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
