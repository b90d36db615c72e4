use crate::errors::DomainError;
use crate::user::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// 楽観的作成中の仮IDに付くプレフィックス
pub const TEMPORARY_ID_PREFIX: &str = "temp-";

/// ToDo本文の最大文字数
pub const MAX_CONTENT_LENGTH: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TodoId(String);

impl TodoId {
    /// 楽観的作成用の仮IDを生成（サーバー確定IDに置き換わるまで有効）
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{}", ulid::Ulid::new()))
    }

    /// サーバーが払い出したIDから作成
    pub fn from_string(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(DomainError::InvalidTodoId(
                "Todo ID cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 仮IDかどうか
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }
}

impl std::fmt::Display for TodoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: TodoId,
    pub content: String,
    pub completed: bool,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TodoItem {
    /// 楽観的更新用のToDoを作成する。IDは仮ID、未完了で作成される
    pub fn optimistic(
        owner_id: UserId,
        content: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let content = validate_content(content)?;

        Ok(Self {
            id: TodoId::temporary(),
            content,
            completed: false,
            owner_id,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_owned_by(&self, owner_id: &UserId) -> bool {
        &self.owner_id == owner_id
    }

    /// 一覧の並び順（created_at 降順）で比較する
    pub fn display_order(&self, other: &TodoItem) -> Ordering {
        other.created_at.cmp(&self.created_at)
    }
}

/// 本文をトリムして検証する
pub fn validate_content(content: &str) -> Result<String, DomainError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(DomainError::Validation(
            "Todo content cannot be empty".to_string(),
        ));
    }
    if trimmed.chars().count() > MAX_CONTENT_LENGTH {
        return Err(DomainError::Validation(format!(
            "Todo content cannot exceed {MAX_CONTENT_LENGTH} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// 作成リクエスト（IDとタイムスタンプはリモート側で払い出される）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTodo {
    pub content: String,
    pub owner_id: UserId,
}

impl NewTodo {
    pub fn from_item(item: &TodoItem) -> Self {
        Self {
            content: item.content.clone(),
            owner_id: item.owner_id.clone(),
        }
    }
}

/// 更新パッチ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

impl TodoPatch {
    pub fn completed(completed: bool) -> Self {
        Self {
            completed: Some(completed),
        }
    }

    /// パッチをToDoに適用
    pub fn apply_to(&self, item: &mut TodoItem, now: DateTime<Utc>) {
        if let Some(completed) = self.completed {
            item.completed = completed;
        }
        item.updated_at = now;
    }
}
