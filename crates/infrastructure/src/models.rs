use chrono::{DateTime, Utc};
use domain::{ChangeEvent, ChangeKind, DomainError, NewTodo, TodoId, TodoItem, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// todos テーブルの行（バックエンドのワイヤ表現）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoRow {
    pub id: String,
    pub content: String,
    pub completed: bool,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TodoItem> for TodoRow {
    fn from(item: &TodoItem) -> Self {
        Self {
            id: item.id.as_str().to_string(),
            content: item.content.clone(),
            completed: item.completed,
            user_id: item.owner_id.as_str().to_string(),
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}

impl TryFrom<TodoRow> for TodoItem {
    type Error = DomainError;

    fn try_from(row: TodoRow) -> Result<Self, Self::Error> {
        Ok(TodoItem {
            id: TodoId::from_string(row.id)?,
            content: row.content,
            completed: row.completed,
            owner_id: UserId::from_string(row.user_id)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// 作成リクエストの行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertRow {
    pub content: String,
    pub user_id: String,
}

impl From<&NewTodo> for InsertRow {
    fn from(record: &NewTodo) -> Self {
        Self {
            content: record.content.clone(),
            user_id: record.owner_id.as_str().to_string(),
        }
    }
}

/// ライブフィードの生ペイロード
///
/// ```json
/// {"eventType": "DELETE", "new": {}, "old": {"id": "42"}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChangePayload {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChangePayload {
    /// ドメインイベントから生ペイロードを作成
    pub fn from_event(event: &ChangeEvent) -> Result<Self, DomainError> {
        let encode = |item: &TodoItem| {
            serde_json::to_value(TodoRow::from(item))
                .map_err(|e| DomainError::InvalidEvent(e.to_string()))
        };

        let (new, old) = match event {
            ChangeEvent::Insert { record } | ChangeEvent::Update { record } => {
                (Some(encode(record)?), None)
            }
            ChangeEvent::Delete { id } => (None, Some(serde_json::json!({ "id": id.as_str() }))),
        };

        Ok(Self {
            event_type: event.kind().as_str().to_string(),
            new,
            old,
        })
    }

    /// 生ペイロードをドメインイベントに変換
    pub fn into_change_event(self) -> Result<ChangeEvent, DomainError> {
        match ChangeKind::from_string(&self.event_type)? {
            ChangeKind::Insert => Ok(ChangeEvent::Insert {
                record: decode_record(self.new)?,
            }),
            ChangeKind::Update => Ok(ChangeEvent::Update {
                record: decode_record(self.new)?,
            }),
            ChangeKind::Delete => {
                let id = self
                    .old
                    .as_ref()
                    .and_then(|old| old.get("id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        DomainError::InvalidEvent("DELETE payload without old.id".to_string())
                    })?;
                Ok(ChangeEvent::Delete {
                    id: TodoId::from_string(id)?,
                })
            }
        }
    }
}

fn decode_record(value: Option<Value>) -> Result<TodoItem, DomainError> {
    let value =
        value.ok_or_else(|| DomainError::InvalidEvent("payload without new record".to_string()))?;
    let row: TodoRow =
        serde_json::from_value(value).map_err(|e| DomainError::InvalidEvent(e.to_string()))?;
    TodoItem::try_from(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row_json() -> Value {
        json!({
            "id": "42",
            "content": "buy milk",
            "completed": false,
            "user_id": "u1",
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-01T10:00:00Z"
        })
    }

    #[test]
    fn test_decode_insert_payload() {
        let raw: RawChangePayload = serde_json::from_value(json!({
            "eventType": "INSERT",
            "new": row_json(),
            "old": {}
        }))
        .unwrap();

        let event = raw.into_change_event().unwrap();
        match event {
            ChangeEvent::Insert { record } => {
                assert_eq!(record.id.as_str(), "42");
                assert_eq!(record.owner_id.as_str(), "u1");
                assert_eq!(record.content, "buy milk");
            }
            other => panic!("Expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_delete_payload() {
        let raw: RawChangePayload = serde_json::from_value(json!({
            "eventType": "DELETE",
            "old": {"id": "42"}
        }))
        .unwrap();

        assert_eq!(
            raw.into_change_event().unwrap(),
            ChangeEvent::Delete {
                id: TodoId::from_string("42").unwrap()
            }
        );
    }

    #[test]
    fn test_decode_rejects_malformed_payloads() {
        let missing_old = RawChangePayload {
            event_type: "DELETE".to_string(),
            new: None,
            old: Some(json!({})),
        };
        assert!(missing_old.into_change_event().is_err());

        let unknown = RawChangePayload {
            event_type: "TRUNCATE".to_string(),
            new: None,
            old: None,
        };
        assert!(unknown.into_change_event().is_err());

        let mut bad_row = row_json();
        bad_row["user_id"] = json!("");
        let empty_owner = RawChangePayload {
            event_type: "UPDATE".to_string(),
            new: Some(bad_row),
            old: None,
        };
        assert!(matches!(
            empty_owner.into_change_event(),
            Err(DomainError::InvalidUserId(_))
        ));
    }

    #[test]
    fn test_payload_from_event_uses_wire_names() {
        let row: TodoRow = serde_json::from_value(row_json()).unwrap();
        let item = TodoItem::try_from(row).unwrap();

        let raw = RawChangePayload::from_event(&ChangeEvent::Update {
            record: item.clone(),
        })
        .unwrap();
        assert_eq!(raw.event_type, "UPDATE");
        assert_eq!(raw.new.as_ref().unwrap()["user_id"], "u1");
        assert_eq!(
            raw.into_change_event().unwrap(),
            ChangeEvent::Update { record: item }
        );
    }
}
