use crate::client::{Order, RowFilter, TodoTable};
use crate::models::{InsertRow, TodoRow};
use async_trait::async_trait;
use domain::{NewTodo, TodoItem, TodoPatch};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use shared::{AppError, Config, RemoteError};
use std::sync::RwLock;
use tracing::debug;

/// PostgREST 互換APIのToDoテーブル
pub struct RestTodoTable {
    http: reqwest::Client,
    base_url: String,
    table: String,
    api_key: String,
    access_token: RwLock<Option<String>>,
}

impl RestTodoTable {
    pub fn new(
        base_url: impl Into<String>,
        table: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            table: table.into(),
            api_key: api_key.into(),
            access_token: RwLock::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        let base_url = config
            .backend_url
            .clone()
            .ok_or_else(|| AppError::Configuration("TODO_BACKEND_URL is not set".to_string()))?;
        let api_key = config
            .anon_key
            .clone()
            .ok_or_else(|| AppError::Configuration("TODO_ANON_KEY is not set".to_string()))?;

        Ok(Self::new(base_url, config.todo_table.clone(), api_key))
    }

    /// サインイン中のユーザーのアクセストークンを設定（None で匿名キーに戻す）
    pub fn set_access_token(&self, token: Option<String>) {
        let mut guard = self
            .access_token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = token;
    }

    pub fn endpoint(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    /// 行フィルタのクエリパラメータ
    pub fn filter_params(filter: &RowFilter) -> Vec<(&'static str, String)> {
        let mut params = vec![("user_id", format!("eq.{}", filter.owner_id))];
        if let Some(id) = &filter.id {
            params.push(("id", format!("eq.{id}")));
        }
        params
    }

    fn request(&self, method: Method) -> RequestBuilder {
        let bearer = self
            .access_token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .unwrap_or_else(|| self.api_key.clone());

        self.http
            .request(method, self.endpoint())
            .header("apikey", &self.api_key)
            .bearer_auth(bearer)
    }

    async fn send(builder: RequestBuilder) -> Result<Response, RemoteError> {
        let response = builder
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        debug!(status = status.as_u16(), "REST応答を受信しました");
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED => RemoteError::Unauthorized(message),
            _ => RemoteError::Rejected {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn decode_rows(response: Response) -> Result<Vec<TodoItem>, RemoteError> {
        let rows: Vec<TodoRow> = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        rows.into_iter()
            .map(|row| TodoItem::try_from(row).map_err(|e| RemoteError::Decode(e.to_string())))
            .collect()
    }
}

#[async_trait]
impl TodoTable for RestTodoTable {
    async fn select_all(
        &self,
        filter: &RowFilter,
        order: Order,
    ) -> Result<Vec<TodoItem>, RemoteError> {
        let mut query = Self::filter_params(filter);
        query.push(("select", "*".to_string()));
        query.push(("order", order.as_query().to_string()));

        let response = Self::send(self.request(Method::GET).query(&query)).await?;
        Self::decode_rows(response).await
    }

    async fn insert(&self, record: &NewTodo) -> Result<Option<TodoItem>, RemoteError> {
        let response = Self::send(
            self.request(Method::POST)
                .header("Prefer", "return=representation")
                .json(&InsertRow::from(record)),
        )
        .await?;

        Ok(Self::decode_rows(response).await?.into_iter().next())
    }

    async fn update(&self, patch: &TodoPatch, filter: &RowFilter) -> Result<(), RemoteError> {
        Self::send(
            self.request(Method::PATCH)
                .query(&Self::filter_params(filter))
                .json(patch),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, filter: &RowFilter) -> Result<(), RemoteError> {
        Self::send(self.request(Method::DELETE).query(&Self::filter_params(filter))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{TodoId, UserId};

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let table = RestTodoTable::new("http://localhost:54321/", "todos", "anon");
        assert_eq!(table.endpoint(), "http://localhost:54321/rest/v1/todos");
    }

    #[test]
    fn test_filter_params_always_include_owner() {
        let owner = UserId::from_string("u1").unwrap();
        assert_eq!(
            RestTodoTable::filter_params(&RowFilter::owner(owner.clone())),
            vec![("user_id", "eq.u1".to_string())]
        );

        let row = RowFilter::row(TodoId::from_string("42").unwrap(), owner);
        assert_eq!(
            RestTodoTable::filter_params(&row),
            vec![
                ("user_id", "eq.u1".to_string()),
                ("id", "eq.42".to_string())
            ]
        );
    }

    #[test]
    fn test_request_headers_use_user_token_when_set() {
        let table = RestTodoTable::new("http://localhost:54321", "todos", "anon");

        let request = table.request(Method::GET).build().unwrap();
        assert_eq!(request.headers()["apikey"], "anon");
        assert_eq!(request.headers()["authorization"], "Bearer anon");

        table.set_access_token(Some("user-token".to_string()));
        let request = table.request(Method::DELETE).build().unwrap();
        assert_eq!(request.headers()["apikey"], "anon");
        assert_eq!(request.headers()["authorization"], "Bearer user-token");

        table.set_access_token(None);
        let request = table.request(Method::GET).build().unwrap();
        assert_eq!(request.headers()["authorization"], "Bearer anon");
    }

    #[test]
    fn test_from_config_requires_url_and_key() {
        let mut config = Config::default();
        assert!(matches!(
            RestTodoTable::from_config(&config),
            Err(AppError::Configuration(_))
        ));

        config.backend_url = Some("http://localhost:54321".to_string());
        config.anon_key = Some("anon".to_string());
        let table = RestTodoTable::from_config(&config).unwrap();
        assert_eq!(table.endpoint(), "http://localhost:54321/rest/v1/todos");
    }
}
