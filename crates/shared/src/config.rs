use crate::errors::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgREST 互換バックエンドのURL（未設定ならインメモリで動作）
    pub backend_url: Option<String>,
    pub anon_key: Option<String>,
    pub todo_table: String,
    pub environment: String,
    /// デモ用にサインインさせるユーザーID
    pub demo_user: String,
    /// ライブフィードのバッファ件数
    pub feed_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: None,
            anon_key: None,
            todo_table: "todos".to_string(),
            environment: "dev".to_string(),
            demo_user: "demo-user".to_string(),
            feed_capacity: 64,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = Config::default();

        let feed_capacity = match env::var("TODO_FEED_CAPACITY") {
            Ok(raw) => raw.parse::<usize>().map_err(|e| {
                AppError::Configuration(format!("TODO_FEED_CAPACITY={raw}: {e}"))
            })?,
            Err(_) => defaults.feed_capacity,
        };
        if feed_capacity == 0 {
            return Err(AppError::Configuration(
                "TODO_FEED_CAPACITY must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            backend_url: env::var("TODO_BACKEND_URL").ok().filter(|v| !v.is_empty()),
            anon_key: env::var("TODO_ANON_KEY").ok().filter(|v| !v.is_empty()),
            todo_table: env::var("TODO_TABLE").unwrap_or(defaults.todo_table),
            environment: env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            demo_user: env::var("TODO_DEMO_USER").unwrap_or(defaults.demo_user),
            feed_capacity,
        })
    }
}
