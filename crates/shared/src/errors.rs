use std::fmt;
use thiserror::Error;

/// リモート協調サービス（認証・データストア・ライブフィード）の失敗
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Channel closed: {0}")]
    Closed(String),

    /// テスト用バックエンドが意図的に返す失敗
    #[error("Injected failure: {0}")]
    Injected(String),
}

impl RemoteError {
    /// 一時的な失敗かどうか（ログの分類にのみ使う。自動リトライはしない）
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Closed(_) => true,
            RemoteError::Rejected { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// 書き込み操作の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Create,
    Update,
    Delete,
}

impl WriteOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOperation::Create => "create",
            WriteOperation::Update => "update",
            WriteOperation::Delete => "delete",
        }
    }
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// クライアント全体で使用されるエラー型
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppError {
    // セッション確認の失敗（サインアウト扱い）
    #[error("Session error: {0}")]
    Session(String),

    // 初回一覧取得の失敗
    #[error("Fetch error: {0}")]
    Fetch(String),

    // 作成・更新・削除の失敗（楽観的変更は補償済み）
    #[error("Write error ({operation}): {message}")]
    Write {
        operation: WriteOperation,
        message: String,
    },

    // ライブフィードの確立失敗
    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Domain error: {0}")]
    Domain(#[from] domain::DomainError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// エラーの分類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 利用者の入力・状態に起因
    Client,
    /// リモート側に起因
    Remote,
    /// 設定・実装に起因
    Internal,
}

/// エラーの重要度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// エラーメタデータ
#[derive(Debug, Clone)]
pub struct ErrorMetadata {
    pub code: &'static str,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
}

impl AppError {
    pub fn session(error: &RemoteError) -> Self {
        AppError::Session(error.to_string())
    }

    pub fn fetch(error: &RemoteError) -> Self {
        AppError::Fetch(error.to_string())
    }

    pub fn write(operation: WriteOperation, error: &RemoteError) -> Self {
        AppError::Write {
            operation,
            message: error.to_string(),
        }
    }

    pub fn subscription(error: &RemoteError) -> Self {
        AppError::Subscription(error.to_string())
    }

    /// エラーメタデータを取得
    pub fn metadata(&self) -> ErrorMetadata {
        let (code, category, severity) = match self {
            AppError::Session(_) => ("SESSION_ERROR", ErrorCategory::Remote, ErrorSeverity::Warning),
            AppError::Fetch(_) => ("FETCH_ERROR", ErrorCategory::Remote, ErrorSeverity::Error),
            AppError::Write { .. } => ("WRITE_ERROR", ErrorCategory::Remote, ErrorSeverity::Error),
            AppError::Subscription(_) => (
                "SUBSCRIPTION_ERROR",
                ErrorCategory::Remote,
                ErrorSeverity::Error,
            ),
            AppError::NotSignedIn => ("NOT_SIGNED_IN", ErrorCategory::Client, ErrorSeverity::Info),
            AppError::Validation(_) | AppError::Domain(_) => {
                ("VALIDATION_ERROR", ErrorCategory::Client, ErrorSeverity::Info)
            }
            AppError::Configuration(_) => (
                "CONFIGURATION_ERROR",
                ErrorCategory::Internal,
                ErrorSeverity::Critical,
            ),
        };

        ErrorMetadata {
            code,
            category,
            severity,
        }
    }

    /// バナーに表示するメッセージを取得
    pub fn user_message(&self) -> String {
        match self {
            AppError::Session(_) | AppError::NotSignedIn => {
                "サインインしてください".to_string()
            }
            AppError::Fetch(_) => "ToDoの読み込みに失敗しました".to_string(),
            AppError::Write { operation, .. } => match operation {
                WriteOperation::Create => "ToDoの追加に失敗しました".to_string(),
                WriteOperation::Update => "ToDoの更新に失敗しました".to_string(),
                WriteOperation::Delete => "ToDoの削除に失敗しました".to_string(),
            },
            AppError::Subscription(_) => {
                "リアルタイム同期を開始できませんでした。再読み込みしてください".to_string()
            }
            AppError::Validation(message) => format!("入力データが無効です: {message}"),
            AppError::Domain(error) => format!("入力データが無効です: {error}"),
            AppError::Configuration(_) => "予期しないエラーが発生しました".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_metadata() {
        let error = AppError::write(
            WriteOperation::Create,
            &RemoteError::Network("connection reset".to_string()),
        );
        let metadata = error.metadata();

        assert_eq!(metadata.code, "WRITE_ERROR");
        assert_eq!(metadata.category, ErrorCategory::Remote);
        assert_eq!(metadata.severity, ErrorSeverity::Error);
    }

    #[test]
    fn test_write_error_keeps_remote_message() {
        let error = AppError::write(
            WriteOperation::Delete,
            &RemoteError::Rejected {
                status: 403,
                message: "row level security".to_string(),
            },
        );
        assert_eq!(
            error.to_string(),
            "Write error (delete): Request rejected (403): row level security"
        );
        assert_eq!(error.user_message(), "ToDoの削除に失敗しました");
    }

    #[test]
    fn test_domain_error_conversion() {
        let error: AppError = domain::DomainError::Validation("empty".to_string()).into();
        assert_eq!(error.metadata().code, "VALIDATION_ERROR");
        assert_eq!(error.metadata().category, ErrorCategory::Client);
    }

    #[test]
    fn test_remote_error_transience() {
        assert!(RemoteError::Network("timeout".to_string()).is_transient());
        assert!(RemoteError::Rejected {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!RemoteError::Rejected {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!RemoteError::Unauthorized("expired".to_string()).is_transient());
    }
}
