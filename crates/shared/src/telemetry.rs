use crate::errors::{AppError, ErrorSeverity, RemoteError};
use std::future::Future;
use tracing::{debug, error, info, warn, Instrument};

/// リモート呼び出し用のスパンを作成
pub fn remote_span(operation: &'static str, owner: Option<&str>) -> tracing::Span {
    tracing::span!(
        tracing::Level::INFO,
        "remote_call",
        operation = operation,
        owner = owner.unwrap_or("none")
    )
}

/// リモート呼び出しをスパン付きで実行し、所要時間と結果を記録する
pub async fn trace_remote_operation<T, Fut>(
    operation: &'static str,
    owner: Option<&str>,
    future: Fut,
) -> Result<T, RemoteError>
where
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let span = remote_span(operation, owner);

    async move {
        let start_time = std::time::Instant::now();
        let result = future.await;
        let duration = start_time.elapsed();

        match &result {
            Ok(_) => {
                debug!(
                    operation = operation,
                    duration_ms = duration.as_millis() as u64,
                    "Remote operation completed"
                );
            }
            Err(e) => {
                warn!(
                    operation = operation,
                    duration_ms = duration.as_millis() as u64,
                    transient = e.is_transient(),
                    error = %e,
                    "Remote operation failed"
                );
            }
        }

        result
    }
    .instrument(span)
    .await
}

/// エラーを重要度に応じたレベルで記録
pub fn record_app_error(app_error: &AppError, context: &str) {
    let metadata = app_error.metadata();

    match metadata.severity {
        ErrorSeverity::Info => info!(
            code = metadata.code,
            context = context,
            error = %app_error,
            "Operation rejected"
        ),
        ErrorSeverity::Warning => warn!(
            code = metadata.code,
            context = context,
            error = %app_error,
            "Operation degraded"
        ),
        ErrorSeverity::Error | ErrorSeverity::Critical => error!(
            code = metadata.code,
            context = context,
            error = %app_error,
            "Operation failed"
        ),
    }
}
