//! Shared HTTP plumbing for vendor clients.

use codeloom_core::error::ProviderError;
use std::time::Duration;
use tracing::warn;

/// Timeouts applied to every vendor call.
#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    /// Bound on sending the request and receiving response headers
    pub request_timeout: Duration,
    /// Bound on the silence between two stream chunks
    pub idle_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&codeloom_config::HttpConfig> for HttpSettings {
    fn from(config: &codeloom_config::HttpConfig) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

pub(crate) fn client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("failed to create HTTP client: {e}")))
}

pub(crate) fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Send `request`, bounded by the request timeout, and map non-success
/// statuses to typed errors.
pub(crate) async fn send(
    request: reqwest::RequestBuilder,
    settings: &HttpSettings,
    provider: &str,
) -> Result<reqwest::Response, ProviderError> {
    let response = tokio::time::timeout(settings.request_timeout, request.send())
        .await
        .map_err(|_| {
            ProviderError::Timeout(format!(
                "{provider} did not respond within {}s",
                settings.request_timeout.as_secs()
            ))
        })?
        .map_err(transport_error)?;

    let status = response.status().as_u16();
    if response.status().is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    warn!(provider, status, body = %body, "Provider returned error");
    Err(classify_status(status, body, retry_after))
}

pub(crate) fn classify_status(status: u16, body: String, retry_after: Option<u64>) -> ProviderError {
    let lower = body.to_lowercase();
    match status {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(5),
        },
        401 | 403 => ProviderError::AuthenticationFailed(body),
        404 => ProviderError::ModelNotFound(body),
        413 => ProviderError::ContextTooLong(body),
        400 if lower.contains("context_length_exceeded")
            || lower.contains("prompt is too long")
            || lower.contains("maximum context length") =>
        {
            ProviderError::ContextTooLong(body)
        }
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

/// A one-shot HTTP server for exercising clients against canned responses.
#[cfg(test)]
pub(crate) mod testing {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Serve one request with `status` and `body`; returns the base URL and
    /// a receiver yielding the raw request text.
    pub async fn serve_once(
        status: u16,
        content_type: &'static str,
        body: String,
    ) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + length {
                        break;
                    }
                }
            }
            let _ = tx.send(String::from_utf8_lossy(&raw).to_string());
            let response = format!(
                "HTTP/1.1 {status} OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        (format!("http://{addr}"), rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_honors_retry_after() {
        match classify_status(429, String::new(), Some(12)) {
            ProviderError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 12),
            other => panic!("expected rate limit, got {other}"),
        }
    }

    #[test]
    fn context_errors_are_recognized() {
        let err = classify_status(
            400,
            r#"{"error":{"code":"context_length_exceeded"}}"#.into(),
            None,
        );
        assert!(matches!(err, ProviderError::ContextTooLong(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(classify_status(529, "overloaded".into(), None).is_retryable());
        assert!(!classify_status(400, "bad".into(), None).is_retryable());
        assert!(!classify_status(401, "no".into(), None).is_retryable());
    }
}
