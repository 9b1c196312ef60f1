//! Fetch tool: HTTP(S) GET with HTML conversion.

use async_trait::async_trait;
use codeloom_core::error::ToolError;
use codeloom_core::tool::{Tool, ToolCall, ToolContext, ToolResponse};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::file::ToolEnv;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Format {
    Text,
    Markdown,
    Html,
}

#[derive(Deserialize)]
struct FetchParams {
    url: String,
    format: Format,
    /// Seconds
    #[serde(default)]
    timeout: Option<u64>,
}

pub struct FetchTool {
    env: Arc<ToolEnv>,
    client: reqwest::Client,
}

impl FetchTool {
    pub fn new(env: Arc<ToolEnv>) -> Result<Self, ToolError> {
        let allow_private = env.limits.fetch_allow_private;
        let redirects = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= 5 {
                attempt.error("too many redirects")
            } else if !allow_private && literal_host_is_private(attempt.url()) {
                attempt.error("redirect to a private address")
            } else {
                attempt.follow()
            }
        });
        let client = reqwest::Client::builder()
            .user_agent(concat!("codeloom/", env!("CARGO_PKG_VERSION")))
            .redirect(redirects)
            .build()
            .map_err(|e| ToolError::failed("fetch", format!("failed to create HTTP client: {e}")))?;
        Ok(Self { env, client })
    }

    /// Refuse hosts that resolve to loopback, private, link-local or
    /// unspecified addresses.
    async fn check_host(&self, url: &Url) -> Result<(), String> {
        if self.env.limits.fetch_allow_private {
            return Ok(());
        }
        let host = url.host_str().ok_or_else(|| "URL has no host".to_string())?;
        let port = url.port_or_known_default().unwrap_or(80);
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| format!("cannot resolve {host}: {e}"))?;
        for addr in addrs {
            if is_private(addr.ip()) {
                return Err(format!("{host} resolves to a private address ({})", addr.ip()));
            }
        }
        Ok(())
    }
}

pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

fn literal_host_is_private(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Ipv4(ip)) => is_private(IpAddr::V4(ip)),
        Some(url::Host::Ipv6(ip)) => is_private(IpAddr::V6(ip)),
        Some(url::Host::Domain(name)) => name.eq_ignore_ascii_case("localhost"),
        None => true,
    }
}

fn is_html(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/html")
}

/// Plain text from HTML: the markdown rendering with its markup removed.
fn html_to_text(html: &str) -> String {
    let markdown = html2md::parse_html(html);
    let mut out = String::with_capacity(markdown.len());
    for line in markdown.lines() {
        let line = line
            .trim_start_matches('#')
            .trim_start_matches(['*', '-', '>'])
            .replace("**", "")
            .replace('`', "");
        let line = line.trim();
        if line.is_empty() && out.ends_with("\n\n") {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET and return its body as text, markdown or raw html. HTML pages are converted for the text and markdown formats. Responses larger than the configured limit are refused. The optional timeout is in seconds (maximum 120)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "http:// or https:// URL to fetch"
                },
                "format": {
                    "type": "string",
                    "enum": ["text", "markdown", "html"],
                    "description": "How to return the content"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds"
                }
            },
            "required": ["url", "format"]
        })
    }

    fn permission_description(&self, input: &serde_json::Value) -> String {
        format!("Fetch content from URL: {}", input["url"].as_str().unwrap_or_default())
    }

    fn permission_path(&self, _input: &serde_json::Value) -> Option<String> {
        None
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolCall) -> Result<ToolResponse, ToolError> {
        let params: FetchParams = call.parse_input()?;
        let url = match Url::parse(&params.url) {
            Ok(u) if matches!(u.scheme(), "http" | "https") => u,
            Ok(_) => return Ok(ToolResponse::error("URL must start with http:// or https://")),
            Err(e) => return Ok(ToolResponse::error(format!("invalid URL: {e}"))),
        };
        if let Err(reason) = self.check_host(&url).await {
            warn!(url = %url, reason = %reason, "Fetch refused");
            return Ok(ToolResponse::error(reason));
        }

        let timeout = Duration::from_secs(
            params
                .timeout
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_TIMEOUT_SECS)
                .min(MAX_TIMEOUT_SECS),
        );
        let max_bytes = self.env.limits.fetch_max_bytes;
        debug!(url = %url, format = ?params.format, "Fetching URL");

        let download = async {
            let mut response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| format!("failed to fetch URL: {e}"))?;
            let status = response.status();
            if !status.is_success() {
                return Err(format!("Request failed with status code: {}", status.as_u16()));
            }
            if response.content_length().is_some_and(|len| len as usize > max_bytes) {
                return Err(format!("response exceeds the {max_bytes}-byte limit"));
            }
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let mut body = Vec::new();
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| format!("failed to read response body: {e}"))?
            {
                if body.len() + chunk.len() > max_bytes {
                    return Err(format!("response exceeds the {max_bytes}-byte limit"));
                }
                body.extend_from_slice(&chunk);
            }
            Ok::<_, String>((content_type, String::from_utf8_lossy(&body).into_owned()))
        };

        let (content_type, body) = tokio::select! {
            result = tokio::time::timeout(timeout, download) => match result {
                Ok(Ok(fetched)) => fetched,
                Ok(Err(reason)) => return Ok(ToolResponse::error(reason)),
                Err(_) => {
                    return Err(ToolError::Timeout {
                        tool_name: "fetch".into(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };

        let bytes = body.len();
        let content = match params.format {
            Format::Html => body,
            Format::Text if is_html(&content_type) => html_to_text(&body),
            Format::Text => body,
            Format::Markdown if is_html(&content_type) => html2md::parse_html(&body),
            Format::Markdown => format!("```\n{body}\n```"),
        };
        Ok(ToolResponse::text(content).with_metadata(serde_json::json!({
            "url": url.to_string(),
            "content_type": content_type,
            "bytes": bytes,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::testing::ctx;
    use codeloom_config::ToolsConfig;
    use codeloom_security::Workspace;
    use codeloom_store::InMemoryStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response on a loopback port.
    async fn serve_once(content_type: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    fn tool(dir: &tempfile::TempDir, allow_private: bool, max_bytes: usize) -> FetchTool {
        let limits = ToolsConfig {
            fetch_allow_private: allow_private,
            fetch_max_bytes: max_bytes,
            ..ToolsConfig::default()
        };
        let env = ToolEnv::new(
            Workspace::new(dir.path()).unwrap(),
            Arc::new(InMemoryStore::default()),
            limits,
        );
        FetchTool::new(Arc::new(env)).unwrap()
    }

    fn call(input: serde_json::Value) -> ToolCall {
        ToolCall::new("c1", "fetch", input.to_string())
    }

    #[test]
    fn private_ranges() {
        for ip in ["127.0.0.1", "10.1.2.3", "192.168.0.1", "172.16.5.5", "169.254.1.1", "0.0.0.0", "::1", "fd00::1", "fe80::1", "::ffff:127.0.0.1"] {
            assert!(is_private(ip.parse().unwrap()), "{ip}");
        }
        for ip in ["93.184.216.34", "2606:4700::1111", "8.8.8.8"] {
            assert!(!is_private(ip.parse().unwrap()), "{ip}");
        }
    }

    #[tokio::test]
    async fn loopback_is_refused_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(&dir, false, 1024)
            .run(&ctx(), &call(serde_json::json!({"url": "http://127.0.0.1:9/", "format": "text"})))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.content.contains("private address"));
    }

    #[tokio::test]
    async fn non_http_schemes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool(&dir, true, 1024)
            .run(&ctx(), &call(serde_json::json!({"url": "file:///etc/passwd", "format": "text"})))
            .await
            .unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn html_converts_to_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once("text/html; charset=utf-8", "<html><body><h1>Hello</h1><p>World</p></body></html>".into()).await;
        let out = tool(&dir, true, 1024 * 1024)
            .run(&ctx(), &call(serde_json::json!({"url": base, "format": "markdown"})))
            .await
            .unwrap();
        assert!(out.success, "{}", out.content);
        assert!(out.content.contains("Hello"));
        assert!(out.content.contains("World"));
        assert!(!out.content.contains("<h1>"));
    }

    #[tokio::test]
    async fn plain_text_markdown_is_fenced() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once("text/plain", "just text".into()).await;
        let out = tool(&dir, true, 1024)
            .run(&ctx(), &call(serde_json::json!({"url": base, "format": "markdown"})))
            .await
            .unwrap();
        assert_eq!(out.content, "```\njust text\n```");
    }

    #[tokio::test]
    async fn oversized_responses_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve_once("text/plain", "x".repeat(2048)).await;
        let out = tool(&dir, true, 1024)
            .run(&ctx(), &call(serde_json::json!({"url": base, "format": "text"})))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.content.contains("limit"));
    }
}
