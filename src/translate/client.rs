//! OpenAI-compatible chat/completions client.
//! Connection pooling via reqwest, simple request pacing, and the retry
//! policy for upstream failures. No other layer retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{TranslateError, SYSTEM_PROMPT};
use crate::cancellation::CallContext;
use crate::config::{ClientConfig, RetryPolicy};

/// Black-box text generation backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &'static str;

    /// Generate a completion for `prompt`, honouring the context deadline.
    async fn generate(&self, ctx: &CallContext, prompt: &str) -> Result<String, TranslateError>;
}

pub struct ChatClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    /// Tracks the next allowed request start.
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
    min_interval: Duration,
    retry: RetryPolicy,
}

impl ChatClient {
    /// Build a client. Fails when no API key is configured.
    pub fn new(config: &ClientConfig) -> Result<Self, TranslateError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| TranslateError::Config("SILICONFLOW_API_KEY not set".into()))?;

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| TranslateError::Config(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
            min_interval: config.min_interval,
            retry: config.retry.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Wait until the pacing window allows another request.
    async fn pace(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.min_interval;
    }

    /// Send request with retry logic.
    /// 429: Retry-After or 1s/2s/4s. 5xx: exponential backoff.
    /// 401/403: fail immediately. Timeout: retry once.
    async fn send_with_retry(
        &self,
        ctx: &CallContext,
        body: &ChatRequest<'_>,
    ) -> Result<reqwest::Response, TranslateError> {
        let mut rate_limit_attempts: u32 = 0;
        let mut server_attempts: u32 = 0;
        let mut timeout_retried = !self.retry.retry_timeout_once;

        loop {
            ctx.run(async {
                self.pace().await;
                Ok(())
            })
            .await?;

            let result = ctx
                .run(async {
                    Ok(self
                        .http
                        .post(&self.endpoint)
                        .bearer_auth(&self.api_key)
                        .json(body)
                        .send()
                        .await)
                })
                .await?;

            match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().as_u16() == 429 => {
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.trim().parse::<u64>().ok())
                        .map(Duration::from_secs);
                    if rate_limit_attempts >= self.retry.max_rate_limit_retries {
                        return Err(TranslateError::RateLimited {
                            retry_after_ms: retry_after.map(|d| d.as_millis() as u64).unwrap_or(0),
                        });
                    }
                    let wait = retry_after
                        .unwrap_or_else(|| Duration::from_secs(1 << rate_limit_attempts));
                    warn!(
                        attempt = rate_limit_attempts,
                        wait_ms = wait.as_millis() as u64,
                        "429 rate limited, retrying"
                    );
                    ctx.sleep(wait).await?;
                    rate_limit_attempts += 1;
                }
                Ok(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(TranslateError::Auth(format!(
                        "{}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Ok(resp) if resp.status().is_server_error() => {
                    if server_attempts >= self.retry.max_server_retries {
                        return Err(TranslateError::Api(format!(
                            "server error: {}",
                            resp.status()
                        )));
                    }
                    let wait = self.retry.base_backoff * (1u32 << server_attempts);
                    warn!(
                        attempt = server_attempts,
                        status = resp.status().as_u16(),
                        wait_ms = wait.as_millis() as u64,
                        "5xx error, retrying"
                    );
                    ctx.sleep(wait).await?;
                    server_attempts += 1;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(TranslateError::Api(format!(
                        "unexpected status {}: {}",
                        status,
                        body_text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) if e.is_timeout() => {
                    if timeout_retried {
                        return Err(TranslateError::Timeout);
                    }
                    warn!("request timeout, retrying once");
                    timeout_retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn generate(&self, ctx: &CallContext, prompt: &str) -> Result<String, TranslateError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.1,
            stream: false,
        };

        let start = Instant::now();
        let response = self.send_with_retry(ctx, &body).await?;
        let parsed = ctx
            .run(async {
                response
                    .json::<ChatResponse>()
                    .await
                    .map_err(TranslateError::from)
            })
            .await?;
        debug!(
            model = %self.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            total_tokens = parsed.usage.as_ref().map(|u| u.total_tokens),
            "chat completion received"
        );
        extract_content(parsed)
    }
}

fn extract_content(response: ChatResponse) -> Result<String, TranslateError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|content| !content.trim().is_empty())
        .ok_or_else(|| TranslateError::InvalidResponse("no content in completion".into()))
}

// --- Wire types ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_key_is_a_config_error() {
        let config = ClientConfig::default();
        assert!(matches!(
            ChatClient::new(&config),
            Err(TranslateError::Config(_))
        ));
    }

    #[test]
    fn endpoint_appends_chat_path() {
        let config = ClientConfig {
            api_key: Some("sk-test".into()),
            base_url: "https://example.test/v1/".into(),
            ..ClientConfig::default()
        };
        let client = ChatClient::new(&config).expect("client");
        assert_eq!(client.endpoint, "https://example.test/v1/chat/completions");
        assert_eq!(client.model(), config.model);
    }

    #[test]
    fn request_serializes_system_then_user() {
        let body = ChatRequest {
            model: "m",
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: "hi",
                },
            ],
            temperature: 0.1,
            stream: false,
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn content_is_extracted_from_first_choice() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"你好，世界"}}],"usage":{"total_tokens":12}}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(extract_content(parsed).expect("content"), "你好，世界");
    }

    #[test]
    fn empty_choices_are_invalid() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).expect("parse");
        assert!(matches!(
            extract_content(parsed),
            Err(TranslateError::InvalidResponse(_))
        ));
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"  "}}]}"#).expect("parse");
        assert!(extract_content(parsed).is_err());
    }

    mod retry {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        use super::super::{ChatClient, ChatModel};
        use crate::cancellation::CallContext;
        use crate::config::{ClientConfig, RetryPolicy};
        use crate::translate::TranslateError;

        const OK_BODY: &str = r#"{"choices":[{"message":{"content":"你好"}}]}"#;

        /// What the local server does with one connection.
        enum Reply {
            Status(u16, Option<(&'static str, &'static str)>),
            Ok,
            /// Read the request and never answer.
            Hang,
        }

        struct LocalServer {
            base_url: String,
            hits: Arc<AtomicUsize>,
        }

        impl LocalServer {
            fn hits(&self) -> usize {
                self.hits.load(Ordering::SeqCst)
            }
        }

        /// One scripted reply per accepted connection; `500` once the script runs out.
        async fn serve(script: Vec<Reply>) -> LocalServer {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            let addr = listener.local_addr().expect("addr");
            let hits = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&hits);
            tokio::spawn(async move {
                let mut script = script.into_iter();
                while let Ok((mut socket, _)) = listener.accept().await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    read_request(&mut socket).await;
                    match script.next() {
                        Some(Reply::Hang) => {
                            tokio::spawn(async move {
                                tokio::time::sleep(Duration::from_secs(60)).await;
                                drop(socket);
                            });
                        }
                        Some(Reply::Ok) => respond(socket, 200, None, OK_BODY).await,
                        Some(Reply::Status(status, header)) => {
                            respond(socket, status, header, r#"{"error":"scripted"}"#).await
                        }
                        None => respond(socket, 500, None, r#"{"error":"exhausted"}"#).await,
                    }
                }
            });
            LocalServer {
                base_url: format!("http://{addr}/v1"),
                hits,
            }
        }

        async fn read_request(socket: &mut TcpStream) {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 2048];
            loop {
                let n = match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                    let body_len = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + body_len {
                        return;
                    }
                }
            }
        }

        async fn respond(
            mut socket: TcpStream,
            status: u16,
            header: Option<(&'static str, &'static str)>,
            body: &str,
        ) {
            let extra = header
                .map(|(name, value)| format!("{name}: {value}\r\n"))
                .unwrap_or_default();
            let raw = format!(
                "HTTP/1.1 {status} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n{extra}\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(raw.as_bytes()).await;
            let _ = socket.shutdown().await;
        }

        fn client(server: &LocalServer, retry: RetryPolicy) -> ChatClient {
            client_with_timeout(server, retry, Duration::from_secs(5))
        }

        fn client_with_timeout(
            server: &LocalServer,
            retry: RetryPolicy,
            http_timeout: Duration,
        ) -> ChatClient {
            ChatClient::new(&ClientConfig {
                base_url: server.base_url.clone(),
                api_key: Some("sk-test".into()),
                http_timeout,
                min_interval: Duration::ZERO,
                retry,
                ..ClientConfig::default()
            })
            .expect("client")
        }

        fn fast_policy() -> RetryPolicy {
            RetryPolicy {
                base_backoff: Duration::from_millis(20),
                ..RetryPolicy::default()
            }
        }

        #[tokio::test]
        async fn success_is_a_single_request() {
            let server = serve(vec![Reply::Ok]).await;
            let out = client(&server, fast_policy())
                .generate(&CallContext::new(), "hi")
                .await
                .expect("completion");
            assert_eq!(out, "你好");
            assert_eq!(server.hits(), 1);
        }

        #[tokio::test]
        async fn rate_limit_honours_retry_after() {
            let server = serve(vec![
                Reply::Status(429, Some(("retry-after", "0"))),
                Reply::Ok,
            ])
            .await;
            let out = client(&server, fast_policy())
                .generate(&CallContext::new(), "hi")
                .await
                .expect("completion after 429");
            assert_eq!(out, "你好");
            assert_eq!(server.hits(), 2);
        }

        #[tokio::test]
        async fn rate_limit_without_header_backs_off_then_gives_up() {
            let server = serve(vec![Reply::Status(429, None), Reply::Status(429, None)]).await;
            let policy = RetryPolicy {
                max_rate_limit_retries: 1,
                ..fast_policy()
            };

            let start = std::time::Instant::now();
            let err = client(&server, policy)
                .generate(&CallContext::new(), "hi")
                .await
                .unwrap_err();

            assert!(matches!(err, TranslateError::RateLimited { retry_after_ms: 0 }));
            assert_eq!(server.hits(), 2);
            // First fallback step is one second.
            assert!(start.elapsed() >= Duration::from_secs(1), "{:?}", start.elapsed());
        }

        #[tokio::test]
        async fn server_errors_back_off_exponentially_until_exhausted() {
            let server = serve(vec![
                Reply::Status(503, None),
                Reply::Status(502, None),
                Reply::Status(500, None),
            ])
            .await;

            let start = std::time::Instant::now();
            let err = client(&server, fast_policy())
                .generate(&CallContext::new(), "hi")
                .await
                .unwrap_err();

            assert!(matches!(err, TranslateError::Api(_)), "{err:?}");
            // One attempt plus max_server_retries.
            assert_eq!(server.hits(), 3);
            // 20ms + 40ms of backoff.
            assert!(start.elapsed() >= Duration::from_millis(60), "{:?}", start.elapsed());
        }

        #[tokio::test]
        async fn server_error_then_success_recovers() {
            let server = serve(vec![Reply::Status(502, None), Reply::Ok]).await;
            let out = client(&server, fast_policy())
                .generate(&CallContext::new(), "hi")
                .await
                .expect("completion after 502");
            assert_eq!(out, "你好");
            assert_eq!(server.hits(), 2);
        }

        #[tokio::test]
        async fn auth_failures_are_never_retried() {
            for status in [401, 403] {
                let server = serve(vec![Reply::Status(status, None), Reply::Ok]).await;
                let err = client(&server, fast_policy())
                    .generate(&CallContext::new(), "hi")
                    .await
                    .unwrap_err();
                assert!(matches!(err, TranslateError::Auth(_)), "{status}: {err:?}");
                assert_eq!(server.hits(), 1, "{status}");
            }
        }

        #[tokio::test]
        async fn other_client_errors_are_api_errors() {
            let server = serve(vec![Reply::Status(404, None), Reply::Ok]).await;
            let err = client(&server, fast_policy())
                .generate(&CallContext::new(), "hi")
                .await
                .unwrap_err();
            assert!(matches!(err, TranslateError::Api(_)), "{err:?}");
            assert_eq!(server.hits(), 1);
        }

        #[tokio::test]
        async fn transport_timeout_is_retried_exactly_once() {
            let server = serve(vec![Reply::Hang, Reply::Hang, Reply::Ok]).await;
            let err = client_with_timeout(&server, fast_policy(), Duration::from_millis(200))
                .generate(&CallContext::new(), "hi")
                .await
                .unwrap_err();
            assert!(matches!(err, TranslateError::Timeout), "{err:?}");
            assert_eq!(server.hits(), 2);
        }

        #[tokio::test]
        async fn single_timeout_then_success_recovers() {
            let server = serve(vec![Reply::Hang, Reply::Ok]).await;
            let out = client_with_timeout(&server, fast_policy(), Duration::from_millis(200))
                .generate(&CallContext::new(), "hi")
                .await
                .expect("completion after timeout");
            assert_eq!(out, "你好");
            assert_eq!(server.hits(), 2);
        }

        #[tokio::test]
        async fn cancellation_interrupts_backoff() {
            let server = serve(vec![Reply::Status(429, Some(("retry-after", "30")))]).await;
            let ctx = CallContext::new();
            let canceller = {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    ctx.cancel();
                })
            };

            let start = std::time::Instant::now();
            let err = client(&server, fast_policy())
                .generate(&ctx, "hi")
                .await
                .unwrap_err();
            canceller.await.expect("canceller");

            assert!(matches!(err, TranslateError::Cancelled), "{err:?}");
            assert!(start.elapsed() < Duration::from_secs(5), "{:?}", start.elapsed());
            assert_eq!(server.hits(), 1);
        }
    }
}
