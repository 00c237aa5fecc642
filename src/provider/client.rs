use crate::config::Config;
use crate::key_pool::KeyHandle;
use crate::logging::{self, LogLevel};
use crate::provider::types::ChatRequest;
use reqwest::header::CONTENT_TYPE;
use sonic_rs::JsonValueTrait;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("上游返回错误 {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl ProviderError {
    /// 上游 HTTP 状态码；传输层与解析错误没有状态码。
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// OpenAI 兼容接口客户端；每次调用使用所选 key 的 base_url 与 api_key。
///
/// 只实现 chat completions 这一种协议，模型名前缀（如 `anthropic:`）不会切换协议。
#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    log_level: LogLevel,
}

impl ProviderClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let timeout = if cfg.timeout_ms > 0 {
            Some(Duration::from_millis(cfg.timeout_ms))
        } else {
            None
        };
        Self::build(timeout, &cfg.proxy, cfg.log_level())
    }

    pub fn build(
        timeout: Option<Duration>,
        proxy: &str,
        log_level: LogLevel,
    ) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        // 只使用显式配置的 PROXY，不读取系统代理环境变量。
        builder = if proxy.trim().is_empty() {
            builder.no_proxy()
        } else {
            builder.proxy(reqwest::Proxy::all(proxy.trim())?)
        };

        Ok(Self {
            http: builder.build()?,
            log_level,
        })
    }

    pub async fn chat(
        &self,
        handle: &KeyHandle,
        prompt: &str,
    ) -> Result<sonic_rs::Value, ProviderError> {
        let provider = handle.provider();
        let url = chat_completions_url(&provider.base_url);
        let body = sonic_rs::to_vec(&ChatRequest::user_prompt(handle.upstream_model(), prompt))?;

        if self.log_level.backend_enabled() {
            logging::backend_request(self.log_level, handle.key_id(), &url, &body);
        }

        let start = Instant::now();
        let mut req = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if !provider.api_key.is_empty() {
            req = req.bearer_auth(&provider.api_key);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let bytes = resp.bytes().await?;

        if self.log_level.backend_enabled() {
            logging::backend_response(self.log_level, status, start.elapsed(), &bytes);
        }

        if !(200..300).contains(&status) {
            return Err(extract_error(status, &bytes));
        }
        Ok(sonic_rs::from_slice(&bytes)?)
    }
}

fn chat_completions_url(base_url: &str) -> String {
    format!("{}/chat/completions", base_url.trim().trim_end_matches('/'))
}

/// 优先取 OpenAI 风格的 error.message，取不到时退回原始响应体。
fn extract_error(status: u16, body: &[u8]) -> ProviderError {
    let message = sonic_rs::from_slice::<sonic_rs::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());
    ProviderError::Http { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_completions_url_trims_trailing_slash() {
        assert_eq!(
            chat_completions_url("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("http://localhost:8080"),
            "http://localhost:8080/chat/completions"
        );
    }

    #[test]
    fn extract_error_prefers_openai_message() {
        let body = br#"{"error":{"message":"Rate limit reached","type":"requests"}}"#;
        let err = extract_error(429, body);
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.to_string(), "上游返回错误 429: Rate limit reached");
    }

    #[test]
    fn extract_error_falls_back_to_raw_body() {
        let err = extract_error(502, b" bad gateway ");
        match err {
            ProviderError::Http { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "bad gateway");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn only_http_errors_carry_a_status() {
        let parse_err = sonic_rs::from_str::<sonic_rs::Value>("not json").unwrap_err();
        assert_eq!(ProviderError::from(parse_err).status(), None);
        assert_eq!(extract_error(503, b"busy").status(), Some(503));
    }

    async fn spawn_upstream() -> String {
        use axum::http::{HeaderMap, StatusCode};
        use axum::response::IntoResponse;
        use axum::routing::post;

        let app = axum::Router::new()
            .route(
                "/v1/chat/completions",
                post(|headers: HeaderMap, body: axum::body::Bytes| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let req: sonic_rs::Value = sonic_rs::from_slice(&body).unwrap();
                    let model = req
                        .get("model")
                        .and_then(|m| m.as_str())
                        .unwrap_or_default()
                        .to_string();
                    format!(r#"{{"auth":"{auth}","model":"{model}"}}"#)
                }),
            )
            .route(
                "/limited/chat/completions",
                post(|| async {
                    (
                        StatusCode::TOO_MANY_REQUESTS,
                        r#"{"error":{"message":"slow down"}}"#,
                    )
                        .into_response()
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn handle(base_url: String, api_key: &str) -> KeyHandle {
        use crate::key_pool::{Key, ProviderConfig};
        use std::sync::Arc;

        KeyHandle {
            key: Arc::new(Key {
                id: "k".to_string(),
                provider: ProviderConfig {
                    base_url,
                    api_key: api_key.to_string(),
                },
                region: None,
            }),
            model: Arc::from("openai:gpt-4o"),
            slot: 0,
        }
    }

    #[tokio::test]
    async fn chat_posts_to_key_base_url_with_bearer_token() {
        let base = spawn_upstream().await;
        let client = ProviderClient::build(Some(Duration::from_secs(5)), "", LogLevel::Off).unwrap();

        let v = client
            .chat(&handle(format!("{base}/v1/"), "sk-test"), "hi")
            .await
            .unwrap();
        assert_eq!(v.get("auth").and_then(|a| a.as_str()), Some("Bearer sk-test"));
        assert_eq!(v.get("model").and_then(|m| m.as_str()), Some("gpt-4o"));
    }

    #[tokio::test]
    async fn chat_maps_non_success_status_to_http_error() {
        let base = spawn_upstream().await;
        let client = ProviderClient::build(None, "", LogLevel::Off).unwrap();

        let err = client
            .chat(&handle(format!("{base}/limited"), ""), "hi")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(429));
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn request_body_uses_single_user_message() {
        let body = sonic_rs::to_string(&ChatRequest::user_prompt("gpt-4o", "hi")).unwrap();
        assert_eq!(
            body,
            r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#
        );
    }
}
