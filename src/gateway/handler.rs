use crate::error::AppError;
use crate::estimate::estimate_tokens;
use crate::key_pool::{KeyPool, RecordView};
use crate::logging::{self, LogLevel};
use crate::provider::Completion;
use crate::util::id;
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// 网关共享状态：key 池 + 上游调用方。
pub struct GatewayState {
    pub pool: Arc<KeyPool>,
    pub completion: Arc<dyn Completion>,
    /// 请求未携带 region 时使用的偏好，空串表示不偏好。
    pub default_region: String,
    pub log_level: LogLevel,
}

#[derive(Debug, Deserialize)]
pub struct LlmRequest {
    pub prompt: String,
    pub model: String,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LlmResponse {
    pub result: sonic_rs::Value,
    pub key_id: String,
    pub latency_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct KeysResponse {
    pub keys: Vec<RecordView>,
}

pub async fn handle_llm(State(state): State<Arc<GatewayState>>, body: Bytes) -> Response {
    let span = tracing::info_span!("llm", request_id = %id::request_id());
    async move {
        let start = Instant::now();
        let log_level = state.log_level;
        if log_level.client_enabled() {
            logging::client_request(log_level, "POST", "/api/llm", &body);
        }

        let (status, bytes) = match dispatch(&state, &body).await {
            Ok(resp) => match sonic_rs::to_vec(&resp) {
                Ok(bytes) => (StatusCode::OK, bytes),
                Err(e) => return finish(log_level, start, AppError::Anyhow(e.into())),
            },
            Err(e) => return finish(log_level, start, e),
        };

        if log_level.client_enabled() {
            logging::client_response(log_level, status.as_u16(), start.elapsed(), &bytes);
        }
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            bytes,
        )
            .into_response()
    }
    .instrument(span)
    .await
}

fn finish(log_level: LogLevel, start: Instant, err: AppError) -> Response {
    if log_level.client_enabled() {
        logging::client_response(
            log_level,
            err.status().as_u16(),
            start.elapsed(),
            err.to_string().as_bytes(),
        );
    }
    err.into_response()
}

/// 估算 → 选 key（持锁）→ 调用上游（不持锁）→ 回报结果。
async fn dispatch(state: &GatewayState, body: &[u8]) -> Result<LlmResponse, AppError> {
    let req: LlmRequest = sonic_rs::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("请求体解析失败: {e}")))?;

    let model = req.model.trim();
    if model.is_empty() {
        return Err(AppError::bad_request("model 不能为空"));
    }
    let region = req
        .region
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(state.default_region.as_str());

    let cost = estimate_tokens(&req.prompt);
    let Some(handle) = state.pool.select(model, region, cost).await else {
        return Err(AppError::capacity_exhausted());
    };

    let start = Instant::now();
    match state.completion.complete(&handle, &req.prompt).await {
        Ok(result) => {
            let latency = start.elapsed();
            state.pool.report_outcome(&handle, Some(latency), true).await;
            Ok(LlmResponse {
                result,
                key_id: handle.key_id().to_string(),
                latency_ms: logging::format_duration_ms(latency),
            })
        }
        Err(e) => {
            state.pool.report_outcome(&handle, None, false).await;
            tracing::warn!(
                key_id = %handle.key_id(),
                model = %model,
                upstream_status = ?e.status(),
                error = %e,
                "上游调用失败"
            );
            Err(AppError::upstream(e.to_string()))
        }
    }
}

pub async fn handle_keys(State(state): State<Arc<GatewayState>>) -> Json<KeysResponse> {
    Json(KeysResponse {
        keys: state.pool.snapshot().await,
    })
}

pub async fn handle_health() -> &'static str {
    "ok"
}
