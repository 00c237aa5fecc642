use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 延迟滑动平均中旧值的权重。
const LATENCY_PRIOR_WEIGHT: f64 = 0.8;

/// 上游供应商接入参数；核心只负责透传给调用方。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// 一个上游凭证（不可变部分）。
#[derive(Debug)]
pub struct Key {
    pub id: String,
    pub provider: ProviderConfig,
    pub region: Option<String>,
}

impl Key {
    pub fn in_region(&self, region: &str) -> bool {
        self.region.as_deref() == Some(region)
    }
}

/// 启动时的 key 定义：凭证本身加上它支持的模型及各自配额。
#[derive(Debug)]
pub struct KeyDefinition {
    pub key: Key,
    pub models: Vec<(String, ResourceLimits)>,
}

/// 单个 key 在某个模型下的配额上限与窗口长度。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub request_limit: u64,
    pub request_window: TimeDelta,
    pub token_limit: u64,
    pub token_window: TimeDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// 失败调用是否会把 key 排除出候选集。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthPolicy {
    /// 只记录健康状态，不参与筛选。
    #[default]
    Track,
    /// unhealthy 的 key 不作为候选，直到窗口重置。
    Exclude,
}

/// 一次窗口归一化重置了哪些计数。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowReset {
    pub request: bool,
    pub token: bool,
}

/// 单个 key 在某个模型下的可变配额状态。
#[derive(Debug, Clone)]
pub struct QuotaRecord {
    pub key: Arc<Key>,
    pub limits: ResourceLimits,
    pub request_count: u64,
    pub request_window_end: DateTime<Utc>,
    pub token_count: u64,
    pub token_window_end: DateTime<Utc>,
    pub health: HealthStatus,
    pub avg_latency_secs: Option<f64>,
}

impl QuotaRecord {
    pub fn new(key: Arc<Key>, limits: ResourceLimits, now: DateTime<Utc>) -> Self {
        Self {
            key,
            limits,
            request_count: 0,
            request_window_end: window_end(now, limits.request_window),
            token_count: 0,
            token_window_end: window_end(now, limits.token_window),
            health: HealthStatus::Healthy,
            avg_latency_secs: None,
        }
    }

    /// 惰性过期：窗口已到期则清零计数并从 now 开始新窗口。
    ///
    /// 请求窗口重置时同时恢复 healthy。选择前与后台回收共用这一个入口。
    pub fn expire_windows(&mut self, now: DateTime<Utc>) -> WindowReset {
        let mut reset = WindowReset::default();
        if now >= self.request_window_end {
            self.request_count = 0;
            self.request_window_end = window_end(now, self.limits.request_window);
            self.health = HealthStatus::Healthy;
            reset.request = true;
        }
        if now >= self.token_window_end {
            self.token_count = 0;
            self.token_window_end = window_end(now, self.limits.token_window);
            reset.token = true;
        }
        reset
    }

    pub fn remaining_requests(&self) -> u64 {
        self.limits.request_limit.saturating_sub(self.request_count)
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.limits.token_limit.saturating_sub(self.token_count)
    }

    pub fn has_capacity(&self, estimated_cost: u64) -> bool {
        self.remaining_requests() > 0 && self.remaining_tokens() >= estimated_cost
    }

    pub fn is_eligible(&self, estimated_cost: u64, policy: HealthPolicy) -> bool {
        if policy == HealthPolicy::Exclude && self.health == HealthStatus::Unhealthy {
            return false;
        }
        self.has_capacity(estimated_cost)
    }

    /// 预占：在同一临界区内提交估算用量，防止并发选择超额。
    pub fn reserve(&mut self, estimated_cost: u64) {
        self.request_count = self.request_count.saturating_add(1);
        self.token_count = self.token_count.saturating_add(estimated_cost);
    }

    pub fn observe_latency(&mut self, sample_secs: f64) {
        if !(sample_secs.is_finite() && sample_secs >= 0.0) {
            return;
        }
        self.avg_latency_secs = Some(match self.avg_latency_secs {
            Some(prev) => LATENCY_PRIOR_WEIGHT * prev + (1.0 - LATENCY_PRIOR_WEIGHT) * sample_secs,
            None => sample_secs,
        });
    }

    pub fn mark_unhealthy(&mut self) {
        self.health = HealthStatus::Unhealthy;
    }

    /// 排序键：未观测过延迟的 key 排在所有已观测 key 之后。
    pub fn latency_rank(&self) -> f64 {
        self.avg_latency_secs.unwrap_or(f64::INFINITY)
    }

    /// 按 now 归一化后的视图：已到期的窗口按重置后的状态展示，记录本身不变。
    pub fn view_at(&self, model: &str, now: DateTime<Utc>) -> RecordView {
        let mut normalized = self.clone();
        normalized.expire_windows(now);
        normalized.view(model)
    }

    fn view(&self, model: &str) -> RecordView {
        RecordView {
            key_id: self.key.id.clone(),
            model: model.to_string(),
            region: self.key.region.clone(),
            request_count: self.request_count,
            request_limit: self.limits.request_limit,
            request_window_end: self.request_window_end,
            token_count: self.token_count,
            token_limit: self.limits.token_limit,
            token_window_end: self.token_window_end,
            health: self.health,
            avg_latency_secs: self.avg_latency_secs,
        }
    }
}

fn window_end(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// select 返回给调用方的句柄：足够发起上游调用，并用于回报结果。
#[derive(Debug, Clone)]
pub struct KeyHandle {
    pub(crate) key: Arc<Key>,
    pub(crate) model: Arc<str>,
    pub(crate) slot: usize,
}

impl KeyHandle {
    pub fn key_id(&self) -> &str {
        &self.key.id
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.key.provider
    }

    pub fn region(&self) -> Option<&str> {
        self.key.region.as_deref()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 发给上游的模型名：去掉 "openai:" 这类供应商前缀。
    ///
    /// 前缀只用于区分模型，不决定协议：所有 key 都按 OpenAI chat completions 格式调用，
    /// 非 OpenAI 兼容的供应商需要在 base_url 上提供兼容网关。
    pub fn upstream_model(&self) -> &str {
        match self.model.split_once(':') {
            Some((_, m)) if !m.is_empty() => m,
            _ => &self.model,
        }
    }
}

/// 只读快照，用于管理接口展示。
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    pub key_id: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub request_count: u64,
    pub request_limit: u64,
    pub request_window_end: DateTime<Utc>,
    pub token_count: u64,
    pub token_limit: u64,
    pub token_window_end: DateTime<Utc>,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_secs: Option<f64>,
}
