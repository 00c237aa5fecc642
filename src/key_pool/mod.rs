//! Key 池（Key Pool）模块。
//!
//! 目标：在多个上游凭证之间做准入控制，按请求数/token 两套滚动窗口配额筛选候选，
//! 优先调用方指定的地域、优先延迟更低的 key，并在候选之间轮询分摊负载。

pub mod clock;
mod manager;
mod reclaimer;
mod selector;
mod types;

pub use manager::{KeyPool, ReclaimStats};
pub use reclaimer::{DEFAULT_RECLAIM_INTERVAL, spawn_reclaim_task};
pub use types::{
    HealthPolicy, HealthStatus, Key, KeyDefinition, KeyHandle, ProviderConfig, RecordView,
    ResourceLimits,
};
