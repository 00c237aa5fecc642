//! 后台回收任务：定期对所有记录执行惰性过期，让没有流量的 key 也能按时恢复。

use crate::key_pool::KeyPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(10);

/// 启动后台回收任务。
///
/// - 间隔：固定周期，先等待再回收
/// - 只做窗口归一化，不参与筛选/选择
pub fn spawn_reclaim_task(pool: Arc<KeyPool>, interval: Duration) -> JoinHandle<()> {
    let interval = if interval.is_zero() {
        DEFAULT_RECLAIM_INTERVAL
    } else {
        interval
    };
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let stats = pool.reclaim().await;
            if stats.request_resets > 0 || stats.token_resets > 0 {
                tracing::debug!(
                    records = stats.records,
                    request_resets = stats.request_resets,
                    token_resets = stats.token_resets,
                    "回收任务重置了过期窗口"
                );
            }
        }
    })
}
