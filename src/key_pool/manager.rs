use crate::key_pool::clock::{Clock, SystemClock};
use crate::key_pool::selector::{self, Criteria};
use crate::key_pool::types::{HealthPolicy, KeyDefinition, KeyHandle, QuotaRecord, RecordView};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Key 池：按模型分组维护所有配额记录，是共享状态唯一的修改入口。
///
/// 所有操作都在同一把池级锁内完成，持锁期间不做任何 await。
#[derive(Debug)]
pub struct KeyPool {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    health_policy: HealthPolicy,
    record_count: usize,
}

#[derive(Debug)]
struct Inner {
    classes: BTreeMap<String, ClassPool>,
    scratch: Vec<usize>,
}

/// 一个模型下的记录（按配置顺序）与轮询游标。
#[derive(Debug)]
struct ClassPool {
    model: Arc<str>,
    records: Vec<QuotaRecord>,
    cursor: u64,
}

/// 一次后台回收的统计。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub records: usize,
    pub request_resets: usize,
    pub token_resets: usize,
}

impl KeyPool {
    pub fn new(definitions: Vec<KeyDefinition>, health_policy: HealthPolicy) -> Self {
        Self::with_clock(definitions, health_policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        definitions: Vec<KeyDefinition>,
        health_policy: HealthPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let mut classes: BTreeMap<String, ClassPool> = BTreeMap::new();
        let mut record_count = 0usize;
        let mut widest = 0usize;

        for def in definitions {
            let key = Arc::new(def.key);
            for (model, limits) in def.models {
                let class = classes.entry(model.clone()).or_insert_with(|| ClassPool {
                    model: Arc::from(model.as_str()),
                    records: Vec::new(),
                    cursor: 0,
                });
                class.records.push(QuotaRecord::new(key.clone(), limits, now));
                widest = widest.max(class.records.len());
                record_count += 1;
            }
        }

        Self {
            inner: Mutex::new(Inner {
                classes,
                scratch: Vec::with_capacity(widest),
            }),
            clock,
            health_policy,
            record_count,
        }
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn health_policy(&self) -> HealthPolicy {
        self.health_policy
    }

    /// 为一次请求选择 key 并预占配额；没有可用 key（含未知模型）时返回 None。
    pub async fn select(
        &self,
        model: &str,
        region_hint: &str,
        estimated_cost: u64,
    ) -> Option<KeyHandle> {
        let selected = {
            let mut guard = self.inner.lock().await;
            let now = self.clock.now();
            let Inner { classes, scratch } = &mut *guard;
            // 未知模型等同于没有候选。
            classes.get_mut(model).and_then(|class| {
                for record in class.records.iter_mut() {
                    record.expire_windows(now);
                }

                let criteria = Criteria {
                    region_hint,
                    estimated_cost,
                    health_policy: self.health_policy,
                };
                let slot = selector::pick(&class.records, class.cursor, criteria, scratch)?;
                class.cursor = class.cursor.wrapping_add(1);
                let record = &mut class.records[slot];
                record.reserve(estimated_cost);
                Some(KeyHandle {
                    key: record.key.clone(),
                    model: class.model.clone(),
                    slot,
                })
            })
        };

        match &selected {
            Some(handle) => tracing::debug!(
                key_id = %handle.key_id(),
                model = %model,
                region = %region_hint,
                estimated_cost,
                "已选择 key 并预占配额"
            ),
            None => tracing::info!(
                model = %model,
                region = %region_hint,
                estimated_cost,
                "没有可用的 key"
            ),
        }
        selected
    }

    /// 回报一次上游调用结果：成功则更新延迟均值，失败则标记 unhealthy。
    ///
    /// 已预占的配额不会退还。
    pub async fn report_outcome(
        &self,
        handle: &KeyHandle,
        observed_latency: Option<Duration>,
        succeeded: bool,
    ) {
        let found = {
            let mut guard = self.inner.lock().await;
            let record = guard
                .classes
                .get_mut(handle.model())
                .and_then(|c| c.records.get_mut(handle.slot))
                .filter(|r| Arc::ptr_eq(&r.key, &handle.key));

            match record {
                Some(record) => {
                    if succeeded {
                        if let Some(latency) = observed_latency {
                            record.observe_latency(latency.as_secs_f64());
                        }
                    } else {
                        record.mark_unhealthy();
                    }
                    true
                }
                None => false,
            }
        };

        if !found {
            tracing::warn!(
                key_id = %handle.key_id(),
                model = %handle.model(),
                "回报结果时找不到对应的配额记录，已忽略"
            );
        } else if !succeeded {
            tracing::warn!(
                key_id = %handle.key_id(),
                model = %handle.model(),
                "上游调用失败，key 标记为 unhealthy"
            );
        }
    }

    /// 对所有记录执行一次惰性过期（与 select 共用同一归一化逻辑）。
    pub async fn reclaim(&self) -> ReclaimStats {
        let mut guard = self.inner.lock().await;
        let now = self.clock.now();
        let mut stats = ReclaimStats::default();
        for class in guard.classes.values_mut() {
            for record in class.records.iter_mut() {
                let reset = record.expire_windows(now);
                stats.records += 1;
                stats.request_resets += usize::from(reset.request);
                stats.token_resets += usize::from(reset.token);
            }
        }
        stats
    }

    /// 所有记录的只读快照（按模型名、再按配置顺序）。
    ///
    /// 已到期的窗口按重置后的状态展示，但不写回记录；真正的重置仍由 select 或 reclaim 完成。
    pub async fn snapshot(&self) -> Vec<RecordView> {
        let guard = self.inner.lock().await;
        let now = self.clock.now();
        let mut out = Vec::with_capacity(self.record_count);
        for (model, class) in &guard.classes {
            out.extend(class.records.iter().map(|r| r.view_at(model, now)));
        }
        out
    }
}
