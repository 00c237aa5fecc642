//! 选择算法：配额筛选 → 地域软偏好 → 按延迟排序 → 轮询取一个。
//!
//! 纯函数，不修改任何状态；由 KeyPool 在持锁期间调用，选中后再原地预占。

use crate::key_pool::types::{HealthPolicy, QuotaRecord};
use std::cmp::Ordering;

/// 一次选择的输入参数。
#[derive(Debug, Clone, Copy)]
pub struct Criteria<'a> {
    pub region_hint: &'a str,
    pub estimated_cost: u64,
    pub health_policy: HealthPolicy,
}

/// 在 records 中选出一个 key，返回其下标；没有候选时返回 None。
///
/// scratch 是调用方复用的缓冲区，避免每次选择都分配。
pub fn pick(
    records: &[QuotaRecord],
    cursor: u64,
    criteria: Criteria<'_>,
    scratch: &mut Vec<usize>,
) -> Option<usize> {
    scratch.clear();
    scratch.extend(
        records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_eligible(criteria.estimated_cost, criteria.health_policy))
            .map(|(i, _)| i),
    );

    // 地域只是偏好：有匹配就收窄，没有匹配保留全部候选。
    let region = criteria.region_hint.trim();
    if !region.is_empty() && scratch.iter().any(|&i| records[i].key.in_region(region)) {
        scratch.retain(|&i| records[i].key.in_region(region));
    }

    if scratch.is_empty() {
        return None;
    }

    // 下标作为次级键，等价于稳定排序，同时不额外分配。
    scratch.sort_unstable_by(|&a, &b| {
        compare_latency(&records[a], &records[b]).then_with(|| a.cmp(&b))
    });

    let idx = (cursor % scratch.len() as u64) as usize;
    Some(scratch[idx])
}

fn compare_latency(a: &QuotaRecord, b: &QuotaRecord) -> Ordering {
    a.latency_rank().total_cmp(&b.latency_rank())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pool::types::tests::{limits, test_key};
    use chrono::{TimeZone, Utc};

    fn record(id: &str, region: Option<&str>, request_limit: u64, token_limit: u64) -> QuotaRecord {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        QuotaRecord::new(test_key(id, region), limits(request_limit, token_limit), now)
    }

    fn criteria(region_hint: &str, estimated_cost: u64) -> Criteria<'_> {
        Criteria {
            region_hint,
            estimated_cost,
            health_policy: HealthPolicy::Track,
        }
    }

    #[test]
    fn returns_none_when_every_key_lacks_request_budget() {
        let mut records = vec![record("a", None, 1, 100), record("b", None, 1, 100)];
        for r in &mut records {
            r.reserve(0);
        }
        let mut scratch = Vec::new();
        assert_eq!(pick(&records, 0, criteria("", 1), &mut scratch), None);
    }

    #[test]
    fn returns_none_when_every_key_lacks_token_budget() {
        let records = vec![record("a", None, 5, 10), record("b", None, 5, 20)];
        let mut scratch = Vec::new();
        assert_eq!(pick(&records, 0, criteria("", 21), &mut scratch), None);
        assert_eq!(pick(&records, 0, criteria("", 20), &mut scratch), Some(1));
    }

    #[test]
    fn cursor_rotates_in_insertion_order_when_latency_ties() {
        let records = vec![record("a", None, 5, 100), record("b", None, 5, 100)];
        let mut scratch = Vec::new();
        let picks: Vec<_> = (0..4)
            .map(|c| pick(&records, c, criteria("", 1), &mut scratch))
            .collect();
        assert_eq!(picks, vec![Some(0), Some(1), Some(0), Some(1)]);
    }

    #[test]
    fn lowest_latency_ranks_first_and_unobserved_last() {
        let mut records = vec![
            record("unobserved", None, 5, 100),
            record("slow", None, 5, 100),
            record("fast", None, 5, 100),
        ];
        records[1].observe_latency(2.0);
        records[2].observe_latency(0.5);
        let mut scratch = Vec::new();
        assert_eq!(pick(&records, 0, criteria("", 1), &mut scratch), Some(2));
        assert_eq!(pick(&records, 1, criteria("", 1), &mut scratch), Some(1));
        assert_eq!(pick(&records, 2, criteria("", 1), &mut scratch), Some(0));
    }

    #[test]
    fn region_hint_narrows_when_matches_exist() {
        let records = vec![
            record("east", Some("us-east"), 5, 100),
            record("west", Some("us-west"), 5, 100),
            record("none", None, 5, 100),
        ];
        let mut scratch = Vec::new();
        for c in 0..3 {
            assert_eq!(pick(&records, c, criteria("us-west", 1), &mut scratch), Some(1));
        }
    }

    #[test]
    fn region_hint_falls_back_to_all_candidates() {
        let mut records = vec![
            record("east", Some("us-east"), 1, 100),
            record("west", Some("us-west"), 5, 100),
        ];
        // 唯一的 east key 已耗尽：偏好落空，回退到全部候选
        records[0].reserve(0);
        let mut scratch = Vec::new();
        assert_eq!(pick(&records, 0, criteria("us-east", 1), &mut scratch), Some(1));
        assert_eq!(pick(&records, 0, criteria("eu-central", 1), &mut scratch), Some(1));
    }

    #[test]
    fn unhealthy_key_stays_candidate_unless_excluded() {
        let mut records = vec![record("a", None, 5, 100)];
        records[0].mark_unhealthy();
        let mut scratch = Vec::new();
        assert_eq!(pick(&records, 0, criteria("", 1), &mut scratch), Some(0));

        let exclude = Criteria {
            health_policy: HealthPolicy::Exclude,
            ..criteria("", 1)
        };
        assert_eq!(pick(&records, 0, exclude, &mut scratch), None);
    }

    #[test]
    fn cursor_wraps_without_overflow() {
        let records = vec![record("a", None, 5, 100), record("b", None, 5, 100)];
        let mut scratch = Vec::new();
        assert_eq!(pick(&records, u64::MAX, criteria("", 1), &mut scratch), Some(1));
    }
}
