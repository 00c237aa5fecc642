//! 启动时的 key 配置文档（CONFIG_PATH 指向的 JSON）。
//!
//! 支持两种布局：
//! - 以 key 为中心：`{"keys": [{"id", "region", "provider", "models": {...}}]}`
//! - 以模型为中心（旧部署格式）：`{"keys": {"<model>": [{"rate_limit", "global_window", ...}]}}`，
//!   同一 id 出现在多个模型下时合并为一个 key
//!
//! 文档位置可以是本地路径、http(s) 地址或 `s3://bucket/key`。

use crate::key_pool::{Key, KeyDefinition, ProviderConfig, ResourceLimits};
use chrono::TimeDelta;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_WINDOW_SECS: u64 = 60;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// 窗口上限：一年。
const MAX_WINDOW_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("读取 key 配置失败 {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("拉取 key 配置失败: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("拉取 key 配置失败 {url}: HTTP {status}")]
    FetchStatus { url: String, status: u16 },

    #[error("不支持的配置地址: {0}（仅支持本地路径、http/https 与 s3）")]
    UnsupportedScheme(String),

    #[error("S3 配置地址无效: {0}（应为 s3://bucket/key）")]
    InvalidS3Path(String),

    #[error("从 S3 读取 key 配置失败: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("解析 key 配置失败: {0}")]
    Parse(#[from] sonic_rs::Error),

    #[error("key 配置无效: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct Document {
    keys: KeysSection,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum KeysSection {
    ByKey(Vec<KeyEntry>),
    ByModel(BTreeMap<String, Vec<LegacyKeyEntry>>),
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    id: String,
    #[serde(default)]
    region: Option<String>,
    provider: ProviderConfig,
    models: BTreeMap<String, LimitsEntry>,
}

#[derive(Debug, Deserialize)]
struct LimitsEntry {
    request_limit: u64,
    #[serde(default = "default_window_secs")]
    request_window_seconds: u64,
    token_limit: u64,
    #[serde(default = "default_window_secs")]
    token_window_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct LegacyKeyEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    region: Option<String>,
    provider: ProviderConfig,
    rate_limit: u64,
    #[serde(default = "default_window_secs")]
    global_window: u64,
    token_limit: u64,
    #[serde(default = "default_window_secs")]
    window: u64,
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

/// 从本地路径、http(s) 地址或 S3 加载 key 配置。
pub async fn load(location: &str) -> Result<Vec<KeyDefinition>, ProvisionError> {
    let location = location.trim();
    let bytes = if location.starts_with("http://") || location.starts_with("https://") {
        fetch_http(&http_client(FETCH_TIMEOUT)?, location).await?
    } else if location.starts_with("s3://") {
        let (bucket, key) = split_s3_location(location)?;
        fetch_s3(bucket, key).await?
    } else if let Some((scheme, _)) = location.split_once("://") {
        return Err(ProvisionError::UnsupportedScheme(format!("{scheme}://")));
    } else {
        tokio::fs::read(location)
            .await
            .map_err(|source| ProvisionError::Read {
                path: location.to_string(),
                source,
            })?
    };
    parse(&bytes)
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, ProvisionError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()?)
}

async fn fetch_http(client: &reqwest::Client, url: &str) -> Result<Vec<u8>, ProvisionError> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(ProvisionError::FetchStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(resp.bytes().await?.to_vec())
}

/// `s3://bucket/key` → (bucket, key)；bucket 与 key 都不能为空。
fn split_s3_location(location: &str) -> Result<(&str, &str), ProvisionError> {
    let invalid = || ProvisionError::InvalidS3Path(location.to_string());
    let rest = location.strip_prefix("s3://").ok_or_else(invalid)?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => Err(invalid()),
    }
}

/// 凭证、region 与 endpoint 从标准 AWS_* 环境变量读取。
async fn fetch_s3(bucket: &str, key: &str) -> Result<Vec<u8>, ProvisionError> {
    let store = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .build()?;
    let path = ObjectPath::parse(key)
        .map_err(|e| ProvisionError::InvalidS3Path(format!("s3://{bucket}/{key}: {e}")))?;
    let object = store.get(&path).await?;
    Ok(object.bytes().await?.to_vec())
}

/// 解析并校验 key 配置文档；同一模型下记录顺序即文档中出现的顺序。
pub fn parse(bytes: &[u8]) -> Result<Vec<KeyDefinition>, ProvisionError> {
    let doc: Document = sonic_rs::from_slice(bytes)?;
    let defs = match doc.keys {
        KeysSection::ByKey(entries) => entries
            .into_iter()
            .map(|e| {
                let models = e
                    .models
                    .into_iter()
                    .map(|(model, l)| {
                        let parsed = limits(
                            &e.id,
                            l.request_limit,
                            l.request_window_seconds,
                            l.token_limit,
                            l.token_window_seconds,
                        )?;
                        Ok((model, parsed))
                    })
                    .collect::<Result<Vec<_>, ProvisionError>>()?;
                Ok(KeyDefinition {
                    key: key(e.id, e.region, e.provider),
                    models,
                })
            })
            .collect::<Result<Vec<_>, ProvisionError>>()?,
        KeysSection::ByModel(by_model) => group_legacy(by_model)?,
    };
    validate(&defs)?;
    Ok(defs)
}

/// 旧格式按模型列出 key；按 id 合并，使同一凭证在各模型下各有一条记录。
///
/// 合并后的 key 按首次出现的顺序排列。同一 id 的 provider/region 必须一致，
/// 且不能在同一模型下出现两次。
fn group_legacy(
    by_model: BTreeMap<String, Vec<LegacyKeyEntry>>,
) -> Result<Vec<KeyDefinition>, ProvisionError> {
    let mut out: Vec<KeyDefinition> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (model, entries) in by_model {
        for (i, e) in entries.into_iter().enumerate() {
            let id = match e.id {
                Some(id) if !id.trim().is_empty() => id,
                _ => format!("{model}#{i}"),
            };
            let parsed = limits(&id, e.rate_limit, e.global_window, e.token_limit, e.window)?;
            let key = key(id, e.region, e.provider);

            let Some(&at) = index.get(&key.id) else {
                index.insert(key.id.clone(), out.len());
                out.push(KeyDefinition {
                    key,
                    models: vec![(model.clone(), parsed)],
                });
                continue;
            };

            let def = &mut out[at];
            if def.key.provider != key.provider || def.key.region != key.region {
                return Err(ProvisionError::Invalid(format!(
                    "key {} 在不同模型下的 provider/region 不一致",
                    key.id
                )));
            }
            if def.models.iter().any(|(m, _)| *m == model) {
                return Err(ProvisionError::Invalid(format!(
                    "key {} 在模型 {model} 下重复",
                    key.id
                )));
            }
            def.models.push((model.clone(), parsed));
        }
    }
    Ok(out)
}

fn key(id: String, region: Option<String>, provider: ProviderConfig) -> Key {
    let region = region
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    Key {
        id: id.trim().to_string(),
        provider,
        region,
    }
}

fn limits(
    key_id: &str,
    request_limit: u64,
    request_window_secs: u64,
    token_limit: u64,
    token_window_secs: u64,
) -> Result<ResourceLimits, ProvisionError> {
    Ok(ResourceLimits {
        request_limit,
        request_window: window(key_id, request_window_secs)?,
        token_limit,
        token_window: window(key_id, token_window_secs)?,
    })
}

fn window(key_id: &str, secs: u64) -> Result<TimeDelta, ProvisionError> {
    if !(1..=MAX_WINDOW_SECS).contains(&secs) {
        return Err(ProvisionError::Invalid(format!(
            "key {key_id} 的窗口长度 {secs}s 超出范围 1..={MAX_WINDOW_SECS}"
        )));
    }
    // 已限定在一年以内，不会溢出
    Ok(TimeDelta::seconds(secs as i64))
}

fn validate(defs: &[KeyDefinition]) -> Result<(), ProvisionError> {
    let mut seen = HashSet::new();
    for d in defs {
        let id = d.key.id.as_str();
        if id.is_empty() {
            return Err(ProvisionError::Invalid("key id 不能为空".to_string()));
        }
        if !seen.insert(id) {
            return Err(ProvisionError::Invalid(format!("key id 重复: {id}")));
        }
        if d.models.is_empty() {
            return Err(ProvisionError::Invalid(format!("key {id} 没有配置任何模型")));
        }
        if d.models.iter().any(|(m, _)| m.trim().is_empty()) {
            return Err(ProvisionError::Invalid(format!("key {id} 存在空模型名")));
        }
        if d.key.provider.base_url.trim().is_empty() {
            return Err(ProvisionError::Invalid(format!("key {id} 的 provider.base_url 为空")));
        }
    }
    Ok(())
}
