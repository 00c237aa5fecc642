use crate::key_pool::HealthPolicy;
use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_CONFIG_PATH: &str = "config/config.json";
const DEFAULT_RECLAIM_INTERVAL_SECS: u64 = 10;
const DEFAULT_TIMEOUT_MS: u64 = 120_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// key 配置文档位置：本地路径或 http(s) 地址。
    pub config_path: String,
    pub reclaim_interval_secs: u64,
    /// 请求未携带 region 时使用的地域偏好，空串表示不偏好。
    pub default_region: String,
    pub exclude_unhealthy: bool,

    pub timeout_ms: u64,
    pub proxy: String,

    /// 请求/响应日志等级；显式设为 off 时关闭全部日志。
    pub debug: String,

    /// 加载过程中被忽略的取值，日志初始化后再输出。
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<EnvValue>,
    #[serde(alias = "PORT")]
    port: Option<EnvValue>,

    #[serde(alias = "CONFIG_PATH")]
    config_path: Option<EnvValue>,
    #[serde(alias = "RECLAIM_INTERVAL_SECS")]
    reclaim_interval_secs: Option<EnvValue>,
    #[serde(alias = "DEFAULT_REGION")]
    default_region: Option<EnvValue>,
    #[serde(alias = "EXCLUDE_UNHEALTHY")]
    exclude_unhealthy: Option<EnvValue>,

    #[serde(alias = "TIMEOUT")]
    timeout: Option<EnvValue>,
    #[serde(alias = "PROXY")]
    proxy: Option<EnvValue>,

    #[serde(alias = "DEBUG")]
    debug: Option<EnvValue>,
}

/// figment 会把 `true`、`1`、`1.5` 这类环境变量值解析成对应类型，这里统一接收。
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum EnvValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl EnvValue {
    fn text(&self) -> String {
        match self {
            EnvValue::Bool(b) => b.to_string(),
            EnvValue::Int(n) => n.to_string(),
            EnvValue::Float(f) => f.to_string(),
            EnvValue::Text(s) => s.clone(),
        }
    }

    fn flag(&self) -> Option<bool> {
        match self {
            EnvValue::Bool(b) => Some(*b),
            EnvValue::Int(n) => Some(*n != 0),
            EnvValue::Float(_) => None,
            EnvValue::Text(s) => parse_bool(Some(s)),
        }
    }

    fn number<T: FromStr>(&self) -> Option<T> {
        match self {
            EnvValue::Int(n) => n.to_string().parse().ok(),
            EnvValue::Text(s) => s.trim().parse().ok(),
            EnvValue::Bool(_) | EnvValue::Float(_) => None,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let mut cfg = Self::from_figment(&Figment::from(Env::raw()));

        // 命令行覆盖：-debug <level>
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            if arg == "-debug"
                && let Some(v) = args.next()
            {
                cfg.debug = v;
            }
        }

        cfg
    }

    fn from_figment(figment: &Figment) -> Self {
        match figment.extract::<RawEnv>() {
            Ok(raw) => Self::from_raw(raw),
            Err(e) => {
                let mut cfg = Self::from_raw(RawEnv::default());
                cfg.warnings.push(format!("环境变量解析失败，全部使用默认配置: {e}"));
                cfg
            }
        }
    }

    fn from_raw(raw: RawEnv) -> Self {
        let mut warnings = Vec::new();
        let port = number(raw.port.as_ref(), "PORT", &mut warnings);
        let reclaim_interval_secs = number::<u64>(
            raw.reclaim_interval_secs.as_ref(),
            "RECLAIM_INTERVAL_SECS",
            &mut warnings,
        );
        let timeout_ms = number(raw.timeout.as_ref(), "TIMEOUT", &mut warnings);
        let exclude_unhealthy = match raw.exclude_unhealthy.as_ref() {
            None => false,
            Some(v) => v.flag().unwrap_or_else(|| {
                warnings.push(format!("EXCLUDE_UNHEALTHY={} 无法识别，按 false 处理", v.text()));
                false
            }),
        };

        Self {
            host: text(raw.host.as_ref()).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: port.unwrap_or(DEFAULT_PORT),
            config_path: text(raw.config_path.as_ref())
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string()),
            reclaim_interval_secs: reclaim_interval_secs
                .filter(|&s| s > 0)
                .unwrap_or(DEFAULT_RECLAIM_INTERVAL_SECS),
            default_region: text(raw.default_region.as_ref())
                .unwrap_or_default()
                .trim()
                .to_string(),
            exclude_unhealthy,
            timeout_ms: timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: text(raw.proxy.as_ref()).unwrap_or_default(),
            debug: text(raw.debug.as_ref()).unwrap_or_default(),
            warnings,
        }
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn health_policy(&self) -> HealthPolicy {
        if self.exclude_unhealthy {
            HealthPolicy::Exclude
        } else {
            HealthPolicy::Track
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

fn text(value: Option<&EnvValue>) -> Option<String> {
    value.map(EnvValue::text)
}

fn number<T: FromStr>(
    value: Option<&EnvValue>,
    name: &str,
    warnings: &mut Vec<String>,
) -> Option<T> {
    let value = value?;
    let parsed = value.number();
    if parsed.is_none() {
        warnings.push(format!("{name}={} 不是有效数字，使用默认值", value.text()));
    }
    parsed
}

fn parse_bool(value: Option<&str>) -> Option<bool> {
    match value?.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // 已在环境中显式设置的变量优先，不被 .env 覆盖。
        if std::env::var_os(&key).is_some() {
            continue;
        }
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let parent = dir.parent()?;
        if parent == dir {
            return None;
        }
        dir = parent;
    }
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }

    let raw = raw.trim();
    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return Some((key.to_string(), raw[1..raw.len() - 1].to_string()));
        }
    }

    Some((key.to_string(), strip_inline_comment(raw).trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let cfg = Config::from_raw(RawEnv::default());
        assert_eq!(cfg.host, DEFAULT_HOST);
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.config_path, DEFAULT_CONFIG_PATH);
        assert_eq!(cfg.reclaim_interval(), Duration::from_secs(10));
        assert_eq!(cfg.default_region, "");
        assert_eq!(cfg.health_policy(), HealthPolicy::Track);
    }

    #[test]
    fn zero_reclaim_interval_falls_back_to_default() {
        let cfg = Config::from_raw(RawEnv {
            reclaim_interval_secs: Some(EnvValue::Int(0)),
            exclude_unhealthy: Some(EnvValue::Text(" TRUE ".to_string())),
            default_region: Some(EnvValue::Text(" us-east ".to_string())),
            ..RawEnv::default()
        });
        assert_eq!(cfg.reclaim_interval_secs, DEFAULT_RECLAIM_INTERVAL_SECS);
        assert_eq!(cfg.health_policy(), HealthPolicy::Exclude);
        assert_eq!(cfg.default_region, "us-east");
    }

    #[test]
    fn exclude_unhealthy_accepts_parsed_values() {
        for (flag, expected, warned) in [
            (EnvValue::Bool(true), HealthPolicy::Exclude, false),
            (EnvValue::Int(0), HealthPolicy::Track, false),
            (EnvValue::Text("maybe".to_string()), HealthPolicy::Track, true),
        ] {
            let cfg = Config::from_raw(RawEnv {
                exclude_unhealthy: Some(flag),
                ..RawEnv::default()
            });
            assert_eq!(cfg.health_policy(), expected);
            assert_eq!(!cfg.warnings.is_empty(), warned);
        }
    }

    #[test]
    fn typed_env_values_keep_every_other_setting() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CONFIG_PATH", "/etc/keys.json");
            jail.set_env("EXCLUDE_UNHEALTHY", "true");
            jail.set_env("DEBUG", "1");
            jail.set_env("DEFAULT_REGION", "42");
            jail.set_env("PORT", "9100");
            jail.set_env("RECLAIM_INTERVAL_SECS", "soon");

            let cfg = Config::from_figment(&Figment::from(Env::raw()));
            assert_eq!(cfg.config_path, "/etc/keys.json");
            assert_eq!(cfg.health_policy(), HealthPolicy::Exclude);
            assert_eq!(cfg.debug, "1");
            assert_eq!(cfg.default_region, "42");
            assert_eq!(cfg.port, 9100);
            assert_eq!(cfg.reclaim_interval_secs, DEFAULT_RECLAIM_INTERVAL_SECS);
            assert!(
                cfg.warnings.iter().any(|w| w.contains("RECLAIM_INTERVAL_SECS")),
                "{:?}",
                cfg.warnings
            );
            Ok(())
        });
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert_eq!(parse_bool(Some("yes")), Some(true));
        assert_eq!(parse_bool(Some("0")), Some(false));
        assert_eq!(parse_bool(Some("maybe")), None);
        assert_eq!(parse_bool(None), None);
    }

    #[test]
    fn parse_dotenv_line_handles_quotes_and_comments() {
        assert_eq!(
            parse_dotenv_line("export CONFIG_PATH=\"conf/keys.json\""),
            Some(("CONFIG_PATH".to_string(), "conf/keys.json".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("PORT=9000 # local"),
            Some(("PORT".to_string(), "9000".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("TOKEN=a#b"),
            Some(("TOKEN".to_string(), "a#b".to_string()))
        );
        assert_eq!(parse_dotenv_line("# comment"), None);
        assert_eq!(parse_dotenv_line("=value"), None);
    }
}
