use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cdn_ips: Vec<String>,
    #[serde(default)]
    pub domains: Vec<DomainRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// 主上游 DNS 服务器 "HOST:PORT"
    pub server: String,
    /// 备用上游，主上游未返回 CDN 地址时使用
    #[serde(default)]
    pub fallback_server: Option<String>,
    /// 上游交换超时
    #[serde(default = "default_upstream_timeout", deserialize_with = "de_duration")]
    pub timeout: Duration,
    /// 响应无 A/AAAA 记录时跳过备用上游（全局默认，可被规则覆盖）
    #[serde(default)]
    pub no_record_no_fallback: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，支持 ":53" 简写
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 并发 worker 数量，必须大于 0
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_cache_ttl", deserialize_with = "de_duration")]
    pub cache_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: 0,
            cache_size: default_cache_size(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainRule {
    /// 域名模式：精确、"*.SUFFIX" 泛域名、glob（*/?）或 "regex:" 前缀正则
    pub pattern: String,
    #[serde(default)]
    pub strategy: Strategy,
    /// return_cdn_a 策略返回给客户端的 TTL（秒），0 表示默认值
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub strip_cname_when_no_record: bool,
    /// 按规则覆盖全局 no_record_no_fallback
    #[serde(default)]
    pub no_record_no_fallback: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 过滤答案中非 CDN 的地址记录
    FilterNonCdn,
    /// 丢弃上游答案，直接返回 CDN A 记录
    ReturnCdnA,
    #[default]
    None,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;

    cfg.validate()?;

    info!(
        target = "config",
        upstream = %cfg.upstream.server,
        cdn_prefixes = cfg.cdn_ips.len(),
        domain_rules = cfg.domains.len(),
        "config loaded"
    );

    Ok(cfg)
}

impl Config {
    /// 基本校验；CIDR 和域名模式的编译错误由 RuntimeConfig::from_config 报告
    pub fn validate(&self) -> Result<()> {
        if self.upstream.server.trim().is_empty() {
            bail!("upstream.server must not be empty");
        }
        if self.server.workers == 0 {
            bail!("server.workers must be greater than 0");
        }
        if self.cdn_ips.is_empty() {
            bail!("cdn_ips must list at least one prefix");
        }
        if self.server.cache_ttl.is_zero() {
            bail!("server.cache_ttl must be greater than 0");
        }
        if self.upstream.timeout.is_zero() {
            bail!("upstream.timeout must be greater than 0");
        }
        Ok(())
    }
}

/// 解析 "5s" / "500ms" / "1m" / "2h" 形式的时长；纯数字按秒处理
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let parse_num = |v: &str, unit: &str| -> Result<u64> {
        v.trim()
            .parse::<u64>()
            .with_context(|| format!("invalid duration {raw:?} (expected e.g. \"5{unit}\")"))
    };
    if let Some(v) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse_num(v, "ms")?));
    }
    if let Some(v) = s.strip_suffix('s') {
        return Ok(Duration::from_secs(parse_num(v, "s")?));
    }
    if let Some(v) = s.strip_suffix('m') {
        return Ok(Duration::from_secs(parse_num(v, "m")? * 60));
    }
    if let Some(v) = s.strip_suffix('h') {
        return Ok(Duration::from_secs(parse_num(v, "h")? * 3600));
    }
    Ok(Duration::from_secs(parse_num(s, "s")?))
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
    }
}

fn default_listen() -> String {
    ":53".to_string()
}

fn default_cache_size() -> usize {
    1024
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
upstream:
  server: "8.8.8.8:53"
  fallback_server: "1.1.1.1:53"
  timeout: "5s"
  no_record_no_fallback: true
server:
  listen: ":5353"
  workers: 4
  cache_size: 500
  cache_ttl: "60s"
cdn_ips:
  - "192.168.1.0/24"
domains:
  - pattern: "*.cdn.com"
    strategy: "filter_non_cdn"
  - pattern: "static.example.com"
    strategy: "return_cdn_a"
    ttl: 30
    strip_cname_when_no_record: true
    no_record_no_fallback: false
"#;

    #[test]
    fn parses_full_config() {
        let cfg: Config = serde_yaml::from_str(FULL).expect("parse");
        cfg.validate().expect("validate");
        assert_eq!(cfg.upstream.server, "8.8.8.8:53");
        assert_eq!(cfg.upstream.fallback_server.as_deref(), Some("1.1.1.1:53"));
        assert_eq!(cfg.upstream.timeout, Duration::from_secs(5));
        assert!(cfg.upstream.no_record_no_fallback);
        assert_eq!(cfg.server.workers, 4);
        assert_eq!(cfg.server.cache_size, 500);
        assert_eq!(cfg.server.cache_ttl, Duration::from_secs(60));
        assert_eq!(cfg.domains.len(), 2);
        assert_eq!(cfg.domains[0].strategy, Strategy::FilterNonCdn);
        let second = &cfg.domains[1];
        assert_eq!(second.strategy, Strategy::ReturnCdnA);
        assert_eq!(second.ttl, 30);
        assert!(second.strip_cname_when_no_record);
        assert_eq!(second.no_record_no_fallback, Some(false));
    }

    #[test]
    fn optional_fields_default() {
        let raw = r#"
upstream:
  server: "9.9.9.9:53"
server:
  workers: 2
cdn_ips:
  - "10.0.0.0/8"
"#;
        let cfg: Config = serde_yaml::from_str(raw).expect("parse");
        cfg.validate().expect("validate");
        assert!(cfg.upstream.fallback_server.is_none());
        assert!(!cfg.upstream.no_record_no_fallback);
        assert_eq!(cfg.upstream.timeout, Duration::from_secs(5));
        assert_eq!(cfg.server.listen, ":53");
        assert_eq!(cfg.server.cache_size, 1024);
        assert_eq!(cfg.server.cache_ttl, Duration::from_secs(300));
        assert!(cfg.domains.is_empty());
    }

    #[test]
    fn validation_rejects_bad_configs() {
        let mut cfg: Config = serde_yaml::from_str(FULL).expect("parse");
        cfg.upstream.server = "  ".into();
        assert!(cfg.validate().is_err());

        let mut cfg: Config = serde_yaml::from_str(FULL).expect("parse");
        cfg.server.workers = 0;
        assert!(cfg.validate().is_err());

        let mut cfg: Config = serde_yaml::from_str(FULL).expect("parse");
        cfg.cdn_ips.clear();
        assert!(cfg.validate().is_err());

        let mut cfg: Config = serde_yaml::from_str(FULL).expect("parse");
        cfg.server.cache_ttl = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unknown_strategy() {
        let raw = r#"
upstream:
  server: "9.9.9.9:53"
server:
  workers: 1
cdn_ips: ["10.0.0.0/8"]
domains:
  - pattern: "a.example"
    strategy: "drop_everything"
"#;
        assert!(serde_yaml::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn duration_formats() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn duration_accepts_bare_yaml_number() {
        let raw = r#"
upstream:
  server: "9.9.9.9:53"
  timeout: 3
server:
  workers: 1
cdn_ips: ["10.0.0.0/8"]
"#;
        let cfg: Config = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(cfg.upstream.timeout, Duration::from_secs(3));
    }
}
