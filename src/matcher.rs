use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::IpNet;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::config::{Config, DomainRule, Strategy};

/// Strip the trailing dot and lower-case, so wire names, config patterns
/// and cache keys all compare equal.
pub fn normalize_name(name: &str) -> String {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    trimmed.to_ascii_lowercase()
}

/// Set of operator-owned CDN prefixes. Membership is a linear scan; prefix
/// lists are typically a few hundred entries at most.
#[derive(Debug, Clone, Default)]
pub struct CidrSet {
    nets: Vec<IpNet>,
}

impl CidrSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cidr: &str) -> Result<()> {
        let net: IpNet = cidr
            .trim()
            .parse()
            .with_context(|| format!("invalid cidr: {cidr:?}"))?;
        let net = net.trunc();
        if !self.nets.contains(&net) {
            self.nets.push(net);
        }
        Ok(())
    }

    pub fn add_many<I, S>(&mut self, cidrs: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for cidr in cidrs {
            self.add(cidr.as_ref())?;
        }
        Ok(())
    }

    #[allow(dead_code)]
    pub fn remove(&mut self, cidr: &str) {
        if let Ok(net) = cidr.trim().parse::<IpNet>() {
            let net = net.trunc();
            self.nets.retain(|existing| *existing != net);
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(&ip))
    }

    #[allow(dead_code)]
    pub fn networks(&self) -> &[IpNet] {
        &self.nets
    }

    #[allow(dead_code)]
    pub fn clear(&mut self) {
        self.nets.clear();
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

#[derive(Debug, Clone)]
enum PatternKind {
    Exact(String),
    /// `*.SUFFIX` — matches any name below the suffix, never the apex.
    Wildcard { suffix: String, apex: String },
    Regex(Regex),
}

/// A single compiled domain pattern.
#[derive(Debug, Clone)]
pub struct DomainPattern {
    raw: String,
    kind: PatternKind,
}

impl DomainPattern {
    pub fn compile(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            anyhow::bail!("empty domain pattern");
        }

        // "regex:" opts out of glob translation; the expression is taken as
        // written (names it is tested against are already lower-case).
        if let Some(expr) = trimmed.strip_prefix("regex:") {
            let regex = Regex::new(expr)
                .with_context(|| format!("invalid regex pattern: {raw:?}"))?;
            return Ok(Self {
                raw: trimmed.to_string(),
                kind: PatternKind::Regex(regex),
            });
        }

        let lowered = trimmed.to_ascii_lowercase();

        if let Some(rest) = lowered.strip_prefix("*.") {
            if !rest.contains('*') && !rest.contains('?') {
                return Ok(Self {
                    raw: lowered.clone(),
                    kind: PatternKind::Wildcard {
                        suffix: lowered[1..].to_string(),
                        apex: rest.to_string(),
                    },
                });
            }
        }

        if lowered.contains('*') || lowered.contains('?') {
            let regex = compile_glob(&lowered)
                .with_context(|| format!("invalid glob pattern: {raw:?}"))?;
            return Ok(Self {
                raw: lowered,
                kind: PatternKind::Regex(regex),
            });
        }

        Ok(Self {
            raw: lowered.clone(),
            kind: PatternKind::Exact(lowered),
        })
    }

    /// `name` must already be normalised.
    pub fn matches(&self, name: &str) -> bool {
        match &self.kind {
            PatternKind::Exact(exact) => exact == name,
            PatternKind::Wildcard { suffix, apex } => name != apex && name.ends_with(suffix),
            PatternKind::Regex(regex) => regex.is_match(name),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    fn is_exact(&self) -> bool {
        matches!(self.kind, PatternKind::Exact(_))
    }
}

/// `*` → `.*`, `?` → `.`, everything else literal, anchored both sides.
fn compile_glob(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() * 2 + 2);
    expr.push('^');
    let mut scratch = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(other.encode_utf8(&mut scratch))),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}

/// A steering rule: a compiled pattern plus the rewrite policy for names it
/// matches.
#[derive(Debug, Clone)]
pub struct SteerRule {
    pub pattern: DomainPattern,
    pub strategy: Strategy,
    pub ttl: u32,
    pub strip_cname_when_no_record: bool,
    pub no_record_no_fallback: Option<bool>,
}

impl SteerRule {
    pub fn from_config(rule: &DomainRule) -> Result<Self> {
        Ok(Self {
            pattern: DomainPattern::compile(&rule.pattern)?,
            strategy: rule.strategy,
            ttl: rule.ttl,
            strip_cname_when_no_record: rule.strip_cname_when_no_record,
            no_record_no_fallback: rule.no_record_no_fallback,
        })
    }
}

/// Ordered rule list with an exact-match side table. First match in
/// configuration order wins.
#[derive(Debug, Clone, Default)]
pub struct DomainSet {
    rules: Vec<SteerRule>,
    exact: FxHashMap<String, usize>,
}

impl DomainSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: SteerRule) {
        let idx = self.rules.len();
        if rule.pattern.is_exact() {
            self.exact.entry(rule.pattern.raw().to_string()).or_insert(idx);
        }
        self.rules.push(rule);
    }

    /// Removes every rule whose raw pattern equals `pattern`.
    #[allow(dead_code)]
    pub fn remove(&mut self, pattern: &str) {
        let target = pattern.trim().to_ascii_lowercase();
        self.rules.retain(|rule| rule.pattern.raw() != target);
        self.rebuild_exact();
    }

    fn rebuild_exact(&mut self) {
        self.exact.clear();
        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.pattern.is_exact() {
                self.exact.entry(rule.pattern.raw().to_string()).or_insert(idx);
            }
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = normalize_name(name);
        if self.exact.contains_key(&name) {
            return true;
        }
        self.rules.iter().any(|rule| rule.pattern.matches(&name))
    }

    /// First rule matching `name`, in configuration order.
    pub fn rule_for(&self, name: &str) -> Option<&SteerRule> {
        let name = normalize_name(name);
        self.rules.iter().find(|rule| rule.pattern.matches(&name))
    }

    #[allow(dead_code)]
    pub fn rules(&self) -> &[SteerRule] {
        &self.rules
    }

    #[allow(dead_code)]
    pub fn clear(&mut self) {
        self.rules.clear();
        self.exact.clear();
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// One immutable snapshot of the active configuration with matchers
/// compiled. Handlers load it once per request from the shared
/// `ArcSwap` and keep it for the request's duration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub upstream: String,
    pub fallback: Option<String>,
    pub timeout: Duration,
    pub no_record_no_fallback: bool,
    pub listen: SocketAddr,
    pub workers: usize,
    pub cache_size: usize,
    pub cache_ttl: Duration,
    pub cdn_ips: CidrSet,
    pub domains: DomainSet,
}

impl RuntimeConfig {
    /// Compile a validated config. Any CIDR or pattern error fails the whole
    /// compilation so a reload either applies completely or not at all.
    pub fn from_config(cfg: Config) -> Result<Self> {
        let listen = parse_listen(&cfg.server.listen)?;

        let mut cdn_ips = CidrSet::new();
        cdn_ips.add_many(&cfg.cdn_ips).context("compile cdn_ips")?;

        let mut domains = DomainSet::new();
        for rule in &cfg.domains {
            domains.add(SteerRule::from_config(rule).context("compile domain rules")?);
        }

        let fallback = cfg
            .upstream
            .fallback_server
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Ok(Self {
            upstream: cfg.upstream.server.trim().to_string(),
            fallback,
            timeout: cfg.upstream.timeout,
            no_record_no_fallback: cfg.upstream.no_record_no_fallback,
            listen,
            workers: cfg.server.workers,
            cache_size: cfg.server.cache_size,
            cache_ttl: cfg.server.cache_ttl,
            cdn_ips,
            domains,
        })
    }
}

/// ":53" 简写展开为 "0.0.0.0:53"
pub fn parse_listen(addr: &str) -> Result<SocketAddr> {
    let trimmed = addr.trim();
    let full = if trimmed.starts_with(':') {
        format!("0.0.0.0{trimmed}")
    } else {
        trimmed.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address: {addr:?}"))
}
