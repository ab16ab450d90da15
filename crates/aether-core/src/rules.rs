//! Rule-based action selection for inbound connections.
//!
//! The dispatcher asks the engine what to do with each `(domain, ip,
//! port)` request: tunnel it, dial it directly, or refuse it. Rules are
//! evaluated in strictly decreasing priority with first-match-wins
//! semantics; an update replaces the whole list atomically so readers
//! always see a consistent snapshot.

use std::{
    net::IpAddr,
    sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};

/// What to do with a matched request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    /// Tunnel through the gateway.
    Proxy,
    /// Dial the target directly from the client.
    Direct,
    /// Drop the inbound connection without a reply.
    Block,
    /// Refuse the inbound connection with a protocol-level rejection.
    Reject,
}

/// A single match condition; a rule fires when *any* of its matches does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum RuleMatch {
    /// Domain equals the value exactly (case-insensitive).
    DomainExact(String),
    /// Domain equals the value or ends with `.value`.
    DomainSuffix(String),
    /// Domain contains the value as a substring.
    DomainKeyword(String),
    /// Destination IP falls inside a CIDR block.
    IpCidr(CidrBlock),
    /// Destination IP is in a named geographic region (needs a provider).
    GeoIp(String),
    /// Domain is in a named geo-site set (needs a provider).
    GeoSite(String),
    /// Destination port equals the value.
    Port(u16),
}

/// One routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Stable rule identifier reported in match results.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Higher priority evaluates first.
    pub priority: i32,
    /// Disabled rules are skipped without being removed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Action taken when the rule fires.
    pub action: RuleAction,
    /// Any-of match list.
    pub matches: Vec<RuleMatch>,
}

fn default_enabled() -> bool {
    true
}

/// The request a rule list is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest<'a> {
    /// Destination hostname, when the inbound carried one.
    pub domain: Option<&'a str>,
    /// Destination IP, when the inbound carried a literal.
    pub ip: Option<IpAddr>,
    /// Destination port.
    pub port: u16,
}

/// Outcome of rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// Selected action.
    pub action: RuleAction,
    /// Rule that fired; `None` when the default action applied.
    pub rule_id: Option<String>,
}

/// Resolver for geographic match types.
///
/// The engine itself ships no geo database; deployments that want
/// GeoIp/GeoSite rules inject an implementation. Without one those match
/// types never fire.
pub trait GeoProvider: Send + Sync {
    /// Whether `ip` belongs to the named region (e.g. `"CN"`).
    fn ip_in_region(&self, ip: IpAddr, region: &str) -> bool;
    /// Whether `domain` belongs to the named site set.
    fn domain_in_set(&self, domain: &str, set: &str) -> bool;
}

/// Rule engine holding an atomically-replaceable sorted rule list.
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<Rule>>>,
    default_action: RuleAction,
    geo: Option<Arc<dyn GeoProvider>>,
}

impl std::fmt::Debug for RuleEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEngine")
            .field("rules", &self.snapshot().len())
            .field("default_action", &self.default_action)
            .field("geo", &self.geo.is_some())
            .finish()
    }
}

impl RuleEngine {
    /// Engine with the given rules and default action, no geo provider.
    #[must_use]
    pub fn new(rules: Vec<Rule>, default_action: RuleAction) -> Self {
        let engine = Self { rules: RwLock::new(Arc::new(Vec::new())), default_action, geo: None };
        engine.replace_rules(rules);
        engine
    }

    /// Attach a geo provider enabling GeoIp/GeoSite match types.
    #[must_use]
    pub fn with_geo_provider(mut self, geo: Arc<dyn GeoProvider>) -> Self {
        self.geo = Some(geo);
        self
    }

    /// Action taken when no rule matches.
    #[must_use]
    pub fn default_action(&self) -> RuleAction {
        self.default_action
    }

    /// Replace the whole rule list atomically. The list is sorted by
    /// descending priority once here, so lookups never sort.
    pub fn replace_rules(&self, rules: Vec<Rule>) {
        let mut sorted = rules;
        // Stable sort: equal priorities keep list order (tie-break contract).
        sorted.sort_by_key(|rule| std::cmp::Reverse(rule.priority));
        if let Ok(mut guard) = self.rules.write() {
            *guard = Arc::new(sorted);
        }
    }

    /// Current rule list snapshot (already sorted).
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<Rule>> {
        self.rules.read().map(|guard| Arc::clone(&guard)).unwrap_or_default()
    }

    /// Evaluate a request: the highest-priority enabled rule whose any-of
    /// list is satisfied wins; otherwise the default action applies.
    #[must_use]
    pub fn match_request(&self, request: &RouteRequest<'_>) -> MatchResult {
        let rules = self.snapshot();
        for rule in rules.iter() {
            if !rule.enabled {
                continue;
            }
            if rule.matches.iter().any(|m| self.match_one(m, request)) {
                return MatchResult { action: rule.action, rule_id: Some(rule.id.clone()) };
            }
        }
        MatchResult { action: self.default_action, rule_id: None }
    }

    fn match_one(&self, condition: &RuleMatch, request: &RouteRequest<'_>) -> bool {
        match condition {
            RuleMatch::DomainExact(value) => {
                request.domain.is_some_and(|d| d.eq_ignore_ascii_case(value))
            },
            RuleMatch::DomainSuffix(value) => request.domain.is_some_and(|d| {
                let d = d.to_ascii_lowercase();
                let value = value.to_ascii_lowercase();
                d == value || d.ends_with(&format!(".{value}"))
            }),
            RuleMatch::DomainKeyword(value) => request
                .domain
                .is_some_and(|d| d.to_ascii_lowercase().contains(&value.to_ascii_lowercase())),
            RuleMatch::IpCidr(block) => request.ip.is_some_and(|ip| block.contains(ip)),
            RuleMatch::GeoIp(region) => match (&self.geo, request.ip) {
                (Some(geo), Some(ip)) => geo.ip_in_region(ip, region),
                _ => false,
            },
            RuleMatch::GeoSite(set) => match (&self.geo, request.domain) {
                (Some(geo), Some(domain)) => geo.domain_in_set(domain, set),
                _ => false,
            },
            RuleMatch::Port(port) => request.port == *port,
        }
    }
}

/// An IPv4 or IPv6 CIDR block, e.g. `10.0.0.0/8` or `fd00::/8`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CidrBlock {
    addr: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    /// Parse from `addr/prefix` notation.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem when the address does not
    /// parse or the prefix exceeds the address width.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (addr_str, prefix_str) =
            s.split_once('/').ok_or_else(|| format!("missing '/' in CIDR '{s}'"))?;
        let addr: IpAddr =
            addr_str.parse().map_err(|e| format!("bad address in CIDR '{s}': {e}"))?;
        let prefix: u8 =
            prefix_str.parse().map_err(|e| format!("bad prefix in CIDR '{s}': {e}"))?;

        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix > max {
            return Err(format!("prefix /{prefix} too long for '{s}'"));
        }

        Ok(Self { addr, prefix })
    }

    /// Whether `ip` falls inside this block. Mixed-family comparisons are
    /// always false.
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let bits = u32::from(self.prefix);
                if bits == 0 {
                    return true;
                }
                let mask = u32::MAX << (32 - bits);
                (u32::from(net) & mask) == (u32::from(ip) & mask)
            },
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let bits = u32::from(self.prefix);
                if bits == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - bits);
                (u128::from(net) & mask) == (u128::from(ip) & mask)
            },
            _ => false,
        }
    }
}

impl TryFrom<String> for CidrBlock {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CidrBlock> for String {
    fn from(block: CidrBlock) -> Self {
        format!("{}/{}", block.addr, block.prefix)
    }
}

/// Built-in ad/telemetry block list injected by the `block_ads` config
/// flag. Deliberately small; deployments ship their own lists as user
/// rules.
#[must_use]
pub fn block_ads_rules() -> Vec<Rule> {
    let keywords = ["adservice", "adserver", "doubleclick", "telemetry-ads", "analytics-ads"];
    let suffixes = ["ads.example", "adnxs.com", "googlesyndication.com"];

    let mut matches: Vec<RuleMatch> =
        keywords.iter().map(|k| RuleMatch::DomainKeyword((*k).to_string())).collect();
    matches.extend(suffixes.iter().map(|s| RuleMatch::DomainSuffix((*s).to_string())));

    vec![Rule {
        id: "builtin.block_ads".to_string(),
        name: "Block ad and telemetry hosts".to_string(),
        priority: 900,
        enabled: true,
        action: RuleAction::Block,
        matches,
    }]
}

/// Built-in mainland-bypass list injected by the `bypass_cn` config flag:
/// .cn traffic goes direct instead of through the tunnel.
#[must_use]
pub fn bypass_cn_rules() -> Vec<Rule> {
    vec![Rule {
        id: "builtin.bypass_cn".to_string(),
        name: "Dial mainland destinations directly".to_string(),
        priority: 800,
        enabled: true,
        action: RuleAction::Direct,
        matches: vec![
            RuleMatch::DomainSuffix("cn".to_string()),
            RuleMatch::GeoIp("CN".to_string()),
            RuleMatch::GeoSite("cn".to_string()),
        ],
    }]
}
