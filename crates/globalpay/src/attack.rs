//! Inbound request screening.
//!
//! Every request passes through [`AttackDetector::screen`] before any business
//! logic runs. The detector folds over a fixed pipeline of checks and stops at
//! the first denial:
//!
//! 1. block list
//! 2. per-IP rate limit (path-prefix rules, escalation to a permanent block)
//! 3. user-agent signatures (malicious tools, generic automation)
//! 4. geo deny list
//! 5. attack signatures (SQL injection, XSS, path traversal, brute force)
//!
//! State lives in DashMaps keyed by IP, so concurrent requests from different
//! sources never contend on a shared lock.

use dashmap::{DashMap, DashSet};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::ConfigError;
use crate::window::RateLimitStore;

/// Per-IP limit applied to paths starting with any of `prefixes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRule {
    pub name: String,
    pub prefixes: Vec<String>,
    pub limit: u64,
    pub window_secs: u64,
}

/// Score added to an IP's rolling threat score per matched category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureWeights {
    pub sql_injection: u32,
    pub xss: u32,
    pub path_traversal: u32,
    pub brute_force: u32,
}

/// Detector tuning. Loaded once from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorPolicy {
    /// Checked in order; the first rule with a matching prefix applies.
    pub rate_rules: Vec<RateRule>,
    pub general_limit: u64,
    pub general_window_secs: u64,
    /// An IP whose window count exceeds `limit * escalation_multiplier` is
    /// blocked permanently.
    pub escalation_multiplier: u64,
    pub malicious_agents: Vec<String>,
    pub automation_agents: Vec<String>,
    /// Automation hits tolerated per observation window before blocking.
    pub suspicion_threshold: u32,
    pub observation_window_secs: i64,
    pub geo_deny_list: Vec<String>,
    pub sql_injection_patterns: Vec<String>,
    pub xss_patterns: Vec<String>,
    pub path_traversal_patterns: Vec<String>,
    pub weights: SignatureWeights,
    /// Aggregate score at which a request is logged as suspicious.
    pub medium_threshold: u32,
    /// Aggregate score at which requests are rejected.
    pub high_threshold: u32,
    pub auth_prefixes: Vec<String>,
    /// Authentication requests tolerated per brute-force window.
    pub brute_force_limit: usize,
    pub brute_force_window_secs: i64,
    /// Suspicion and score entries idle for longer than this are dropped.
    pub inactivity_ttl_secs: i64,
}

impl Default for DetectorPolicy {
    fn default() -> Self {
        let s = |v: &[&str]| v.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        Self {
            rate_rules: vec![
                RateRule {
                    name: "auth".into(),
                    prefixes: s(&["/auth", "/login", "/api/auth"]),
                    limit: 10,
                    window_secs: 60,
                },
                RateRule {
                    name: "admin".into(),
                    prefixes: s(&["/admin"]),
                    limit: 60,
                    window_secs: 60,
                },
                RateRule {
                    name: "api".into(),
                    prefixes: s(&["/api/", "/payments"]),
                    limit: 300,
                    window_secs: 60,
                },
            ],
            general_limit: 100,
            general_window_secs: 60,
            escalation_multiplier: 2,
            malicious_agents: s(&[
                r"(?i)sqlmap",
                r"(?i)nikto",
                r"(?i)\bnmap\b",
                r"(?i)masscan",
                r"(?i)zgrab",
                r"(?i)acunetix",
                r"(?i)nessus",
                r"(?i)dirbuster",
                r"(?i)gobuster",
                r"(?i)wpscan",
                r"(?i)havij",
                r"(?i)\bhydra\b",
                r"(?i)metasploit",
            ]),
            automation_agents: s(&[
                r"(?i)^curl/",
                r"(?i)^wget/",
                r"(?i)python-(requests|urllib)",
                r"(?i)go-http-client",
                r"(?i)libwww-perl",
                r"(?i)scrapy",
                r"(?i)headless",
                r"(?i)phantomjs",
                r"(?i)selenium",
                r"(?i)\b(bot|crawler|spider)\b",
            ]),
            suspicion_threshold: 10,
            observation_window_secs: 3_600,
            geo_deny_list: Vec::new(),
            sql_injection_patterns: s(&[
                r"(?i)\bunion\b[\s\S]*\bselect\b",
                r"(?i)'\s*or\s+'?\d+'?\s*=\s*'?\d+",
                r"(?i)\b(insert\s+into|delete\s+from|drop\s+table|truncate\s+table)\b",
                r"(?i);\s*(drop|shutdown|exec)\b",
                r"(?i)\b(sleep|benchmark|pg_sleep)\s*\(",
                r"(?i)\bwaitfor\s+delay\b",
            ]),
            xss_patterns: s(&[
                r"(?i)<\s*script\b",
                r"(?i)javascript\s*:",
                r"(?i)\bon(error|load|click|mouseover|focus)\s*=",
                r"(?i)<\s*(iframe|object|embed|svg)\b",
                r"(?i)document\.(cookie|location)",
                r"(?i)\beval\s*\(",
            ]),
            path_traversal_patterns: s(&[
                r"\.\./",
                r"\.\.\\",
                r"(?i)%2e%2e",
                r"(?i)/etc/(passwd|shadow|hosts)",
                r"(?i)\b(boot|win)\.ini\b",
                r"\x00",
            ]),
            weights: SignatureWeights {
                sql_injection: 5,
                xss: 4,
                path_traversal: 4,
                brute_force: 6,
            },
            medium_threshold: 4,
            high_threshold: 8,
            auth_prefixes: s(&["/auth", "/login", "/api/auth"]),
            brute_force_limit: 20,
            brute_force_window_secs: 300,
            inactivity_ttl_secs: 3_600,
        }
    }
}

/// The parts of a request the detector inspects.
#[derive(Debug, Clone)]
pub struct InboundRequest<'a> {
    pub ip: IpAddr,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    /// Two-letter country code reported by the trusted edge, or the
    /// resolved region's country when the edge sent none.
    pub country: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Blocked,
    RateLimited,
    MaliciousTool,
    SuspiciousAutomation,
    GeoBlocked,
    AttackSignature,
}

impl DenyReason {
    const ALL: [DenyReason; 6] = [
        DenyReason::Blocked,
        DenyReason::RateLimited,
        DenyReason::MaliciousTool,
        DenyReason::SuspiciousAutomation,
        DenyReason::GeoBlocked,
        DenyReason::AttackSignature,
    ];

    /// Machine-readable code returned to callers.
    pub fn code(&self) -> &'static str {
        match self {
            DenyReason::Blocked => "IP_BLOCKED",
            DenyReason::RateLimited => "RATE_LIMITED",
            DenyReason::MaliciousTool => "MALICIOUS_CLIENT",
            DenyReason::SuspiciousAutomation => "AUTOMATION_BLOCKED",
            DenyReason::GeoBlocked => "GEO_BLOCKED",
            DenyReason::AttackSignature => "ATTACK_DETECTED",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub reason: DenyReason,
    /// Seconds until the caller may retry; only set for rate limiting.
    pub retry_after: Option<u64>,
}

impl Denial {
    fn new(reason: DenyReason) -> Self {
        Self {
            reason,
            retry_after: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(Denial),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    SqlInjection,
    Xss,
    PathTraversal,
    BruteForce,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockEntry {
    pub reason: DenyReason,
    pub detail: String,
    pub blocked_at: i64,
}

#[derive(Debug, Clone, Copy)]
struct Suspicion {
    count: u32,
    first_seen: i64,
    last_seen: i64,
}

#[derive(Debug, Clone, Copy)]
struct ThreatScore {
    score: u32,
    last_seen: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorStats {
    pub screened: u64,
    pub allowed: u64,
    pub denied: HashMap<&'static str, u64>,
    pub blocked_ips: usize,
    pub allowed_ips: usize,
    pub suspicious_ips: usize,
    pub scored_ips: usize,
}

enum Step {
    Continue,
    Deny(Denial),
}

type Check = fn(&AttackDetector, &InboundRequest<'_>, i64) -> Step;

pub struct AttackDetector {
    policy: DetectorPolicy,
    windows: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    malicious: RegexSet,
    automation: RegexSet,
    sql_injection: RegexSet,
    xss: RegexSet,
    path_traversal: RegexSet,
    geo_deny: Vec<String>,
    blocked: DashMap<IpAddr, BlockEntry>,
    allowed: DashSet<IpAddr>,
    suspicion: DashMap<IpAddr, Suspicion>,
    scores: DashMap<IpAddr, ThreatScore>,
    auth_attempts: DashMap<IpAddr, VecDeque<i64>>,
    screened: AtomicU64,
    passed: AtomicU64,
    denied: [AtomicU64; 6],
}

impl std::fmt::Debug for AttackDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttackDetector")
            .field("blocked", &self.blocked.len())
            .field("allowed", &self.allowed.len())
            .field("suspicion", &self.suspicion.len())
            .field("scores", &self.scores.len())
            .finish()
    }
}

fn compile(patterns: &[String]) -> Result<RegexSet, ConfigError> {
    RegexSet::new(patterns).map_err(|e| ConfigError::InvalidPattern {
        pattern: patterns.join(" | "),
        message: e.to_string(),
    })
}

impl AttackDetector {
    const PIPELINE: [(&'static str, Check); 5] = [
        ("block", AttackDetector::check_blocked),
        ("rate_limit", AttackDetector::check_rate_limit),
        ("user_agent", AttackDetector::check_user_agent),
        ("geo", AttackDetector::check_geo),
        ("signatures", AttackDetector::check_signatures),
    ];

    pub fn new(
        policy: DetectorPolicy,
        windows: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if policy.escalation_multiplier < 2 {
            return Err(ConfigError::Invalid(
                "escalation multiplier must be at least 2".to_string(),
            ));
        }
        if policy.high_threshold < policy.medium_threshold {
            return Err(ConfigError::Invalid(
                "high threat threshold must not be below the medium threshold".to_string(),
            ));
        }

        Ok(Self {
            malicious: compile(&policy.malicious_agents)?,
            automation: compile(&policy.automation_agents)?,
            sql_injection: compile(&policy.sql_injection_patterns)?,
            xss: compile(&policy.xss_patterns)?,
            path_traversal: compile(&policy.path_traversal_patterns)?,
            geo_deny: policy
                .geo_deny_list
                .iter()
                .map(|c| c.trim().to_ascii_uppercase())
                .collect(),
            policy,
            windows,
            clock,
            blocked: DashMap::new(),
            allowed: DashSet::new(),
            suspicion: DashMap::new(),
            scores: DashMap::new(),
            auth_attempts: DashMap::new(),
            screened: AtomicU64::new(0),
            passed: AtomicU64::new(0),
            denied: Default::default(),
        })
    }

    pub fn policy(&self) -> &DetectorPolicy {
        &self.policy
    }

    /// Screen one request. Short-circuits on the first failing check.
    pub fn screen(&self, req: &InboundRequest<'_>) -> Verdict {
        self.screened.fetch_add(1, Ordering::Relaxed);

        if self.allowed.contains(&req.ip) {
            self.passed.fetch_add(1, Ordering::Relaxed);
            return Verdict::Allow;
        }

        let now = self.clock.now();
        for (name, check) in Self::PIPELINE {
            if let Step::Deny(denial) = check(self, req, now) {
                self.denied[denial.reason.index()].fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    ip = %req.ip,
                    check = name,
                    code = denial.reason.code(),
                    path = %req.path,
                    "request denied"
                );
                return Verdict::Deny(denial);
            }
        }

        self.passed.fetch_add(1, Ordering::Relaxed);
        Verdict::Allow
    }

    fn check_blocked(&self, req: &InboundRequest<'_>, _now: i64) -> Step {
        if self.blocked.contains_key(&req.ip) {
            Step::Deny(Denial::new(DenyReason::Blocked))
        } else {
            Step::Continue
        }
    }

    fn check_rate_limit(&self, req: &InboundRequest<'_>, now: i64) -> Step {
        let (rule, limit, window_secs) = self.rule_for(req.path);
        let key = format!("ip:{}:{}", req.ip, rule);
        let hit = self.windows.hit(&key, window_secs, now);

        let escalation = limit.saturating_mul(self.policy.escalation_multiplier);
        if hit.count > escalation {
            self.block_ip(
                req.ip,
                DenyReason::RateLimited,
                format!("exceeded {escalation} requests in a {window_secs}s window ({rule})"),
            );
            return Step::Deny(Denial::new(DenyReason::Blocked));
        }

        if hit.count > limit {
            return Step::Deny(Denial {
                reason: DenyReason::RateLimited,
                retry_after: Some((hit.reset_at - now).max(1) as u64),
            });
        }

        Step::Continue
    }

    fn check_user_agent(&self, req: &InboundRequest<'_>, now: i64) -> Step {
        let agent = match req.user_agent {
            Some(a) if !a.trim().is_empty() => a,
            _ => return Step::Continue,
        };

        if self.malicious.is_match(agent) {
            self.block_ip(
                req.ip,
                DenyReason::MaliciousTool,
                format!("malicious tool signature in user agent {agent:?}"),
            );
            return Step::Deny(Denial::new(DenyReason::MaliciousTool));
        }

        if !self.automation.is_match(agent) {
            return Step::Continue;
        }

        let window = self.policy.observation_window_secs;
        let count = {
            let mut entry = self.suspicion.entry(req.ip).or_insert(Suspicion {
                count: 0,
                first_seen: now,
                last_seen: now,
            });
            if now - entry.first_seen >= window {
                *entry = Suspicion {
                    count: 0,
                    first_seen: now,
                    last_seen: now,
                };
            }
            entry.count += 1;
            entry.last_seen = now;
            entry.count
        };

        if count > self.policy.suspicion_threshold {
            self.block_ip(
                req.ip,
                DenyReason::SuspiciousAutomation,
                format!("{count} automated requests within {window}s"),
            );
            return Step::Deny(Denial::new(DenyReason::SuspiciousAutomation));
        }

        Step::Continue
    }

    fn check_geo(&self, req: &InboundRequest<'_>, _now: i64) -> Step {
        if self
            .geo_deny
            .iter()
            .any(|c| c.eq_ignore_ascii_case(req.country))
        {
            Step::Deny(Denial::new(DenyReason::GeoBlocked))
        } else {
            Step::Continue
        }
    }

    fn check_signatures(&self, req: &InboundRequest<'_>, now: i64) -> Step {
        let mut categories = self.match_signatures(req.path, req.query);
        if self.is_auth_path(req.path) && self.record_auth_attempt(req.ip, now) {
            categories.push(ThreatCategory::BruteForce);
        }
        if categories.is_empty() {
            return Step::Continue;
        }

        let added: u32 = categories.iter().map(|c| self.weight(*c)).sum();
        let score = {
            let mut entry = self.scores.entry(req.ip).or_insert(ThreatScore {
                score: 0,
                last_seen: now,
            });
            entry.score = entry.score.saturating_add(added);
            entry.last_seen = now;
            entry.score
        };

        if score >= self.policy.high_threshold {
            tracing::warn!(
                ip = %req.ip,
                score,
                categories = ?categories,
                path = %req.path,
                "high threat score, rejecting request"
            );
            return Step::Deny(Denial::new(DenyReason::AttackSignature));
        }

        if score >= self.policy.medium_threshold {
            tracing::warn!(
                ip = %req.ip,
                score,
                categories = ?categories,
                path = %req.path,
                "medium threat score"
            );
        }

        Step::Continue
    }

    /// Categories whose signatures appear in the decoded request target.
    pub fn match_signatures(&self, path: &str, query: Option<&str>) -> Vec<ThreatCategory> {
        let raw = match query {
            Some(q) if !q.is_empty() => format!("{path}?{q}"),
            _ => path.to_string(),
        };
        let decoded = decode_target(&raw);

        let mut categories = Vec::new();
        let matches = |set: &RegexSet| set.is_match(&raw) || set.is_match(&decoded);
        if matches(&self.sql_injection) {
            categories.push(ThreatCategory::SqlInjection);
        }
        if matches(&self.xss) {
            categories.push(ThreatCategory::Xss);
        }
        if matches(&self.path_traversal) {
            categories.push(ThreatCategory::PathTraversal);
        }
        categories
    }

    fn weight(&self, category: ThreatCategory) -> u32 {
        let w = &self.policy.weights;
        match category {
            ThreatCategory::SqlInjection => w.sql_injection,
            ThreatCategory::Xss => w.xss,
            ThreatCategory::PathTraversal => w.path_traversal,
            ThreatCategory::BruteForce => w.brute_force,
        }
    }

    fn is_auth_path(&self, path: &str) -> bool {
        self.policy
            .auth_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }

    /// Record an authentication request; true when the brute-force limit is exceeded.
    fn record_auth_attempt(&self, ip: IpAddr, now: i64) -> bool {
        let cutoff = now - self.policy.brute_force_window_secs;
        let mut attempts = self.auth_attempts.entry(ip).or_default();
        while attempts.front().is_some_and(|t| *t <= cutoff) {
            attempts.pop_front();
        }
        attempts.push_back(now);
        attempts.len() > self.policy.brute_force_limit
    }

    fn rule_for(&self, path: &str) -> (&str, u64, u64) {
        self.policy
            .rate_rules
            .iter()
            .find(|r| r.prefixes.iter().any(|p| path.starts_with(p.as_str())))
            .map(|r| (r.name.as_str(), r.limit, r.window_secs))
            .unwrap_or((
                "general",
                self.policy.general_limit,
                self.policy.general_window_secs,
            ))
    }

    /// Add an IP to the block set. Blocks persist until [`Self::unblock_ip`].
    pub fn block_ip(&self, ip: IpAddr, reason: DenyReason, detail: String) {
        if self.allowed.contains(&ip) {
            return;
        }
        tracing::warn!(ip = %ip, reason = reason.code(), detail = %detail, "blocking IP");
        self.blocked.insert(
            ip,
            BlockEntry {
                reason,
                detail,
                blocked_at: self.clock.now(),
            },
        );
    }

    pub fn unblock_ip(&self, ip: &IpAddr) -> bool {
        let removed = self.blocked.remove(ip).is_some();
        if removed {
            self.suspicion.remove(ip);
            self.scores.remove(ip);
            self.auth_attempts.remove(ip);
            tracing::info!(ip = %ip, "IP unblocked");
        }
        removed
    }

    /// Exempt an IP from screening and lift any block on it.
    pub fn allow_ip(&self, ip: IpAddr) {
        self.blocked.remove(&ip);
        self.allowed.insert(ip);
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.blocked.contains_key(ip)
    }

    pub fn blocked_ips(&self) -> Vec<(IpAddr, BlockEntry)> {
        let mut entries: Vec<_> = self
            .blocked
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(_, e)| e.blocked_at);
        entries
    }

    pub fn threat_score(&self, ip: &IpAddr) -> u32 {
        self.scores.get(ip).map(|s| s.score).unwrap_or(0)
    }

    /// Drop suspicion, score and brute-force history that has gone idle.
    /// Each map is swept shard by shard.
    pub fn purge_stale(&self, now: i64) -> usize {
        let ttl = self.policy.inactivity_ttl_secs;
        let auth_cutoff = now - self.policy.brute_force_window_secs;

        let before = self.suspicion.len() + self.scores.len() + self.auth_attempts.len();
        self.suspicion.retain(|_, s| now - s.last_seen < ttl);
        self.scores.retain(|_, s| now - s.last_seen < ttl);
        self.auth_attempts.retain(|_, attempts| {
            while attempts.front().is_some_and(|t| *t <= auth_cutoff) {
                attempts.pop_front();
            }
            !attempts.is_empty()
        });
        let after = self.suspicion.len() + self.scores.len() + self.auth_attempts.len();
        before.saturating_sub(after)
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            screened: self.screened.load(Ordering::Relaxed),
            allowed: self.passed.load(Ordering::Relaxed),
            denied: DenyReason::ALL
                .iter()
                .map(|r| (r.code(), self.denied[r.index()].load(Ordering::Relaxed)))
                .collect(),
            blocked_ips: self.blocked.len(),
            allowed_ips: self.allowed.len(),
            suspicious_ips: self.suspicion.len(),
            scored_ips: self.scores.len(),
        }
    }
}

/// Percent-decode a request target, treating `+` as a space.
fn decode_target(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes()))
            .into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::window::InMemoryRateLimitStore;

    const T0: i64 = 1_700_000_040; // aligned to a 60s bucket

    fn detector_with(policy: DetectorPolicy) -> (AttackDetector, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(T0));
        let detector = AttackDetector::new(
            policy,
            Arc::new(InMemoryRateLimitStore::new()),
            clock.clone(),
        )
        .unwrap();
        (detector, clock)
    }

    fn detector() -> (AttackDetector, Arc<ManualClock>) {
        detector_with(DetectorPolicy::default())
    }

    fn req<'a>(ip: &str, path: &'a str) -> InboundRequest<'a> {
        InboundRequest {
            ip: ip.parse().unwrap(),
            path,
            query: None,
            user_agent: Some("Mozilla/5.0"),
            country: "US",
        }
    }

    #[test]
    fn test_clean_request_allowed() {
        let (d, _) = detector();
        assert_eq!(d.screen(&req("8.8.8.8", "/pricing")), Verdict::Allow);
        assert_eq!(d.stats().allowed, 1);
    }

    #[test]
    fn test_exceeding_twice_the_limit_blocks_permanently() {
        let (d, clock) = detector();
        let ip = "7.7.7.7";
        let mut last = Verdict::Allow;
        for _ in 0..201 {
            last = d.screen(&req(ip, "/pricing"));
        }
        assert_eq!(last, Verdict::Deny(Denial::new(DenyReason::Blocked)));
        assert!(d.is_blocked(&ip.parse().unwrap()));

        // Still blocked long after the window
        clock.advance(7 * 24 * 3_600);
        assert_eq!(
            d.screen(&req(ip, "/pricing")),
            Verdict::Deny(Denial::new(DenyReason::Blocked))
        );
    }

    #[test]
    fn test_malicious_tool_blocks_immediately() {
        let (d, _) = detector();
        let mut r = req("6.6.6.6", "/");
        r.user_agent = Some("sqlmap/1.7.2#stable");
        assert_eq!(
            d.screen(&r),
            Verdict::Deny(Denial::new(DenyReason::MaliciousTool))
        );
        assert!(d.is_blocked(&"6.6.6.6".parse().unwrap()));
    }

    #[test]
    fn test_automation_blocked_after_threshold() {
        let (d, _) = detector();
        let mut r = req("4.4.4.4", "/pricing");
        r.user_agent = Some("curl/8.4.0");
        for _ in 0..10 {
            assert_eq!(d.screen(&r), Verdict::Allow);
        }
        assert_eq!(
            d.screen(&r),
            Verdict::Deny(Denial::new(DenyReason::SuspiciousAutomation))
        );
        assert!(d.is_blocked(&"4.4.4.4".parse().unwrap()));
    }

    #[test]
    fn test_geo_block() {
        let mut policy = DetectorPolicy::default();
        policy.geo_deny_list = vec!["kp".into()];
        let (d, _) = detector_with(policy);
        let mut r = req("3.3.3.3", "/");
        r.country = "KP";
        assert_eq!(
            d.screen(&r),
            Verdict::Deny(Denial::new(DenyReason::GeoBlocked))
        );
        assert!(!d.is_blocked(&"3.3.3.3".parse().unwrap()));
    }

    #[test]
    fn test_signature_detection_on_decoded_target() {
        let (d, _) = detector();
        assert_eq!(
            d.match_signatures("/search", Some("q=1%27%20OR%201%3D1")),
            vec![ThreatCategory::SqlInjection]
        );
        assert_eq!(
            d.match_signatures("/search", Some("q=%3Cscript%3Ealert(1)%3C/script%3E")),
            vec![ThreatCategory::Xss]
        );
        assert_eq!(
            d.match_signatures("/files/..%2F..%2Fetc/passwd", None),
            vec![ThreatCategory::PathTraversal]
        );
        assert!(d
            .match_signatures("/api/v1/usage", Some("period=month&page=2"))
            .is_empty());
    }

    #[test]
    fn test_score_escalates_from_logging_to_rejection() {
        let (d, _) = detector();
        let mut r = req("2.2.2.2", "/search");
        r.query = Some("q=1' or 1=1");
        // First hit reaches the medium threshold only: logged, allowed
        assert_eq!(d.screen(&r), Verdict::Allow);
        assert_eq!(d.threat_score(&"2.2.2.2".parse().unwrap()), 5);
        // Second hit crosses the high threshold
        assert_eq!(
            d.screen(&r),
            Verdict::Deny(Denial::new(DenyReason::AttackSignature))
        );
    }

    #[test]
    fn test_unblock_and_allow_list() {
        let (d, _) = detector();
        let ip: IpAddr = "10.1.1.1".parse().unwrap();
        d.block_ip(ip, DenyReason::MaliciousTool, "test".into());
        assert!(d.is_blocked(&ip));
        assert!(d.unblock_ip(&ip));
        assert!(!d.is_blocked(&ip));

        d.allow_ip(ip);
        let mut r = req("10.1.1.1", "/");
        r.user_agent = Some("nikto/2.5");
        assert_eq!(d.screen(&r), Verdict::Allow);
        assert!(!d.is_blocked(&ip));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let mut policy = DetectorPolicy::default();
        policy.escalation_multiplier = 1;
        assert!(AttackDetector::new(
            policy,
            Arc::new(InMemoryRateLimitStore::new()),
            Arc::new(ManualClock::new(0)),
        )
        .is_err());

        let mut policy = DetectorPolicy::default();
        policy.xss_patterns.push("(unclosed".into());
        assert!(AttackDetector::new(
            policy,
            Arc::new(InMemoryRateLimitStore::new()),
            Arc::new(ManualClock::new(0)),
        )
        .is_err());
    }
}
