use crate::blacklist::{CidrTrie, DnsBlacklist};
use crate::extractor::{RequestContext, RequestExtractor};
use crate::geoip::{CountryDecision, CountryFilter};
use crate::logworker::{EventLevel, LogHandle, SecurityEvent};
use crate::metrics::WafMetrics;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::recorder::ResponseRecorder;
use crate::rules::{CompiledRule, RuleAction, RuleStore};
use arc_swap::ArcSwap;
use http::StatusCode;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info};

/// Why a request was terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    CountryBlock,
    RateLimit,
    IpBlacklist,
    DnsBlacklist,
    AnomalyThreshold,
    RuleBlock,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::CountryBlock => "country_block",
            BlockReason::RateLimit => "rate_limit",
            BlockReason::IpBlacklist => "ip_blacklist",
            BlockReason::DnsBlacklist => "dns_blacklist",
            BlockReason::AnomalyThreshold => "anomaly_threshold",
            BlockReason::RuleBlock => "rule_block",
        }
    }
}

/// Per-request evaluation state. Owned by one request, never shared.
#[derive(Debug)]
pub struct WafState {
    pub request_id: String,
    pub total_score: u64,
    pub blocked: bool,
    pub status_code: StatusCode,
    pub response_written: bool,
    pub block_reason: Option<BlockReason>,
    /// Rule that triggered the block, when one did
    pub blocking_rule: Option<String>,
}

impl WafState {
    pub fn new(request_id: String) -> Self {
        Self {
            request_id,
            total_score: 0,
            blocked: false,
            status_code: StatusCode::OK,
            response_written: false,
            block_reason: None,
            blocking_rule: None,
        }
    }

    fn block(&mut self, status: StatusCode, reason: BlockReason) {
        // Blocked is sticky; the first decision wins
        if self.blocked {
            return;
        }
        self.blocked = true;
        self.response_written = true;
        self.status_code = status;
        self.block_reason = Some(reason);
    }
}

/// Drives phases 1-4 for each request against atomically swappable
/// snapshots of the rule store and blacklists.
pub struct PhaseEngine {
    anomaly_threshold: u64,
    rule_store: ArcSwap<RuleStore>,
    ip_blacklist: ArcSwap<CidrTrie>,
    dns_blacklist: ArcSwap<DnsBlacklist>,
    rate_limiter: Arc<RateLimiter>,
    country_filter: Option<CountryFilter>,
    extractor: RequestExtractor,
    metrics: Arc<WafMetrics>,
    log: LogHandle,
}

impl PhaseEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        anomaly_threshold: u64,
        rule_store: RuleStore,
        ip_blacklist: CidrTrie,
        dns_blacklist: DnsBlacklist,
        rate_limiter: Arc<RateLimiter>,
        country_filter: Option<CountryFilter>,
        extractor: RequestExtractor,
        metrics: Arc<WafMetrics>,
        log: LogHandle,
    ) -> Self {
        Self {
            anomaly_threshold,
            rule_store: ArcSwap::from_pointee(rule_store),
            ip_blacklist: ArcSwap::from_pointee(ip_blacklist),
            dns_blacklist: ArcSwap::from_pointee(dns_blacklist),
            rate_limiter,
            country_filter,
            extractor,
            metrics,
            log,
        }
    }

    pub fn metrics(&self) -> &Arc<WafMetrics> {
        &self.metrics
    }

    pub fn extractor(&self) -> &RequestExtractor {
        &self.extractor
    }

    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    /// Publish a freshly loaded rule store. In-flight phases keep the
    /// snapshot they started with.
    pub fn swap_rules(&self, store: RuleStore) {
        self.rule_store.store(Arc::new(store));
    }

    pub fn swap_ip_blacklist(&self, trie: CidrTrie) {
        self.ip_blacklist.store(Arc::new(trie));
    }

    pub fn swap_dns_blacklist(&self, list: DnsBlacklist) {
        self.dns_blacklist.store(Arc::new(list));
    }

    pub fn rule_count(&self) -> usize {
        self.rule_store.load().len()
    }

    /// Run one phase. Does nothing once the request is blocked.
    pub fn run_phase(
        &self,
        phase: u8,
        ctx: &RequestContext,
        recorder: Option<&ResponseRecorder>,
        state: &mut WafState,
    ) {
        if state.blocked || state.response_written {
            return;
        }

        if phase == 1 {
            self.phase_one_preamble(ctx, state);
            if state.blocked {
                return;
            }
        }

        self.evaluate_rules(phase, ctx, recorder, state);
    }

    /// Built-in checks, in order: country filter, rate limiter, IP
    /// blacklist, DNS blacklist. Any hit terminates the request.
    fn phase_one_preamble(&self, ctx: &RequestContext, state: &mut WafState) {
        if let Some(filter) = &self.country_filter {
            let (decision, country) = filter.check(ctx.remote_ip);
            self.metrics.record_country(&country);
            match decision {
                CountryDecision::Blocked => {
                    counter!("waf_blocked_country", 1);
                    state.block(StatusCode::FORBIDDEN, BlockReason::CountryBlock);
                    self.log_builtin_block(ctx, state, Some(country));
                    return;
                }
                CountryDecision::Allowed | CountryDecision::Skipped => {}
            }
        }

        if self.rate_limiter.check(ctx.remote_ip, ctx.path()) == RateDecision::Limited {
            counter!("waf_blocked_rate_limit", 1);
            state.block(StatusCode::TOO_MANY_REQUESTS, BlockReason::RateLimit);
            self.log_builtin_block(ctx, state, None);
            return;
        }

        if self.ip_blacklist.load().contains(ctx.remote_ip) {
            counter!("waf_blocked_ip_blacklist", 1);
            state.block(StatusCode::FORBIDDEN, BlockReason::IpBlacklist);
            self.log_builtin_block(ctx, state, None);
            return;
        }

        let host = ctx.host();
        if !host.is_empty() && self.dns_blacklist.load().contains(host) {
            counter!("waf_blocked_dns_blacklist", 1);
            state.block(StatusCode::FORBIDDEN, BlockReason::DnsBlacklist);
            self.log_builtin_block(ctx, state, None);
        }
    }

    fn evaluate_rules(
        &self,
        phase: u8,
        ctx: &RequestContext,
        recorder: Option<&ResponseRecorder>,
        state: &mut WafState,
    ) {
        // The snapshot loaded here serves the entire phase; a reload that
        // lands mid-phase is only visible to later requests.
        let store = self.rule_store.load_full();

        'rules: for rule in store.rules_for_phase(phase) {
            for target in &rule.targets {
                let value = match self.extractor.extract(target, ctx, recorder, phase) {
                    Ok(value) => value,
                    Err(e) => {
                        debug!(
                            request_id = %state.request_id,
                            rule_id = %rule.id,
                            target = %target,
                            error = %e,
                            "Skipping target"
                        );
                        continue;
                    }
                };

                if rule.regex.is_match(&value) {
                    self.process_rule_match(rule, target, &value, ctx, state);
                    if state.blocked || state.response_written {
                        break 'rules;
                    }
                }
            }
        }
    }

    /// One successful regex match of one rule against one target.
    fn process_rule_match(
        &self,
        rule: &CompiledRule,
        target: &str,
        value: &str,
        ctx: &RequestContext,
        state: &mut WafState,
    ) {
        self.metrics.record_rule_hit(&rule.id, rule.phase);
        counter!("waf_rule_hits", 1);

        let old_score = state.total_score;
        state.total_score += rule.score;
        debug!(
            request_id = %state.request_id,
            rule_id = %rule.id,
            score_increase = rule.score,
            old_total_score = old_score,
            new_total_score = state.total_score,
            anomaly_threshold = self.anomaly_threshold,
            "Increased anomaly score"
        );

        let reason = if state.total_score >= self.anomaly_threshold {
            Some(BlockReason::AnomalyThreshold)
        } else if rule.action == RuleAction::Block {
            Some(BlockReason::RuleBlock)
        } else {
            None
        };

        if let Some(reason) = reason {
            if !state.response_written {
                state.block(StatusCode::FORBIDDEN, reason);
                state.blocking_rule = Some(rule.id.clone());
                self.log_rule_match(EventLevel::Warn, "Request blocked by rule", rule, target, value, ctx, state);
                return;
            }
        }

        match rule.action {
            RuleAction::Log => {
                info!(
                    request_id = %state.request_id,
                    rule_id = %rule.id,
                    "Rule action is 'log', request allowed but logged"
                );
                self.log_rule_match(EventLevel::Info, "Rule matched", rule, target, value, ctx, state);
            }
            _ => {
                self.log_rule_match(EventLevel::Debug, "Rule matched, no blocking action taken", rule, target, value, ctx, state);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn log_rule_match(
        &self,
        level: EventLevel,
        message: &str,
        rule: &CompiledRule,
        target: &str,
        value: &str,
        ctx: &RequestContext,
        state: &WafState,
    ) {
        let mut event = SecurityEvent::new(level, &state.request_id, message);
        event.client_ip = Some(ctx.remote_ip.to_string());
        event.method = Some(ctx.method.to_string());
        event.uri = Some(ctx.uri.to_string());
        event.rule_id = Some(rule.id.clone());
        event.target = Some(target.to_string());
        event.matched_value = Some(self.extractor.loggable(target, value).to_string());
        event.score = Some(rule.score);
        event.total_score = Some(state.total_score);
        event.reason = state.block_reason.map(|r| r.as_str().to_string());
        event.status_code = state.blocked.then(|| state.status_code.as_u16());
        self.log.emit(event);
    }

    fn log_builtin_block(&self, ctx: &RequestContext, state: &WafState, country: Option<String>) {
        let mut event = SecurityEvent::new(EventLevel::Warn, &state.request_id, "Request blocked");
        event.client_ip = Some(ctx.remote_ip.to_string());
        event.method = Some(ctx.method.to_string());
        event.uri = Some(ctx.uri.to_string());
        event.reason = state.block_reason.map(|r| r.as_str().to_string());
        event.status_code = Some(state.status_code.as_u16());
        event.matched_value = country;
        self.log.emit(event);
    }
}
