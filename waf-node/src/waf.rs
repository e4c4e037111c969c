use crate::blacklist::{CidrTrie, DnsBlacklist};
use crate::config::{CustomResponseConfig, WafNodeConfig};
use crate::engine::PhaseEngine;
use crate::error::{Result, WafError};
use crate::extractor::RequestExtractor;
use crate::geoip::CountryFilter;
use crate::logworker::spawn_log_worker;
use crate::metrics::{MetricsSnapshot, WafMetrics};
use crate::ratelimit::RateLimiter;
use crate::rules::{load_rules, RegexCache};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Status-keyed replacement for the default block page
#[derive(Debug, Clone)]
pub struct CustomResponse {
    pub content_type: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// The firewall: engine, reloadable stores, custom responses, and the
/// shutdown signal for every background worker.
pub struct Waf {
    engine: PhaseEngine,
    cache: RegexCache,
    rule_files: Vec<String>,
    ip_blacklist_file: Option<String>,
    dns_blacklist_file: Option<String>,
    custom_responses: HashMap<u16, CustomResponse>,
    metrics_endpoint: Option<String>,
    shutdown: watch::Sender<bool>,
    log_worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Waf {
    /// Build the firewall from a validated configuration and start its
    /// background workers.
    pub async fn new(config: WafNodeConfig) -> Result<Arc<Self>> {
        config.validate().map_err(WafError::Config)?;

        let cache = RegexCache::new();
        let (store, summary) = load_rules(&config.waf.rule_files, &cache)?;
        info!(
            rules = summary.total_rules,
            invalid_files = summary.invalid_files.len(),
            invalid_rules = summary.invalid_rules.len(),
            "Rule corpus loaded"
        );

        let ip_blacklist = match &config.waf.ip_blacklist_file {
            Some(path) => CidrTrie::from_file(path)?,
            None => CidrTrie::new(),
        };
        let dns_blacklist = match &config.waf.dns_blacklist_file {
            Some(path) => DnsBlacklist::from_file(path)?,
            None => DnsBlacklist::new(),
        };

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone())?);
        let country_filter = CountryFilter::from_config(&config.country_filter)?;
        let metrics = Arc::new(WafMetrics::new());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (log, log_worker) = spawn_log_worker(&config.logging, shutdown_rx.clone()).await?;
        Arc::clone(&rate_limiter).start_cleanup_task(shutdown_rx);

        let engine = PhaseEngine::new(
            config.waf.anomaly_threshold as u64,
            store,
            ip_blacklist,
            dns_blacklist,
            rate_limiter,
            country_filter,
            RequestExtractor::new(config.waf.redact_sensitive_data),
            metrics,
            log,
        );

        let custom_responses = build_custom_responses(&config.custom_responses)?;

        info!(
            anomaly_threshold = config.waf.anomaly_threshold,
            metrics_endpoint = config.waf.metrics_endpoint.as_deref().unwrap_or(""),
            "WAF initialized"
        );

        Ok(Arc::new(Self {
            engine,
            cache,
            rule_files: config.waf.rule_files.clone(),
            ip_blacklist_file: config.waf.ip_blacklist_file.clone(),
            dns_blacklist_file: config.waf.dns_blacklist_file.clone(),
            custom_responses,
            metrics_endpoint: config.waf.metrics_endpoint.clone(),
            shutdown,
            log_worker: std::sync::Mutex::new(Some(log_worker)),
        }))
    }

    pub fn engine(&self) -> &PhaseEngine {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<WafMetrics> {
        self.engine.metrics()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.engine.metrics().snapshot()
    }

    pub fn metrics_endpoint(&self) -> Option<&str> {
        self.metrics_endpoint.as_deref()
    }

    pub fn custom_response(&self, status: u16) -> Option<&CustomResponse> {
        self.custom_responses.get(&status)
    }

    /// Every file the reload watcher should observe
    pub fn watched_files(&self) -> Vec<String> {
        let mut files = self.rule_files.clone();
        files.extend(self.ip_blacklist_file.iter().cloned());
        files.extend(self.dns_blacklist_file.iter().cloned());
        files
    }

    /// Re-parse every rule file and blacklist file and atomically publish
    /// the results. A failed load keeps the previous snapshot.
    pub fn reload(&self) -> Result<()> {
        match load_rules(&self.rule_files, &self.cache) {
            Ok((store, summary)) => {
                info!(rules = summary.total_rules, "Rule corpus reloaded");
                self.engine.swap_rules(store);
            }
            Err(e) => {
                warn!(error = %e, "Rule reload failed, keeping previous rules");
                return Err(e);
            }
        }

        if let Some(path) = &self.ip_blacklist_file {
            match CidrTrie::from_file(path) {
                Ok(trie) => self.engine.swap_ip_blacklist(trie),
                Err(e) => warn!(file = %path, error = %e, "IP blacklist reload failed"),
            }
        }
        if let Some(path) = &self.dns_blacklist_file {
            match DnsBlacklist::from_file(path) {
                Ok(list) => self.engine.swap_dns_blacklist(list),
                Err(e) => warn!(file = %path, error = %e, "DNS blacklist reload failed"),
            }
        }

        Ok(())
    }

    /// Subscribe to the shutdown signal (for background workers).
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal every background worker and wait for the log queue to drain.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let worker = match self.log_worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Log worker terminated abnormally");
            }
        }
        info!("WAF shut down");
    }
}

fn build_custom_responses(
    configs: &[CustomResponseConfig],
) -> Result<HashMap<u16, CustomResponse>> {
    let mut responses = HashMap::new();
    for config in configs {
        let body = match &config.body_file {
            Some(path) => Bytes::from(std::fs::read(path).map_err(|e| {
                WafError::Config(format!("could not read custom response file '{path}': {e}"))
            })?),
            None => Bytes::from(config.body.clone().unwrap_or_default()),
        };
        responses.insert(
            config.status,
            CustomResponse {
                content_type: config.content_type.clone(),
                headers: config
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                body,
            },
        );
    }
    Ok(responses)
}
