use crate::config::RateLimitConfig;
use crate::error::{Result, WafError};
use dashmap::DashMap;
use metrics::counter;
use regex::Regex;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Admitted and counted against the window
    Allowed,
    /// Over the limit for the trailing window
    Limited,
    /// Path filtering is on and no configured path matched
    Bypassed,
}

#[derive(Debug)]
struct ClientWindow {
    /// Admission timestamps inside the trailing window
    hits: VecDeque<Instant>,
    /// Last activity of any kind, used by the reaper
    last_seen: Instant,
}

/// Per-client sliding-window rate limiter.
///
/// The key is the client IP; configured path regexes gate whether the
/// limiter applies at all, they never partition the counter. A background
/// reaper drops entries that have been idle for longer than the window.
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    requests: usize,
    window: Duration,
    cleanup_interval: Duration,
    match_all_paths: bool,
    path_regexes: Vec<Regex>,
    clients: DashMap<IpAddr, ClientWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        let mut path_regexes = Vec::with_capacity(config.paths.len());
        for path in &config.paths {
            let regex = Regex::new(path).map_err(|e| {
                WafError::Config(format!("invalid regex in rate limit paths: {e}"))
            })?;
            path_regexes.push(regex);
        }

        info!(
            requests = config.requests,
            window_seconds = config.window_seconds,
            cleanup_interval_seconds = config.cleanup_interval_seconds,
            match_all_paths = config.match_all_paths,
            paths = config.paths.len(),
            "Rate limiter configured"
        );

        Ok(Self {
            enabled: config.enabled,
            requests: config.requests,
            window: config.window(),
            cleanup_interval: config.cleanup_interval(),
            match_all_paths: config.match_all_paths,
            path_regexes,
            clients: DashMap::new(),
        })
    }

    #[cfg(test)]
    fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Check one request. Admitted requests are counted against the window.
    pub fn check(&self, ip: IpAddr, path: &str) -> RateDecision {
        if !self.enabled {
            return RateDecision::Bypassed;
        }

        if !self.match_all_paths && !self.path_regexes.iter().any(|re| re.is_match(path)) {
            return RateDecision::Bypassed;
        }

        let now = Instant::now();
        let mut entry = self.clients.entry(ip).or_insert_with(|| ClientWindow {
            hits: VecDeque::new(),
            last_seen: now,
        });
        entry.last_seen = now;

        while let Some(&oldest) = entry.hits.front() {
            if now.duration_since(oldest) >= self.window {
                entry.hits.pop_front();
            } else {
                break;
            }
        }

        if entry.hits.len() < self.requests {
            entry.hits.push_back(now);
            RateDecision::Allowed
        } else {
            debug!(ip = %ip, hits = entry.hits.len(), "Rate limit exceeded");
            counter!("waf_rate_limited", 1);
            RateDecision::Limited
        }
    }

    /// Drop entries idle longer than the window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        let window = self.window;
        let before = self.clients.len();

        self.clients
            .retain(|_, entry| now.duration_since(entry.last_seen) < window);

        let reaped = before.saturating_sub(self.clients.len());
        if reaped > 0 {
            debug!(reaped, remaining = self.clients.len(), "Rate limiter entries reaped");
        }
    }

    /// Number of currently tracked clients
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Spawn the background reaper. It wakes every cleanup interval and
    /// terminates within one interval of the shutdown signal flipping.
    pub fn start_cleanup_task(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.enabled {
            return;
        }

        let limiter = Arc::clone(&self);
        tokio::spawn(async move {
            let mut ticker = interval(limiter.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => limiter.cleanup(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Rate limiter reaper shutting down");
                            break;
                        }
                    }
                }
            }
        });
    }
}

/// Client IP from the peer address string, port stripped.
///
/// `X-Forwarded-For` is deliberately not consulted.
pub fn client_ip(remote_addr: &str) -> Result<IpAddr> {
    if let Ok(addr) = remote_addr.parse::<std::net::SocketAddr>() {
        return Ok(addr.ip());
    }
    remote_addr.parse::<IpAddr>().map_err(|e| {
        warn!(remote_addr = %remote_addr, error = %e, "Unparsable remote address");
        WafError::InvalidState(format!("unparsable remote address '{remote_addr}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(requests: usize, window_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests,
            window_seconds: 60,
            cleanup_interval_seconds: 60,
            paths: Vec::new(),
            match_all_paths: true,
        })
        .unwrap()
        .with_window(Duration::from_millis(window_ms))
    }

    #[test]
    fn test_admission_within_window() {
        let limiter = limiter(2, 1000);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        assert_eq!(limiter.check(ip, "/a"), RateDecision::Allowed);
        assert_eq!(limiter.check(ip, "/a"), RateDecision::Allowed);
        assert_eq!(limiter.check(ip, "/a"), RateDecision::Limited);

        // Another client is unaffected
        let other: IpAddr = "5.6.7.8".parse().unwrap();
        assert_eq!(limiter.check(other, "/a"), RateDecision::Allowed);
    }

    #[test]
    fn test_window_expiry_readmits() {
        let limiter = limiter(1, 50);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        assert_eq!(limiter.check(ip, "/"), RateDecision::Allowed);
        assert_eq!(limiter.check(ip, "/"), RateDecision::Limited);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(limiter.check(ip, "/"), RateDecision::Allowed);
    }

    #[test]
    fn test_path_gating() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests: 1,
            window_seconds: 60,
            cleanup_interval_seconds: 60,
            paths: vec!["^/api/".to_string()],
            match_all_paths: false,
        })
        .unwrap();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        assert_eq!(limiter.check(ip, "/static/logo.png"), RateDecision::Bypassed);
        assert_eq!(limiter.check(ip, "/api/login"), RateDecision::Allowed);
        assert_eq!(limiter.check(ip, "/api/login"), RateDecision::Limited);
        // Bypassed paths stay bypassed even while the client is limited
        assert_eq!(limiter.check(ip, "/static/logo.png"), RateDecision::Bypassed);
    }

    #[test]
    fn test_disabled_limiter_bypasses() {
        let limiter = RateLimiter::new(RateLimitConfig::default()).unwrap();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();
        assert_eq!(limiter.check(ip, "/"), RateDecision::Bypassed);
    }

    #[test]
    fn test_cleanup_reaps_idle_entries() {
        let limiter = limiter(5, 30);
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        limiter.check(ip, "/");
        assert_eq!(limiter.tracked_clients(), 1);

        std::thread::sleep(Duration::from_millis(60));
        limiter.cleanup();
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_invalid_path_regex_is_config_error() {
        let result = RateLimiter::new(RateLimitConfig {
            enabled: true,
            requests: 1,
            window_seconds: 1,
            cleanup_interval_seconds: 60,
            paths: vec!["(".to_string()],
            match_all_paths: false,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_client_ip_strips_port() {
        assert_eq!(
            client_ip("10.0.0.1:54321").unwrap(),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            client_ip("10.0.0.1").unwrap(),
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
        assert!(client_ip("not-an-address").is_err());
    }
}
