use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Main configuration for the WAF node
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WafNodeConfig {
    /// Network configuration (node binary only)
    pub network: NetworkConfig,
    /// Core firewall settings
    pub waf: FirewallConfig,
    /// Rate limiting settings
    pub rate_limit: RateLimitConfig,
    /// GeoIP country filtering
    pub country_filter: CountryFilterConfig,
    /// Security-event logging
    pub logging: LoggingConfig,
    /// Custom block responses, keyed by status code
    pub custom_responses: Vec<CustomResponseConfig>,
}

/// Network configuration for the node binary
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address for the public side
    pub listen_addr: String,
    /// Upstream origin the node forwards allowed traffic to
    pub backend_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            backend_url: "http://127.0.0.1:9090".to_string(),
        }
    }
}

/// Core firewall settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Rule JSON files, evaluated in the order given
    pub rule_files: Vec<String>,
    /// IP blacklist file (one CIDR or address per line, `#` comments)
    pub ip_blacklist_file: Option<String>,
    /// DNS blacklist file (one host per line, `#` comments)
    pub dns_blacklist_file: Option<String>,
    /// Cumulative anomaly score at which a request is blocked
    pub anomaly_threshold: i64,
    /// Path serving the JSON metrics snapshot; must start with `/`
    pub metrics_endpoint: Option<String>,
    /// Replace sensitive extracted values with REDACTED in log output
    pub redact_sensitive_data: bool,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            rule_files: Vec::new(),
            ip_blacklist_file: None,
            dns_blacklist_file: None,
            anomaly_threshold: 5,
            metrics_endpoint: None,
            redact_sensitive_data: false,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable the sliding-window limiter
    pub enabled: bool,
    /// Maximum requests per client within the window
    pub requests: usize,
    /// Trailing window length in seconds
    pub window_seconds: u64,
    /// Reaper wake-up interval in seconds
    pub cleanup_interval_seconds: u64,
    /// Path regexes the limiter applies to (empty + !match_all_paths = applies nowhere)
    pub paths: Vec<String>,
    /// Apply the limiter to every path regardless of `paths`
    pub match_all_paths: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests: 100,
            window_seconds: 60,
            cleanup_interval_seconds: 60,
            paths: Vec::new(),
            match_all_paths: true,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

/// Policy applied when a GeoIP lookup fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LookupErrorPolicy {
    /// Treat the request as blocked (fail closed)
    #[default]
    Deny,
    /// Treat the request as allowed
    Allow,
    /// Skip the country filter for this request
    Skip,
}

/// One country list (deny or allow semantics decided by position)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CountryListConfig {
    /// Enable this filter
    pub enabled: bool,
    /// Path to the MaxMind database file
    pub geoip_db_path: String,
    /// ISO 3166-1 alpha-2 codes
    pub countries: Vec<String>,
}

/// GeoIP country filtering configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CountryFilterConfig {
    /// Deny-list filter: requests from these countries are blocked
    pub block: CountryListConfig,
    /// Allow-list filter: requests from outside these countries are blocked
    pub whitelist: CountryListConfig,
    /// What to do when the country of an address cannot be resolved
    pub on_lookup_error: LookupErrorPolicy,
}

/// Security-event logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum severity: debug, info, warn, error
    pub severity: String,
    /// Emit JSON records instead of plain text
    pub json: bool,
    /// Optional file sink appended to alongside the console
    pub file_path: Option<String>,
    /// Bounded queue capacity for the async log worker
    pub queue_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            severity: "info".to_string(),
            json: false,
            file_path: None,
            queue_capacity: 1024,
        }
    }
}

/// One custom block response
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CustomResponseConfig {
    /// Status code this response replaces
    pub status: u16,
    /// Content-Type header value
    pub content_type: String,
    /// Inline body
    pub body: Option<String>,
    /// Body loaded from a file at startup (takes precedence over `body`)
    pub body_file: Option<String>,
    /// Additional response headers
    pub headers: HashMap<String, String>,
}

impl WafNodeConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("WAF_NODE").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Parse the listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.network.listen_addr.parse()
    }

    /// Save configuration to file
    #[allow(dead_code)]
    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.waf.rule_files.is_empty() {
            return Err("no rule files specified".to_string());
        }

        if self.waf.anomaly_threshold < 0 {
            return Err("anomaly_threshold cannot be negative".to_string());
        }

        if let Some(endpoint) = &self.waf.metrics_endpoint {
            if !endpoint.starts_with('/') {
                return Err("metrics_endpoint must start with '/'".to_string());
            }
        }

        if self.rate_limit.enabled
            && (self.rate_limit.requests == 0 || self.rate_limit.window_seconds == 0)
        {
            return Err(
                "invalid rate limit configuration: requests and window must be greater than zero"
                    .to_string(),
            );
        }

        if self.country_filter.block.enabled && self.country_filter.whitelist.enabled {
            return Err(
                "country block and country whitelist cannot both be enabled".to_string(),
            );
        }

        for list in [&self.country_filter.block, &self.country_filter.whitelist] {
            if list.enabled {
                if list.geoip_db_path.is_empty() {
                    return Err(
                        "country filtering is enabled but no GeoIP database path specified"
                            .to_string(),
                    );
                }
                if list.countries.is_empty() {
                    return Err(
                        "country filtering is enabled but the country list is empty".to_string(),
                    );
                }
            }
        }

        for response in &self.custom_responses {
            if response.status < 100 || response.status > 599 {
                return Err(format!(
                    "custom_response has an invalid status code: {}",
                    response.status
                ));
            }
            if response.body.is_none() && response.body_file.is_none() {
                return Err(format!(
                    "custom_response for status {} has neither body nor body_file",
                    response.status
                ));
            }
        }

        match self.logging.severity.as_str() {
            "debug" | "info" | "warn" | "error" => {}
            other => return Err(format!("invalid log severity: '{other}'")),
        }

        Ok(())
    }
}
