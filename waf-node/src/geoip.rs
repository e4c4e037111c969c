use crate::config::{CountryFilterConfig, LookupErrorPolicy};
use crate::error::{Result, WafError};
use maxminddb::geoip2;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Answers country-of-IP queries. The production implementation reads a
/// MaxMind database; tests substitute a stub.
pub trait CountryResolver: Send + Sync {
    /// ISO 3166-1 alpha-2 code for the address, `None` when the database
    /// has no record for it.
    fn country_code(&self, ip: IpAddr) -> Result<Option<String>>;
}

/// MaxMind database backed resolver
pub struct MaxmindResolver {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxmindResolver {
    pub fn open(path: &str) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| {
            WafError::Config(format!("failed to open GeoIP database '{path}': {e}"))
        })?;
        info!(path = %path, "GeoIP database loaded");
        Ok(Self { reader })
    }
}

impl CountryResolver for MaxmindResolver {
    fn country_code(&self, ip: IpAddr) -> Result<Option<String>> {
        match self.reader.lookup::<geoip2::Country>(ip) {
            Ok(record) => Ok(record
                .country
                .and_then(|c| c.iso_code)
                .map(|code| code.to_string())),
            Err(maxminddb::MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(WafError::GeoIp(e.to_string())),
        }
    }
}

/// Whether the configured country list denies or allows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Requests from listed countries are blocked
    Deny,
    /// Requests from outside the listed countries are blocked
    Allow,
}

/// Outcome of a country check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountryDecision {
    Allowed,
    Blocked,
    /// Lookup failed and the configured policy is `skip`
    Skipped,
}

/// Country allow/deny filter over a [`CountryResolver`].
pub struct CountryFilter {
    mode: FilterMode,
    countries: HashSet<String>,
    resolver: Arc<dyn CountryResolver>,
    fallback: LookupErrorPolicy,
}

impl CountryFilter {
    pub fn new(
        mode: FilterMode,
        countries: impl IntoIterator<Item = String>,
        resolver: Arc<dyn CountryResolver>,
        fallback: LookupErrorPolicy,
    ) -> Self {
        Self {
            mode,
            countries: countries.into_iter().map(|c| c.to_uppercase()).collect(),
            resolver,
            fallback,
        }
    }

    /// Build the configured filter, if any. Config validation has already
    /// ensured at most one of the two lists is enabled.
    pub fn from_config(config: &CountryFilterConfig) -> Result<Option<Self>> {
        let (mode, list) = if config.block.enabled {
            (FilterMode::Deny, &config.block)
        } else if config.whitelist.enabled {
            (FilterMode::Allow, &config.whitelist)
        } else {
            return Ok(None);
        };

        let resolver = Arc::new(MaxmindResolver::open(&list.geoip_db_path)?);
        Ok(Some(Self::new(
            mode,
            list.countries.iter().cloned(),
            resolver,
            config.on_lookup_error,
        )))
    }

    /// Resolve and judge one client address. The returned country string is
    /// what the per-country hit counter should record (`unknown` when the
    /// lookup produced nothing); it is reported for every call regardless
    /// of the decision.
    pub fn check(&self, ip: IpAddr) -> (CountryDecision, String) {
        match self.resolver.country_code(ip) {
            Ok(Some(code)) => {
                let code = code.to_uppercase();
                let listed = self.countries.contains(&code);
                let blocked = match self.mode {
                    FilterMode::Deny => listed,
                    FilterMode::Allow => !listed,
                };
                let decision = if blocked {
                    debug!(ip = %ip, country = %code, "Country filter blocked request");
                    CountryDecision::Blocked
                } else {
                    CountryDecision::Allowed
                };
                (decision, code)
            }
            Ok(None) => (self.fallback_decision(ip, "no record"), "unknown".to_string()),
            Err(e) => (
                self.fallback_decision(ip, &e.to_string()),
                "unknown".to_string(),
            ),
        }
    }

    fn fallback_decision(&self, ip: IpAddr, reason: &str) -> CountryDecision {
        warn!(ip = %ip, reason = %reason, policy = ?self.fallback, "GeoIP lookup failed");
        match self.fallback {
            LookupErrorPolicy::Deny => CountryDecision::Blocked,
            LookupErrorPolicy::Allow => CountryDecision::Allowed,
            LookupErrorPolicy::Skip => CountryDecision::Skipped,
        }
    }
}
