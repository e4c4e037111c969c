use crate::error::{Result, WafError};
use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a matching rule does beyond scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Block the request outright
    Block,
    /// Allow but emit an info-level record
    Log,
    /// Score only
    Score,
}

/// Raw rule record as it appears in a rule JSON file
#[derive(Debug, Clone, Deserialize)]
pub struct RawRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub phase: i64,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i64,
}

/// A validated rule with its compiled pattern
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub phase: u8,
    pub pattern: String,
    pub targets: Vec<String>,
    pub severity: String,
    pub score: u64,
    pub action: RuleAction,
    pub description: String,
    pub priority: i64,
    pub regex: Arc<Regex>,
}

fn validate_rule(rule: &RawRule) -> Result<()> {
    if rule.id.is_empty() {
        return Err(WafError::RuleValidation("rule has an empty ID".to_string()));
    }
    if rule.pattern.is_empty() {
        return Err(WafError::RuleValidation(format!(
            "rule '{}' has an empty pattern",
            rule.id
        )));
    }
    if rule.targets.is_empty() {
        return Err(WafError::RuleValidation(format!(
            "rule '{}' has no targets",
            rule.id
        )));
    }
    if !(1..=4).contains(&rule.phase) {
        return Err(WafError::RuleValidation(format!(
            "rule '{}' has an invalid phase: {}. Valid phases are 1 to 4",
            rule.id, rule.phase
        )));
    }
    if rule.score < 0 {
        return Err(WafError::RuleValidation(format!(
            "rule '{}' has a negative score",
            rule.id
        )));
    }
    match rule.mode.as_str() {
        "" | "block" | "log" => Ok(()),
        other => Err(WafError::RuleValidation(format!(
            "rule '{}' has an invalid action: '{}'. Valid actions are 'block' or 'log'",
            rule.id, other
        ))),
    }
}

fn pattern_fingerprint(pattern: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    pattern.hash(&mut hasher);
    hasher.finish()
}

/// Process-wide memo of compiled patterns, keyed by (rule id, pattern hash)
/// so a rule that keeps its id but changes its pattern recompiles instead of
/// being served the stale regex. Entries survive reloads and are never
/// pruned; the map is bounded by rule-id cardinality.
#[derive(Debug, Default)]
pub struct RegexCache {
    compiled: DashMap<(String, u64), Arc<Regex>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(&self, id: &str, pattern: &str) -> Result<Arc<Regex>> {
        let key = (id.to_string(), pattern_fingerprint(pattern));
        if let Some(regex) = self.compiled.get(&key) {
            return Ok(Arc::clone(&regex));
        }

        let regex = Arc::new(Regex::new(pattern).map_err(|e| {
            WafError::RuleValidation(format!("rule '{id}': invalid regex pattern: {e}"))
        })?);
        self.compiled.insert(key, Arc::clone(&regex));
        Ok(regex)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

/// Immutable per-phase rule index, swapped wholesale on reload
#[derive(Debug, Default)]
pub struct RuleStore {
    phases: [Vec<CompiledRule>; 4],
    total: usize,
}

impl RuleStore {
    pub fn rules_for_phase(&self, phase: u8) -> &[CompiledRule] {
        match phase {
            1..=4 => &self.phases[(phase - 1) as usize],
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Outcome of a load pass, for logging and for the zero-survivor check
#[derive(Debug, Default)]
pub struct LoadSummary {
    pub total_rules: usize,
    pub invalid_files: Vec<String>,
    pub invalid_rules: Vec<String>,
}

/// Read every configured rule file and build a fresh store.
///
/// Per-file read/parse failures and per-rule validation failures are
/// tolerated (skipped with a warning); the load fails only when zero valid
/// rules survive and at least one file failed.
pub fn load_rules(paths: &[String], cache: &RegexCache) -> Result<(RuleStore, LoadSummary)> {
    debug!(rule_files = ?paths, "Loading rules from files");

    let mut store = RuleStore::default();
    let mut summary = LoadSummary::default();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for path in paths {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(file = %path, error = %e, "Failed to read rule file");
                summary.invalid_files.push(path.clone());
                continue;
            }
        };

        let raw_rules: Vec<RawRule> = match serde_json::from_str(&content) {
            Ok(raw_rules) => raw_rules,
            Err(e) => {
                warn!(file = %path, error = %e, "Failed to parse rule file");
                summary.invalid_files.push(path.clone());
                continue;
            }
        };

        let mut loaded_from_file = 0usize;
        for (index, raw) in raw_rules.into_iter().enumerate() {
            if let Err(e) = validate_rule(&raw) {
                summary
                    .invalid_rules
                    .push(format!("{path}: rule at index {index}: {e}"));
                continue;
            }

            if !seen_ids.insert(raw.id.clone()) {
                summary
                    .invalid_rules
                    .push(format!("{path}: duplicate rule ID '{}' at index {index}", raw.id));
                continue;
            }

            let regex = match cache.get_or_compile(&raw.id, &raw.pattern) {
                Ok(regex) => regex,
                Err(e) => {
                    summary.invalid_rules.push(format!("{path}: {e}"));
                    continue;
                }
            };

            let action = match raw.mode.as_str() {
                "block" => RuleAction::Block,
                "log" => RuleAction::Log,
                _ => RuleAction::Score,
            };

            store.phases[(raw.phase - 1) as usize].push(CompiledRule {
                id: raw.id,
                phase: raw.phase as u8,
                pattern: raw.pattern,
                targets: raw.targets,
                severity: raw.severity,
                score: raw.score as u64,
                action,
                description: raw.description,
                priority: raw.priority,
                regex,
            });
            store.total += 1;
            loaded_from_file += 1;
        }

        info!(file = %path, rules = loaded_from_file, "Rules loaded");
    }

    if !summary.invalid_files.is_empty() {
        warn!(invalid_files = ?summary.invalid_files, "Some rule files could not be loaded");
    }
    if !summary.invalid_rules.is_empty() {
        warn!(invalid_rules = ?summary.invalid_rules, "Some rules failed validation");
    }

    if store.total == 0 && !summary.invalid_files.is_empty() {
        return Err(WafError::RuleFile(
            "no valid rules were loaded from any file".to_string(),
        ));
    }

    // Priority-descending within each phase; the stable sort keeps load
    // order for ties.
    for phase_rules in &mut store.phases {
        phase_rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    summary.total_rules = store.total;
    debug!(total_rules = store.total, "Rules loaded successfully");

    Ok((store, summary))
}
