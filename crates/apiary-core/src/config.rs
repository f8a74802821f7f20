//! Governance configuration, read once at startup.
//!
//! Lives in `.apiary/governance.yaml`. Every field has a default, so a
//! missing file or a partial file is valid.

use crate::policy::TrustLevel;
use crate::types::{ResolutionStrategy, Severity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GovernanceConfig {
    pub thresholds: Thresholds,
    pub policy: PolicyDefaults,
    pub conflict: ConflictConfig,
    pub conference: ConferenceConfig,
    pub safety: SafetyConfig,
    /// Swarm-formation templates: name → roles to staff a new Group with.
    pub swarm_templates: BTreeMap<String, Vec<SwarmRole>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    /// Retryable task failures allowed before a failure becomes terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Revisits of one state tolerated before the safety monitor flags oscillation.
    #[serde(default = "default_max_loop_count")]
    pub max_loop_count: u32,
    /// Maximum concurrently running Runs per Group.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: u32,
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    #[serde(default = "default_lock_retry_attempts")]
    pub lock_retry_attempts: u32,
    #[serde(default = "default_lock_retry_base_ms")]
    pub lock_retry_base_ms: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_loop_count: default_max_loop_count(),
            concurrency_limit: default_concurrency_limit(),
            approval_timeout_secs: default_approval_timeout_secs(),
            lock_retry_attempts: default_lock_retry_attempts(),
            lock_retry_base_ms: default_lock_retry_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDefaults {
    /// Trust assumed for actors with no explicit entry.
    #[serde(default = "default_trust")]
    pub default_trust: TrustLevel,
    #[serde(default)]
    pub actors: BTreeMap<String, TrustLevel>,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            default_trust: default_trust(),
            actors: BTreeMap::new(),
        }
    }
}

impl PolicyDefaults {
    pub fn trust_of(&self, actor: &str) -> TrustLevel {
        self.actors.get(actor).copied().unwrap_or(self.default_trust)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictConfig {
    #[serde(default = "default_true")]
    pub auto_resolve: bool,
    /// Conflicts above this severity always escalate.
    #[serde(default = "default_auto_resolve_max_severity")]
    pub auto_resolve_max_severity: Severity,
    #[serde(default = "default_strategy")]
    pub default_strategy: ResolutionStrategy,
    /// Group precedence for `static_priority`; higher wins.
    #[serde(default)]
    pub group_priority: BTreeMap<String, i32>,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            auto_resolve: true,
            auto_resolve_max_severity: default_auto_resolve_max_severity(),
            default_strategy: default_strategy(),
            group_priority: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConferenceConfig {
    #[serde(default = "default_quorum_percentage")]
    pub quorum_percentage: u32,
    #[serde(default = "default_voting_timeout_secs")]
    pub voting_timeout_secs: u64,
    /// Overall budget for gathering opinions, voting included.
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            quorum_percentage: default_quorum_percentage(),
            voting_timeout_secs: default_voting_timeout_secs(),
            time_budget_secs: default_time_budget_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafetyConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_events_per_window")]
    pub max_events_per_window: u32,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub auto_suspend: bool,
    /// How long a terminal scope's counters are kept before eviction.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_events_per_window: default_max_events_per_window(),
            max_cost_usd: None,
            auto_suspend: false,
            retention_secs: default_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SwarmRole {
    pub role: String,
    #[serde(default = "default_role_count")]
    pub count: u32,
}

fn default_max_retries() -> u32 {
    3
}
fn default_max_loop_count() -> u32 {
    3
}
fn default_concurrency_limit() -> u32 {
    8
}
fn default_approval_timeout_secs() -> u64 {
    300
}
fn default_lock_retry_attempts() -> u32 {
    5
}
fn default_lock_retry_base_ms() -> u64 {
    10
}
fn default_trust() -> TrustLevel {
    TrustLevel::Standard
}
fn default_true() -> bool {
    true
}
fn default_auto_resolve_max_severity() -> Severity {
    Severity::Medium
}
fn default_strategy() -> ResolutionStrategy {
    ResolutionStrategy::FirstClaimWins
}
fn default_quorum_percentage() -> u32 {
    50
}
fn default_voting_timeout_secs() -> u64 {
    60
}
fn default_time_budget_secs() -> u64 {
    300
}
fn default_window_secs() -> u64 {
    60
}
fn default_max_events_per_window() -> u32 {
    200
}
fn default_retention_secs() -> u64 {
    600
}
fn default_role_count() -> u32 {
    1
}

impl GovernanceConfig {
    /// Parse YAML text and validate it.
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let cfg: GovernanceConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a file; defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        Self::from_yaml(&text).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let q = self.conference.quorum_percentage;
        if q == 0 || q > 100 {
            anyhow::bail!("conference.quorum_percentage must be within 1..=100, got {q}");
        }
        if self.conference.voting_timeout_secs == 0 {
            anyhow::bail!("conference.voting_timeout_secs must be positive");
        }
        if self.conference.voting_timeout_secs > self.conference.time_budget_secs {
            anyhow::bail!(
                "conference.voting_timeout_secs ({}) exceeds time_budget_secs ({})",
                self.conference.voting_timeout_secs,
                self.conference.time_budget_secs
            );
        }
        if self.safety.window_secs == 0 {
            anyhow::bail!("safety.window_secs must be positive");
        }
        if let Some(max) = self.safety.max_cost_usd {
            if !(max.is_finite() && max > 0.0) {
                anyhow::bail!("safety.max_cost_usd must be a positive number, got {max}");
            }
        }
        if self.thresholds.lock_retry_attempts == 0 {
            anyhow::bail!("thresholds.lock_retry_attempts must be at least 1");
        }
        for (name, roles) in &self.swarm_templates {
            if roles.is_empty() {
                anyhow::bail!("swarm template `{name}` has no roles");
            }
            if let Some(r) = roles.iter().find(|r| r.count == 0 || r.role.trim().is_empty()) {
                anyhow::bail!("swarm template `{name}`: invalid role entry `{}`", r.role);
            }
        }
        Ok(())
    }

    pub fn swarm_template(&self, name: &str) -> Option<&[SwarmRole]> {
        self.swarm_templates.get(name).map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let cfg = GovernanceConfig::from_yaml("{}").unwrap();
        assert_eq!(cfg, GovernanceConfig::default());
        assert_eq!(cfg.conference.quorum_percentage, 50);
        assert_eq!(cfg.thresholds.max_retries, 3);
        assert!(cfg.conflict.auto_resolve);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let cfg = GovernanceConfig::from_yaml(
            r#"
policy:
  default_trust: limited
  actors:
    lead-bot: elevated
conflict:
  default_strategy: static_priority
  group_priority:
    core: 10
    docs: 1
safety:
  auto_suspend: true
  max_cost_usd: 25.0
swarm_templates:
  review:
    - role: reviewer
      count: 2
    - role: author
"#,
        )
        .unwrap();
        assert_eq!(cfg.policy.trust_of("lead-bot"), TrustLevel::Elevated);
        assert_eq!(cfg.policy.trust_of("stranger"), TrustLevel::Limited);
        assert_eq!(cfg.conflict.default_strategy, ResolutionStrategy::StaticPriority);
        assert_eq!(cfg.conflict.group_priority["core"], 10);
        assert!(cfg.safety.auto_suspend);
        assert_eq!(cfg.safety.window_secs, 60);
        let review = cfg.swarm_template("review").unwrap();
        assert_eq!(review.len(), 2);
        assert_eq!(review[1].count, 1);
    }

    #[test]
    fn invalid_quorum_rejected() {
        let err = GovernanceConfig::from_yaml("conference:\n  quorum_percentage: 0\n").unwrap_err();
        assert!(err.to_string().contains("quorum_percentage"));
    }

    #[test]
    fn empty_swarm_template_rejected() {
        assert!(GovernanceConfig::from_yaml("swarm_templates:\n  empty: []\n").is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = GovernanceConfig::load(&tmp.path().join("governance.yaml")).unwrap();
        assert_eq!(cfg, GovernanceConfig::default());
    }

    #[test]
    fn load_reports_path_on_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("governance.yaml");
        std::fs::write(&path, "conference: [not, a, map]\n").unwrap();
        let err = GovernanceConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("governance.yaml"));
    }
}
