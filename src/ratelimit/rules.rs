//! Named limit rules loaded from configuration.
//!
//! A rule binds a scope strategy to a window policy:
//!
//! ```yaml
//! limits:
//!   - name: login
//!     scope: route_client
//!     window_ms: 20000
//!     threshold: 2
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::policy::WindowPolicy;
use super::scope::ScopeStrategy;
use crate::error::{RateWindowError, Result};

/// Scope kinds available from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    Route,
    RouteClient,
    Global,
}

impl From<ScopeKind> for ScopeStrategy {
    fn from(kind: ScopeKind) -> Self {
        match kind {
            ScopeKind::Route => ScopeStrategy::Route,
            ScopeKind::RouteClient => ScopeStrategy::RouteClient,
            ScopeKind::Global => ScopeStrategy::Global,
        }
    }
}

/// A single named limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Rule name, unique within a rule set
    pub name: String,
    /// How requests are grouped
    pub scope: ScopeKind,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Maximum live events in the window
    pub threshold: u64,
}

impl LimitRule {
    /// Build the window policy for this rule.
    pub fn policy(&self) -> Result<WindowPolicy> {
        WindowPolicy::from_millis(self.window_ms, self.threshold).map_err(|e| match e {
            RateWindowError::InvalidPolicy(msg) => {
                RateWindowError::InvalidPolicy(format!("rule '{}': {}", self.name, msg))
            }
            other => other,
        })
    }

    /// Get the scope strategy for this rule.
    pub fn strategy(&self) -> ScopeStrategy {
        self.scope.into()
    }
}

/// A validated set of limit rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub limits: Vec<LimitRule>,
}

impl RuleSet {
    /// Create a rule set, checking names are unique and policies valid.
    pub fn new(limits: Vec<LimitRule>) -> Result<Self> {
        let set = Self { limits };
        set.validate()?;
        Ok(set)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a bare list of rules or a mapping with a `limits` key.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(limits) = serde_yaml::from_str::<Vec<LimitRule>>(yaml) {
            return Self::new(limits);
        }

        let set: RuleSet = serde_yaml::from_str(yaml)
            .map_err(|e| RateWindowError::Config(format!("Failed to parse limit rules: {}", e)))?;
        set.validate()?;

        info!(rules = set.limits.len(), "Loaded limit rules");
        Ok(set)
    }

    /// Check that names are unique and every policy is valid.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for rule in &self.limits {
            if !seen.insert(rule.name.as_str()) {
                return Err(RateWindowError::Config(format!(
                    "duplicate limit rule '{}'",
                    rule.name
                )));
            }
            rule.policy()?;
        }
        Ok(())
    }

    /// Find a rule by name.
    pub fn find(&self, name: &str) -> Option<&LimitRule> {
        self.limits.iter().find(|rule| rule.name == name)
    }

    /// Iterate over the rules.
    pub fn iter(&self) -> impl Iterator<Item = &LimitRule> {
        self.limits.iter()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}
