//! Receipt rule sets and the activator that makes one of them active.
//!
//! At most one rule set is active at a time. Activation is idempotent:
//! applying the same desired state twice leaves the same end state.

pub mod libsql_store;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ProxyConfig;
use crate::error::ControlError;

pub use libsql_store::LibSqlRuleSets;
pub use memory::MemoryRuleSets;

/// Name of the single rule the proxy installs.
pub const DEFAULT_RULE_NAME: &str = "default-proxy-rule";

/// Function the receiving edge invokes after archiving.
pub const FORWARDER_FUNCTION: &str = "ses-proxy-forwarder";

/// What the receiving edge does with a matched message, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    /// Store the raw message at `{bucket}/{prefix}/{message_id}`.
    Archive { bucket: String, prefix: String },
    /// Notify the forwarder once the message is archived.
    InvokeForwarder { function: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRule {
    pub name: String,
    pub enabled: bool,
    /// Spam and virus scanning; flagged mail is dropped before any action.
    pub scan_enabled: bool,
    /// Recipient domains or addresses this rule applies to. Empty matches all.
    #[serde(default)]
    pub recipients: Vec<String>,
    pub actions: Vec<RuleAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: String,
    pub rules: Vec<ReceiptRule>,
}

impl RuleSet {
    /// The rule set this deployment wants active.
    pub fn desired(config: &ProxyConfig) -> Self {
        Self {
            name: config.rule_set_name.clone(),
            rules: vec![ReceiptRule {
                name: DEFAULT_RULE_NAME.into(),
                enabled: true,
                scan_enabled: true,
                recipients: Vec::new(),
                actions: vec![
                    RuleAction::Archive {
                        bucket: config.archive_bucket.clone(),
                        prefix: config.archive_prefix.clone(),
                    },
                    RuleAction::InvokeForwarder {
                        function: FORWARDER_FUNCTION.into(),
                    },
                ],
            }],
        }
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.name.trim().is_empty() {
            return Err(ControlError::InvalidRuleSet("rule set name is empty".into()));
        }
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.name.trim().is_empty() {
                return Err(ControlError::InvalidRuleSet(format!("rule #{i} has no name")));
            }
            if self.rules[..i].iter().any(|r| r.name == rule.name) {
                return Err(ControlError::InvalidRuleSet(format!(
                    "duplicate rule name {:?}",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}

/// Control plane of the receiving service.
#[async_trait]
pub trait RuleSetService: Send + Sync {
    /// Create the rule set or replace its definition.
    async fn put_rule_set(&self, rule_set: &RuleSet) -> Result<(), ControlError>;

    /// Make `name` the single active rule set. Activating the already active
    /// set succeeds without change. Unknown names fail with
    /// [`ControlError::RuleSetNotFound`].
    async fn set_active_rule_set(&self, name: &str) -> Result<(), ControlError>;

    /// Name of the active rule set, if any.
    async fn active_rule_set(&self) -> Result<Option<String>, ControlError>;
}

/// Drives the control plane towards the desired state on every deployment.
///
/// Keeps no record of what it activated before; every call goes to the
/// service.
#[derive(Clone)]
pub struct RuleSetActivator {
    service: Arc<dyn RuleSetService>,
}

impl RuleSetActivator {
    pub fn new(service: Arc<dyn RuleSetService>) -> Self {
        Self { service }
    }

    /// Make `name` the active rule set.
    pub async fn ensure_active(&self, name: &str) -> Result<(), ControlError> {
        self.service.set_active_rule_set(name).await?;
        info!(rule_set = name, "Rule set active");
        Ok(())
    }

    /// Create or update `desired`, then activate it.
    pub async fn apply(&self, desired: &RuleSet) -> Result<(), ControlError> {
        desired.validate()?;
        self.service.put_rule_set(desired).await?;
        info!(
            rule_set = %desired.name,
            rules = desired.rules.len(),
            "Rule set definition applied"
        );
        self.ensure_active(&desired.name).await
    }
}
