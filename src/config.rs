use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::types::Actor;

/// engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// actor recorded for automatic (callback-driven) changes
    pub system_actor: String,
    /// upper bound on one unit of work, in seconds
    pub transaction_timeout_secs: Option<u64>,
    pub duplicate_reference: DuplicateReferencePolicy,
    pub descriptions: AllocationDescriptions,
}

/// what to do when a provider delivers the same external reference twice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicateReferencePolicy {
    /// acknowledge with the outcome of the first delivery
    Acknowledge,
    /// fail with an Invalid error
    Reject,
}

/// free-text descriptions written on allocation lines and credit entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationDescriptions {
    pub installment_full: String,
    pub installment_partial: String,
    pub processing_fee: String,
    pub no_active_loan: String,
    pub fee_shortfall: String,
    pub residual: String,
    pub auto_consume: String,
    pub reversal: String,
    pub manual: String,
}

impl Default for AllocationDescriptions {
    fn default() -> Self {
        Self {
            installment_full: "installment paid fully".to_string(),
            installment_partial: "installment paid partially".to_string(),
            processing_fee: "processing fee".to_string(),
            no_active_loan: "overpayment: no active loan".to_string(),
            fee_shortfall: "overpayment: held until processing fee can be cleared".to_string(),
            residual: "overpayment: excess after installments".to_string(),
            auto_consume: "overpayment applied to loan".to_string(),
            reversal: "payment reversal".to_string(),
            manual: "manual adjustment".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_actor: "system".to_string(),
            transaction_timeout_secs: Some(30),
            duplicate_reference: DuplicateReferencePolicy::Acknowledge,
            descriptions: AllocationDescriptions::default(),
        }
    }
}

impl EngineConfig {
    /// parse from json; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json).map_err(|e| {
            EngineError::InvalidConfiguration {
                message: e.to_string(),
            }
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.system_actor.trim().is_empty() {
            return Err(EngineError::InvalidConfiguration {
                message: "system_actor must not be empty".to_string(),
            });
        }
        if self.transaction_timeout_secs == Some(0) {
            return Err(EngineError::InvalidConfiguration {
                message: "transaction_timeout_secs must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn system(&self) -> Actor {
        Actor::System(self.system_actor.clone())
    }

    pub fn transaction_timeout(&self) -> Option<chrono::Duration> {
        self.transaction_timeout_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }
}
