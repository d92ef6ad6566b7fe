use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::notification::SlaStage;
use crate::store::Store;

/// Default SLA windows, in calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaDefaults {
    pub draft_days: u32,
    pub review_days: u32,
    pub validation_days: u32,
}

impl Default for SlaDefaults {
    fn default() -> Self {
        Self {
            draft_days: 7,
            review_days: 5,
            validation_days: 10,
        }
    }
}

impl SlaDefaults {
    pub fn days(&self, stage: SlaStage) -> u32 {
        match stage {
            SlaStage::Draft => self.draft_days,
            SlaStage::Review => self.review_days,
            SlaStage::Validation => self.validation_days,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sla: SlaDefaults,
}

impl Config {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    /// Stored overrides win over the configured defaults.
    pub fn sla_days(&self, store: &Store, stage: SlaStage) -> Result<u32> {
        Ok(store
            .sla_days(stage)?
            .unwrap_or_else(|| self.sla.days(stage)))
    }
}
