use serde::{Deserialize, Serialize};

use crate::types::RaceTime;

/// Tunables for punch reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Repeated punches at one station closer than this many seconds are duplicates.
    pub min_repunch_interval: RaceTime,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_repunch_interval: 10,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON config document; missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        assert_eq!(EngineConfig::from_json("{}").unwrap(), EngineConfig::default());
        let cfg = EngineConfig::from_json(r#"{"min_repunch_interval": 45}"#).unwrap();
        assert_eq!(cfg.min_repunch_interval, 45);
        assert!(EngineConfig::from_json("[").is_err());
    }
}
