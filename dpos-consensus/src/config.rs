//! Consensus engine configuration

use crate::{ConsensusError, ConsensusResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// DPoS consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Base mining interval in milliseconds
    pub mining_interval_ms: u64,
    /// Permitted deviation of observed intervals from the base interval,
    /// as a percentage of the base interval
    pub interval_tolerance_percent: u64,
    /// Maximum consecutive tiny blocks a miner may produce in one slot
    pub tiny_blocks_limit: u64,
    /// Term length in seconds
    pub period_seconds: u64,
    /// Interval in seconds at which the miner count may grow
    pub miner_increase_interval_seconds: u64,
    /// Hard cap on the miner set size
    pub maximum_miners_count: usize,
    /// How far (in blocks) a self-reported irreversible height may lag
    /// behind or lead the actual chain height
    pub lib_report_window: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            mining_interval_ms: 4000,
            interval_tolerance_percent: 10,
            tiny_blocks_limit: 8,
            period_seconds: 604_800, // one week
            miner_increase_interval_seconds: 31_536_000,
            maximum_miners_count: 17,
            lib_report_window: 1024,
        }
    }
}

impl ConsensusConfig {
    /// Load configuration from file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConsensusResult<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ConsensusError::Config(format!("Failed to read config file: {e}")))?;

        let config: ConsensusConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> ConsensusResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .map_err(|e| ConsensusError::Config(format!("Failed to write config file: {e}")))?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConsensusResult<()> {
        if self.mining_interval_ms == 0 {
            return Err(ConsensusError::Config(
                "Mining interval must be greater than 0".to_string(),
            ));
        }

        if self.interval_tolerance_percent >= 100 {
            return Err(ConsensusError::Config(
                "Interval tolerance must be below 100 percent".to_string(),
            ));
        }

        if self.tiny_blocks_limit == 0 {
            return Err(ConsensusError::Config(
                "Tiny blocks limit must be greater than 0".to_string(),
            ));
        }

        if self.period_seconds == 0 {
            return Err(ConsensusError::Config(
                "Term period must be greater than 0".to_string(),
            ));
        }

        if self.maximum_miners_count == 0 {
            return Err(ConsensusError::Config(
                "Maximum miners count must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Lowest interval the clock accepts, in milliseconds
    pub fn min_interval_ms(&self) -> u64 {
        self.mining_interval_ms - self.mining_interval_ms * self.interval_tolerance_percent / 100
    }

    /// Highest interval the clock accepts, in milliseconds
    pub fn max_interval_ms(&self) -> u64 {
        self.mining_interval_ms + self.mining_interval_ms * self.interval_tolerance_percent / 100
    }

    /// Window a miner has to produce inside its slot, in milliseconds
    pub fn slot_limit_ms(&self) -> u64 {
        self.mining_interval_ms
    }

    /// Set the base mining interval
    pub fn with_mining_interval(mut self, interval_ms: u64) -> Self {
        self.mining_interval_ms = interval_ms;
        self
    }

    /// Set the term length
    pub fn with_period_seconds(mut self, seconds: u64) -> Self {
        self.period_seconds = seconds;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ConsensusConfig::default();
        assert_eq!(config.mining_interval_ms, 4000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ConsensusConfig::default();

        config.mining_interval_ms = 0;
        assert!(config.validate().is_err());

        config.mining_interval_ms = 4000;
        config.interval_tolerance_percent = 100;
        assert!(config.validate().is_err());

        config.interval_tolerance_percent = 10;
        config.period_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interval_bounds() {
        let config = ConsensusConfig::default();
        assert_eq!(config.min_interval_ms(), 3600);
        assert_eq!(config.max_interval_ms(), 4400);
    }

    #[test]
    fn test_file_operations() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("consensus.json");

        let config = ConsensusConfig::default().with_mining_interval(8000);
        config.save_to_file(&file_path).unwrap();

        let loaded = ConsensusConfig::load_from_file(&file_path).unwrap();
        assert_eq!(loaded.mining_interval_ms, 8000);
        assert_eq!(loaded.tiny_blocks_limit, config.tiny_blocks_limit);
    }
}
