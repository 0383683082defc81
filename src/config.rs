use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::approval::{ApprovalThreshold, MAX_REVIEW_WINDOW_SECS};

/// Upper bound for queue delays (30 days)
pub const MAX_QUEUE_DELAY_SECS: u64 = 30 * 24 * 3_600;

/// Governance engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub voting: VotingConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delay between enqueue and first execution attempt (seconds)
    pub execution_delay_secs: u64,
    /// Delay before a failed task is attempted again (seconds)
    pub retry_delay_secs: u64,
    /// Retries after the first attempt before a task is terminally failed
    pub max_retries: u32,
    /// How often the driver scans for due tasks (milliseconds)
    pub poll_interval_ms: u64,
    /// Finished tasks kept for status queries before eviction
    pub max_terminal_tasks: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            execution_delay_secs: 5,
            retry_delay_secs: 30,
            max_retries: 3,
            poll_interval_ms: 1000,
            max_terminal_tasks: 500,
        }
    }
}

/// Voting power formula knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    pub admin_weight: u64,
    pub council_weight: u64,
    pub member_weight: u64,
    pub observer_weight: u64,
    /// Contribution points that earn one percent of bonus power
    pub contribution_points_per_percent: u64,
    /// Cap on the contribution bonus (percent of base weight)
    pub max_contribution_bonus_percent: u64,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            admin_weight: 300,
            council_weight: 200,
            member_weight: 100,
            observer_weight: 0,
            contribution_points_per_percent: 10,
            max_contribution_bonus_percent: 100,
        }
    }
}

/// Funding request / milestone verification workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Review window when the submitter does not pick one (seconds)
    pub default_review_window_secs: u64,
    /// Enqueue the treasury payout as soon as an item is approved
    pub auto_execute_payouts: bool,
    /// Expire items whose review deadline passed without a decision
    pub expire_overdue_reviews: bool,
    /// Enqueue proposals as soon as the sweeper finalizes them as passed
    pub auto_enqueue_passed: bool,
    /// How often the deadline sweeper runs (seconds)
    pub sweep_interval_secs: u64,
    /// Threshold used when the submitter does not pick one
    pub default_threshold: ApprovalThreshold,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_review_window_secs: 7 * 24 * 3600,
            auto_execute_payouts: true,
            expire_overdue_reviews: true,
            auto_enqueue_passed: true,
            sweep_interval_secs: 60,
            default_threshold: ApprovalThreshold::PowerPercentage { percentage: 60 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// SQLite database file (sqlite backend only)
    pub sqlite_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite_path: PathBuf::from("./data/governance.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive; RUST_LOG takes precedence when set
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,depin_governance=debug".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            voting: VotingConfig::default(),
            workflow: WorkflowConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML or YAML file (by extension)
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            _ => toml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(&self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue.poll_interval_ms == 0 {
            anyhow::bail!("Invalid queue.poll_interval_ms: must be > 0");
        }

        if self.queue.max_terminal_tasks == 0 {
            anyhow::bail!("Invalid queue.max_terminal_tasks: must be > 0");
        }

        if self.voting.contribution_points_per_percent == 0 {
            anyhow::bail!("Invalid voting.contribution_points_per_percent: must be > 0");
        }

        if self.voting.member_weight == 0 {
            anyhow::bail!("Invalid voting.member_weight: must be > 0");
        }

        if self.workflow.sweep_interval_secs == 0 {
            anyhow::bail!("Invalid workflow.sweep_interval_secs: must be > 0");
        }

        if self.queue.execution_delay_secs > MAX_QUEUE_DELAY_SECS {
            anyhow::bail!(
                "Invalid queue.execution_delay_secs: must be <= {}",
                MAX_QUEUE_DELAY_SECS
            );
        }

        if self.queue.retry_delay_secs > MAX_QUEUE_DELAY_SECS {
            anyhow::bail!("Invalid queue.retry_delay_secs: must be <= {}", MAX_QUEUE_DELAY_SECS);
        }

        if self.workflow.default_review_window_secs == 0
            || self.workflow.default_review_window_secs > MAX_REVIEW_WINDOW_SECS
        {
            anyhow::bail!(
                "Invalid workflow.default_review_window_secs: must be between 1 and {}",
                MAX_REVIEW_WINDOW_SECS
            );
        }

        self.workflow
            .default_threshold
            .validate_shape()
            .map_err(|e| anyhow::anyhow!("Invalid workflow.default_threshold: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.execution_delay_secs, 5);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.voting.member_weight, 100);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert!(config.workflow.auto_execute_payouts);
    }

    #[test]
    fn test_config_validation_succeeds() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_fails_zero_poll_interval() {
        let mut config = Config::default();
        config.queue.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_fails_oversized_windows() {
        let mut config = Config::default();
        config.queue.retry_delay_secs = MAX_QUEUE_DELAY_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.workflow.default_review_window_secs = MAX_REVIEW_WINDOW_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_fails_bad_threshold() {
        let mut config = Config::default();
        config.workflow.default_threshold = ApprovalThreshold::PowerPercentage { percentage: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserialization_partial() {
        let toml_str = r#"
            [queue]
            execution_delay_secs = 0
            max_retries = 5

            [workflow]
            default_threshold = { type = "count", approvals = 3 }

            [storage]
            backend = "memory"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.queue.execution_delay_secs, 0);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.retry_delay_secs, 30);
        assert_eq!(
            config.workflow.default_threshold,
            ApprovalThreshold::Count { approvals: 3 }
        );
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.voting.admin_weight, 300);
    }

    #[test]
    fn test_config_file_round_trip() {
        let file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        let original = Config::default();
        original.to_file(file.path()).unwrap();

        let loaded = Config::from_file(file.path()).unwrap();
        assert_eq!(loaded.queue.retry_delay_secs, original.queue.retry_delay_secs);
        assert_eq!(loaded.storage.sqlite_path, original.storage.sqlite_path);
    }

    #[test]
    fn test_config_from_yaml() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        fs::write(
            file.path(),
            "queue:\n  max_retries: 1\nstorage:\n  backend: memory\n",
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.queue.max_retries, 1);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }
}
