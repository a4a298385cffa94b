//! Node configuration
//!
//! Loaded from a JSON file. Every field has a default so a partial file (or
//! none at all) yields a working node; durations are whole seconds.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::pipeline::chunker::DEFAULT_CHUNK_SIZE;

const DAY: u64 = 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A named directory tree that gets backed up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRoot {
    pub name: String,
    pub path: PathBuf,
}

/// Where to dial a peer over TCP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerAddress {
    pub peer_id: Uuid,
    pub address: String,
}

/// A directory-backed object store used as the cloud fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudConfig {
    pub name: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Verified remote locations required per block.
    pub minimal_replicas: usize,
    /// How long a successful verification keeps counting.
    pub verification_valid_secs: u64,
    /// How long a refusing peer is skipped as a push target.
    pub refusal_backoff_secs: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            minimal_replicas: 3,
            verification_valid_secs: 21 * DAY,
            refusal_backoff_secs: 60 * 60,
        }
    }
}

impl ReplicationConfig {
    pub fn verification_valid(&self) -> Duration {
        secs(self.verification_valid_secs)
    }

    pub fn refusal_backoff(&self) -> Duration {
        secs(self.refusal_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub reverify_interval_secs: u64,
    pub deletion_threshold_secs: u64,
    pub secrets_per_block: usize,
    /// Pools at or below this size are topped up when a local copy exists.
    pub secrets_low_water: usize,
    pub challenge_ttl_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            reverify_interval_secs: 14 * DAY,
            deletion_threshold_secs: 30 * DAY,
            secrets_per_block: 12,
            secrets_low_water: 6,
            challenge_ttl_secs: 12 * 60 * 60,
        }
    }
}

impl VerificationConfig {
    pub fn reverify_interval(&self) -> Duration {
        secs(self.reverify_interval_secs)
    }

    pub fn deletion_threshold(&self) -> Duration {
        secs(self.deletion_threshold_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        secs(self.challenge_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HostConfig {
    /// Where blocks stored on behalf of other owners live. Defaults to
    /// `<data_dir>/hosted`.
    pub storage_dir: Option<PathBuf>,
    /// Owners allowed to push backups here. `None` accepts everyone.
    pub allowed_owners: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub backup_interval_secs: u64,
    pub upload_interval_secs: u64,
    pub distribute_interval_secs: u64,
    pub verify_interval_secs: u64,
    pub restore_interval_secs: u64,
    pub flush_interval_secs: u64,
    /// Maximum restore-task blocks requested per sweep.
    pub restore_batch_size: usize,
    /// Minimum wait before re-requesting an unanswered restore task.
    pub restore_retry_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backup_interval_secs: 60 * 60,
            upload_interval_secs: 10 * 60,
            distribute_interval_secs: 10 * 60,
            verify_interval_secs: 60 * 60,
            restore_interval_secs: 60,
            flush_interval_secs: 5,
            restore_batch_size: 500,
            restore_retry_secs: 5 * 60,
        }
    }
}

impl SchedulerConfig {
    pub fn restore_retry(&self) -> Duration {
        secs(self.restore_retry_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: Uuid,
    pub data_dir: PathBuf,
    /// Hex-encoded master key. Defaults to `<data_dir>/block.key`; generated
    /// on first start when missing.
    pub key_file: Option<PathBuf>,
    pub listen_address: Option<String>,
    pub peers: Vec<PeerAddress>,
    pub chunk_size: usize,
    pub backup_roots: Vec<BackupRoot>,
    pub cloud: Vec<CloudConfig>,
    pub replication: ReplicationConfig,
    pub verification: VerificationConfig,
    pub host: HostConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4(),
            data_dir: PathBuf::from("peerkeep-data"),
            key_file: None,
            listen_address: None,
            peers: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            backup_roots: Vec::new(),
            cloud: Vec::new(),
            replication: ReplicationConfig::default(),
            verification: VerificationConfig::default(),
            host: HostConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Default configuration rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
        let config: Self =
            serde_json::from_slice(&data).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.replication.minimal_replicas == 0 {
            return Err(ConfigError::Invalid(
                "minimal_replicas must be at least 1".into(),
            ));
        }
        let v = &self.verification;
        if v.secrets_per_block == 0 || v.secrets_low_water >= v.secrets_per_block {
            return Err(ConfigError::Invalid(format!(
                "secrets_low_water ({}) must be below secrets_per_block ({})",
                v.secrets_low_water, v.secrets_per_block
            )));
        }
        if v.reverify_interval_secs >= v.deletion_threshold_secs {
            return Err(ConfigError::Invalid(
                "reverify_interval must be shorter than deletion_threshold".into(),
            ));
        }
        for (i, root) in self.backup_roots.iter().enumerate() {
            if self.backup_roots[..i].iter().any(|r| r.name == root.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backup root name: {}",
                    root.name
                )));
            }
        }
        Ok(())
    }

    pub fn backup_root(&self, name: &str) -> Option<&BackupRoot> {
        self.backup_roots.iter().find(|r| r.name == name)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("catalog.json")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn restore_cache_dir(&self) -> PathBuf {
        self.data_dir.join("restore-cache")
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("block.key"))
    }

    pub fn host_dir(&self) -> PathBuf {
        self.host
            .storage_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("hosted"))
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}
