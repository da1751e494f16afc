//! Settings type definitions.
//!
//! Field names are camelCase on disk. Every section is `#[serde(default)]`
//! so a partial `settings.json` fills the rest from [`Default`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings for a keel process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeelSettings {
    pub server: ServerSettings,
    pub session: SessionSettings,
    pub advisory: AdvisorySettings,
    pub reality: RealitySettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
}

impl KeelSettings {
    /// Reject values that deserialize fine but cannot be run with.
    pub fn validate(&self) -> Result<()> {
        if self.session.default_budget == 0 {
            return Err(SettingsError::InvalidValue(
                "session.defaultBudget must be positive".into(),
            ));
        }
        let fractions = &self.session.checkpoint_fractions;
        if fractions.is_empty()
            || fractions.iter().any(|f| !(*f > 0.0 && *f <= 1.0))
            || fractions.windows(2).any(|w| w[0] >= w[1])
        {
            return Err(SettingsError::InvalidValue(
                "session.checkpointFractions must be strictly increasing values in (0, 1]".into(),
            ));
        }
        if !(self.advisory.budget_ratio > 0.0 && self.advisory.budget_ratio <= 1.0) {
            return Err(SettingsError::InvalidValue(
                "advisory.budgetRatio must be in (0, 1]".into(),
            ));
        }
        if self.server.max_send_queue == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxSendQueue must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Per-client outbound queue depth; overflow drops messages.
    pub max_send_queue: usize,
    /// Shared secret clients must present. `None` leaves the hub open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Seconds between periodic advisory runs. 0 disables the ticker.
    pub advisory_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7420,
            max_send_queue: 256,
            auth_token: None,
            advisory_interval_secs: 300,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub default_budget: u64,
    /// Where planned checkpoints fall for large scopes, as fractions of lines.
    pub checkpoint_fractions: Vec<f64>,
    /// Scopes with at least this many lines get multiple planned checkpoints.
    pub large_scope_lines: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_budget: 200_000,
            checkpoint_fractions: vec![0.3, 0.6, 0.85],
            large_scope_lines: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvisorySettings {
    pub agent_timeout_ms: u64,
    /// Share of the session budget advisory output may spend.
    pub budget_ratio: f64,
}

impl Default for AdvisorySettings {
    fn default() -> Self {
        Self {
            agent_timeout_ms: 5_000,
            budget_ratio: 0.5,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealitySettings {
    /// Shell command whose output reports test results (e.g. `cargo test`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
    /// Workspace to observe. Defaults to the process working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
}

impl RealitySettings {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    /// Persist warn+ log events to the logs database.
    pub persist_warnings: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            persist_warnings: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DatabaseSettings {
    pub fn resolve(&self, keel_home: &std::path::Path) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| keel_home.join("database").join("keel.db"))
    }
}
