use crate::error::Result;
use crate::io;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default file name looked up by the CLI when no path is given.
pub const CONFIG_FILE: &str = "tenantry.yaml";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// OrchestratorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Upper bound for every step execution and compensation. Unset or 0
    /// means steps run unbounded on the caller's thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
    /// How long an operation that overran its timeout is still waited for
    /// before the run moves on without it. The tenant stays leased until the
    /// operation finishes either way.
    #[serde(default = "default_step_grace")]
    pub step_grace_secs: u64,
    /// Location of the durable saga log. Unset disables the log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saga_log: Option<PathBuf>,
    /// A run with no log entry for this long is considered abandoned at startup.
    #[serde(default = "default_recovery_max_age")]
    pub recovery_max_age_secs: u64,
}

fn default_recovery_max_age() -> u64 {
    300
}

fn default_step_grace() -> u64 {
    30
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: None,
            step_grace_secs: default_step_grace(),
            saga_log: None,
            recovery_max_age_secs: default_recovery_max_age(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        let cfg: OrchestratorConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        io::atomic_write(path, data.as_bytes())
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn step_grace(&self) -> Duration {
        Duration::from_secs(self.step_grace_secs)
    }

    pub fn recovery_max_age(&self) -> Duration {
        Duration::from_secs(self.recovery_max_age_secs)
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.step_timeout_secs == Some(0) {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "step_timeout_secs is 0; steps will run without a timeout".to_string(),
            });
        } else if self.step_timeout_secs.is_some() && self.step_grace_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "step_grace_secs is 0; a step that overruns its timeout is left uncompensated".to_string(),
            });
        }

        match &self.saga_log {
            Some(path) if path.as_os_str().is_empty() => {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: "saga_log is set but empty".to_string(),
                });
            }
            Some(path) if path.is_relative() => {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "saga_log '{}' is relative and resolves against the working directory",
                        path.display()
                    ),
                });
            }
            Some(_) => {}
            None => {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: "saga_log is not set; interrupted runs cannot be recovered after a restart"
                        .to_string(),
                });
            }
        }

        if self.recovery_max_age_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "recovery_max_age_secs is 0; runs still executing in another process may be compensated at startup".to_string(),
            });
        } else if let Some(timeout) = self.step_timeout_secs.filter(|t| *t > 0) {
            if self.recovery_max_age_secs < timeout {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "recovery_max_age_secs ({}) is shorter than step_timeout_secs ({timeout})",
                        self.recovery_max_age_secs
                    ),
                });
            }
        }

        warnings
    }
}
