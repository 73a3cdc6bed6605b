mod adapters;
mod gateway;
mod llm;
mod logs;
mod memory;
mod permissions;
mod prompts;
mod scheduler;
mod sessions;
mod skills;
mod supervisor;
mod tasks;
mod tools;
mod workers;

pub use adapters::*;
pub use gateway::*;
pub use llm::*;
pub use logs::*;
pub use memory::*;
pub use permissions::*;
pub use prompts::*;
pub use scheduler::*;
pub use sessions::*;
pub use skills::*;
pub use supervisor::*;
pub use tasks::*;
pub use tools::*;
pub use workers::*;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single configuration document. Secrets never live here — API keys
/// and bot tokens are read from the environment variables named below.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub logs: LogsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub prompts: PromptsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Data directory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root for the event log, snapshots, and adapter cursors.
    #[serde(default = "d_data_dir")]
    pub dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { dir: d_data_dir() }
    }
}

fn d_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.gateway.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "gateway.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.gateway.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "gateway.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if self.sessions.queue_soft_cap == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "sessions.queue_soft_cap".into(),
                message: "queue soft cap must be at least 1".into(),
            });
        }
        if self.memory.importance_min > 10 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "memory.importance_min".into(),
                message: "importance_min is on a 1-10 scale".into(),
            });
        }
        if self.scheduler.timezone.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "scheduler.timezone".into(),
                message: "timezone must be an IANA name, e.g. \"Europe/Paris\"".into(),
            });
        }
        if self.workers.max_depth == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "workers.max_depth".into(),
                message: "delegation is disabled (max_depth = 0)".into(),
            });
        }
        for (i, rule) in self
            .permissions
            .allow
            .iter()
            .chain(self.permissions.ask.iter())
            .chain(self.permissions.deny.iter())
            .enumerate()
        {
            if rule.capability().is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("permissions[{i}]"),
                    message: "rule capability must not be empty".into(),
                });
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        let errors: Vec<_> = cfg
            .validate()
            .into_iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert!(errors.is_empty(), "default config has errors: {errors:?}");
    }

    #[test]
    fn empty_toml_parses_to_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.gateway.port, 3336);
        assert_eq!(cfg.memory.importance_min, 6);
        assert_eq!(cfg.sessions.queue_soft_cap, 8);
        assert_eq!(cfg.workers.max_depth, 2);
    }

    #[test]
    fn partial_toml_overrides() {
        let raw = r#"
            [gateway]
            port = 4000

            [memory.embeddings]
            batch_size = 4

            [[permissions.ask]]
            capability = "shell.run"
            args_regex = "^git "
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.gateway.port, 4000);
        assert_eq!(cfg.memory.embeddings.batch_size, 4);
        assert_eq!(cfg.permissions.ask.len(), 1);
        assert_eq!(cfg.permissions.ask[0].capability(), "shell.run");
    }

    #[test]
    fn zero_port_is_rejected() {
        let cfg: Config = toml::from_str("[gateway]\nport = 0").unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "gateway.port"));
    }

    #[test]
    fn permission_rules_accept_bare_strings() {
        let raw = r#"
            [permissions]
            allow = ["filesystem.read", "filesystem.list"]
            ask = ["shell.run", "web.*"]
        "#;
        let cfg: Config = toml::from_str(raw).unwrap();
        assert_eq!(cfg.permissions.allow.len(), 2);
        assert_eq!(cfg.permissions.ask[1].capability(), "web.*");
    }
}
