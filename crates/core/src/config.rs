use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sandbox: SandboxSettings,
    pub workspace: WorkspaceSettings,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3400,
            enable_cors: false,
        }
    }
}

/// Container settings for per-session sandboxes.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxSettings {
    pub image: String,
    pub workdir: String,
    pub user: Option<String>,
    pub memory_limit_bytes: i64,
    pub cpu_quota: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub stop_grace_secs: u64,
    pub idle_timeout_secs: u64,
    pub reap_interval_secs: u64,
    /// How long to keep polling exec inspect for an exit code once output has drained.
    pub exit_settle_ms: u64,
    pub labels: HashMap<String, String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            image: "agent-sandbox:latest".into(),
            workdir: "/workspace".into(),
            user: Some("agent".into()),
            memory_limit_bytes: 512 * 1024 * 1024, // 512MB
            cpu_quota: 100_000,                    // 1 CPU core
            pids_limit: 256,
            network_mode: "none".into(),
            stop_grace_secs: 5,
            idle_timeout_secs: 30 * 60,
            reap_interval_secs: 60,
            exit_settle_ms: 2_000,
            labels: HashMap::from([("managed-by".into(), "agent-sandbox".into())]),
        }
    }
}

impl SandboxSettings {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn exit_settle(&self) -> Duration {
        Duration::from_millis(self.exit_settle_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkspaceSettings {
    /// Parent directory for ephemeral workspaces. Defaults to the system temp dir.
    pub base_dir: Option<PathBuf>,
    pub prefix: String,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            base_dir: None,
            prefix: "agent-ws".into(),
        }
    }
}

impl WorkspaceSettings {
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_filter: String,
    pub json_logs: bool,
    pub metrics_enabled: bool,
    pub service_name: String,
    /// Append audit events to this hash-chained JSONL file.
    pub audit_log: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,agent_sandbox=debug".into(),
            json_logs: false,
            metrics_enabled: true,
            service_name: "agent-sandboxd".into(),
            audit_log: None,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("AGENT_SANDBOX_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__SANDBOX__IMAGE=python:3.12 to sandbox.image
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
