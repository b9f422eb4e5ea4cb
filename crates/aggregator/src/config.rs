//! Configuration parsing and validation.
//!
//! The config file is YAML by default (JSON when the extension is `.json`) and holds an
//! ordered `mcpServers` map plus an optional `gateway` section. The order of `mcpServers`
//! is the backend registration order, which decides unqualified name lookups.

use crate::error::{AggregatorError, Result};
use clap::Parser;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// CLI Arguments
// ============================================================================

/// CLI arguments for the aggregator.
#[derive(Parser, Debug, Clone)]
#[command(name = "unrelated-mcp-aggregator")]
#[command(
    version,
    about = "Aggregate stdio MCP servers behind one SSE and streamable HTTP endpoint"
)]
pub struct CliArgs {
    /// Path to the YAML or JSON config file listing backend servers.
    #[arg(short = 'c', long = "config", env = "UNRELATED_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the fully resolved configuration (after env expansion + overrides) and exit.
    #[arg(long = "print-effective-config")]
    pub print_effective_config: bool,

    /// HTTP bind address (ip:port)
    #[arg(short = 'b', long, env = "UNRELATED_BIND")]
    pub bind: Option<String>,

    /// Log level. Supports tracing filter syntax.
    #[arg(short = 'l', long = "log-level", env = "UNRELATED_LOG")]
    pub log_level: Option<String>,

    /// Max time to wait for each backend handshake on startup (seconds)
    #[arg(long, env = "UNRELATED_STARTUP_TIMEOUT")]
    pub startup_timeout: Option<u64>,

    /// Close streamable HTTP sessions idle for this long (seconds, 0 disables)
    #[arg(long, env = "UNRELATED_SESSION_IDLE_TIMEOUT")]
    pub session_idle_timeout: Option<u64>,
}

// ============================================================================
// Config File
// ============================================================================

const DEFAULT_BIND: &str = "127.0.0.1:3000";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default, alias = "servers")]
    mcp_servers: IndexMap<String, ServerConfig>,
    #[serde(default)]
    gateway: GatewaySection,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GatewaySection {
    bind: Option<String>,
    log_level: Option<String>,
    startup_timeout: Option<u64>,
    session_idle_timeout: Option<u64>,
}

/// One `mcpServers` entry, as written in the file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
}

/// A named backend: everything needed to launch it.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackendDescriptor {
    pub name: String,
    pub command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
}

/// Effective gateway settings (after merging defaults + config + env + CLI).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySettings {
    pub bind: String,
    pub log_level: String,
    pub startup_timeout: u64,
    pub session_idle_timeout: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            startup_timeout: crate::timeouts::DEFAULT_STARTUP_TIMEOUT_SECS,
            session_idle_timeout: crate::timeouts::DEFAULT_SESSION_IDLE_TIMEOUT_SECS,
        }
    }
}

impl GatewaySettings {
    pub fn startup_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    /// `None` when idle expiry is disabled.
    pub fn session_idle_timeout_duration(&self) -> Option<Duration> {
        (self.session_idle_timeout > 0).then(|| Duration::from_secs(self.session_idle_timeout))
    }
}

/// Merged configuration from all sources.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub cli: CliArgs,
    pub settings: GatewaySettings,
    pub servers: Vec<BackendDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub gateway: GatewaySettings,
    pub mcp_servers: IndexMap<String, ServerConfig>,
}

impl GatewayConfig {
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            gateway: self.settings.clone(),
            mcp_servers: self
                .servers
                .iter()
                .map(|d| {
                    (
                        d.name.clone(),
                        ServerConfig {
                            command: d.command.clone(),
                            args: d.args.clone(),
                            env: d.env.clone(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Load and merge configuration from CLI args, env, and the config file.
    pub fn load(cli: CliArgs) -> Result<Self> {
        let Some(path) = cli.config.clone() else {
            return Err(AggregatorError::Config(
                "No configuration provided. Use --config or UNRELATED_CONFIG".to_string(),
            ));
        };
        let file = load_config_file(&path)?;

        let mut settings = GatewaySettings::default();
        apply_gateway_section(&mut settings, file.gateway)?;
        apply_cli_overrides(&mut settings, &cli)?;

        if settings.startup_timeout == 0 {
            return Err(AggregatorError::Config(
                "startupTimeout must be > 0".to_string(),
            ));
        }

        let servers = build_descriptors(file.mcp_servers)?;
        Ok(Self {
            cli,
            settings,
            servers,
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| AggregatorError::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    if content.trim().is_empty() {
        return Err(AggregatorError::Config(format!(
            "{} is empty",
            path.display()
        )));
    }

    // YAML by default; JSON when extension is .json
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)
            .map_err(|e| AggregatorError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| AggregatorError::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}

fn apply_gateway_section(settings: &mut GatewaySettings, section: GatewaySection) -> Result<()> {
    if let Some(bind) = section.bind {
        settings.bind = expand_env_string(&bind)?;
    }
    if let Some(level) = section.log_level {
        settings.log_level = expand_env_string(&level)?;
    }
    if let Some(v) = section.startup_timeout {
        settings.startup_timeout = v;
    }
    if let Some(v) = section.session_idle_timeout {
        settings.session_idle_timeout = v;
    }
    Ok(())
}

fn apply_cli_overrides(settings: &mut GatewaySettings, cli: &CliArgs) -> Result<()> {
    if let Some(bind) = &cli.bind {
        settings.bind = expand_env_string(bind)?;
    }

    // Precedence for log level:
    // CLI flag (--log-level) / UNRELATED_LOG env (via clap) > RUST_LOG env > config file > defaults
    if let Some(level) = &cli.log_level {
        settings.log_level.clone_from(level);
    } else if let Ok(level) = std::env::var("RUST_LOG") {
        settings.log_level = level;
    }

    if let Some(v) = cli.startup_timeout {
        settings.startup_timeout = v;
    }
    if let Some(v) = cli.session_idle_timeout {
        settings.session_idle_timeout = v;
    }
    Ok(())
}

/// Validate and expand the server map into descriptors, keeping file order.
fn build_descriptors(servers: IndexMap<String, ServerConfig>) -> Result<Vec<BackendDescriptor>> {
    if servers.is_empty() {
        return Err(AggregatorError::Config(
            "No backend servers configured (mcpServers is empty)".to_string(),
        ));
    }

    servers
        .into_iter()
        .map(|(name, server)| {
            if name.trim().is_empty() {
                return Err(AggregatorError::Config(
                    "Server names must not be empty".to_string(),
                ));
            }
            if name == crate::session::MERGED_SCOPE {
                return Err(AggregatorError::Config(format!(
                    "Server name '{name}' is reserved for the merged scope"
                )));
            }
            if name.contains(crate::aggregator::QUALIFIER_SEPARATOR) {
                return Err(AggregatorError::Config(format!(
                    "Server name '{name}' must not contain '{}'",
                    crate::aggregator::QUALIFIER_SEPARATOR
                )));
            }
            let server = expand_server_env_vars(server)?;
            if server.command.trim().is_empty() {
                return Err(AggregatorError::Config(format!(
                    "Server '{name}' has an empty command"
                )));
            }
            Ok(BackendDescriptor {
                name,
                command: server.command,
                args: server.args,
                env: server.env,
            })
        })
        .collect()
}

/// Expand ${VAR} patterns in a server entry.
fn expand_server_env_vars(mut config: ServerConfig) -> Result<ServerConfig> {
    config.command = expand_env_string(&config.command)?;
    config.args = config
        .args
        .into_iter()
        .map(|arg| expand_env_string(&arg))
        .collect::<Result<Vec<_>>>()?;
    config.env = config
        .env
        .into_iter()
        .map(|(k, v)| Ok((k, expand_env_string(&v)?)))
        .collect::<Result<IndexMap<_, _>>>()?;
    Ok(config)
}

/// Expand ${VAR} patterns in a string from the process environment.
pub fn expand_env_string(s: &str) -> Result<String> {
    expand_env_with(s, |name| std::env::var(name).ok())
}

/// Expand ${VAR} patterns using `lookup`. Unterminated `${` is left as is.
pub fn expand_env_with<F>(s: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = s.to_string();
    let mut start = 0usize;

    while let Some(dollar_pos) = result[start..].find("${") {
        let abs_pos = start + dollar_pos;
        if let Some(end_pos) = result[abs_pos..].find('}') {
            let var_name = &result[abs_pos + 2..abs_pos + end_pos];
            let var_value = lookup(var_name).ok_or_else(|| {
                AggregatorError::Config(format!(
                    "Environment variable '{var_name}' not found (referenced in config)"
                ))
            })?;
            result = format!(
                "{}{}{}",
                &result[..abs_pos],
                var_value,
                &result[abs_pos + end_pos + 1..]
            );
            start = abs_pos + var_value.len();
        } else {
            start = abs_pos + 2;
        }
    }

    Ok(result)
}

// ============================================================================
// Tests
// ============================================================================
