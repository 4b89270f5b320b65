//! Named-server configuration and registry
//!
//! This module handles loading, parsing, and validating the named MCP
//! server definitions that back the HTTP front-end: the JSON configuration
//! file (`--named-server-config`), inline CLI entries (`--named-server`),
//! and the optional default (unnamed) server built from the positional
//! command. The resulting [`NamedServerRegistry`] is built once at startup
//! and never mutated afterwards, so the front-end reads it without
//! locking.
//!
//! # Configuration file schema
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "fetch": {
//!       "command": "uvx",
//!       "args": ["mcp-server-fetch"],
//!       "env": {"UV_NO_CACHE": "1"},
//!       "enabled": true,
//!       "headerToEnv": {"Authorization": "AUTH_HEADER"}
//!     }
//!   }
//! }
//! ```
//!
//! Unknown per-server fields (`timeout`, `transportType`, ...) are accepted
//! and ignored. A missing `command` fails startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use crate::error::{ProxyError, Result};

/// Key under which the default (unnamed) server is reported in `/status`.
pub const DEFAULT_SERVER_KEY: &str = "default";

/// Pattern a named server's URL-path segment must match.
fn name_pattern() -> &'static Regex {
    static NAME_PATTERN: OnceLock<Regex> = OnceLock::new();
    NAME_PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._-]+$").unwrap_or_else(|e| panic!("invalid name pattern: {e}"))
    })
}

/// One server definition as it appears in the configuration file.
///
/// Deliberately tolerant: unknown fields are ignored so configuration
/// files written for other MCP launchers keep working.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamedServerFileEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    header_to_env: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

/// Top-level configuration file shape.
#[derive(Debug, Deserialize)]
struct NamedServerFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: HashMap<String, NamedServerFileEntry>,
}

/// An immutable, validated server entry.
#[derive(Debug, Clone)]
pub struct NamedServerEntry {
    /// URL-path segment (or [`DEFAULT_SERVER_KEY`] for the default server).
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Static environment entries.
    pub env: HashMap<String, String>,
    /// HTTP header name -> environment variable name, applied per request.
    pub header_to_env: HashMap<String, String>,
    /// Optional working directory for the child.
    pub cwd: Option<PathBuf>,
}

impl NamedServerEntry {
    /// Materialize the per-request spawn descriptor.
    ///
    /// Environment composition, lowest to highest precedence: the parent
    /// process environment (only when `pass_environment`), the entry's
    /// static `env`, then the header-derived values. Header injection
    /// always wins so a request-supplied token cannot be shadowed by an
    /// inherited variable.
    ///
    /// `PATH` is inherited from the parent when nothing else sets it;
    /// the child's environment is otherwise built from scratch, and a
    /// bare `command` could not be resolved without it.
    pub fn spawn_descriptor(
        &self,
        header_env: &HashMap<String, String>,
        pass_environment: bool,
    ) -> SpawnDescriptor {
        let mut env: HashMap<String, String> = if pass_environment {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };
        env.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.extend(header_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !env.contains_key("PATH") {
            if let Ok(path) = std::env::var("PATH") {
                env.insert("PATH".to_string(), path);
            }
        }

        SpawnDescriptor {
            program: self.command.clone(),
            args: self.args.clone(),
            env,
            cwd: self.cwd.clone(),
        }
    }
}

/// A fully composed child-process launch request.
#[derive(Debug, Clone)]
pub struct SpawnDescriptor {
    /// Executable path or name.
    pub program: String,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// The child's entire environment (the parent environment is cleared
    /// before this is applied).
    pub env: HashMap<String, String>,
    /// Optional working directory.
    pub cwd: Option<PathBuf>,
}

/// Process-wide map from server name to entry. Built once, immutable.
#[derive(Debug)]
pub struct NamedServerRegistry {
    default: Option<NamedServerEntry>,
    named: HashMap<String, NamedServerEntry>,
    pass_environment: bool,
}

impl NamedServerRegistry {
    /// Assemble and validate the registry.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] for an invalid name or a duplicate
    /// entry.
    pub fn new(
        default: Option<NamedServerEntry>,
        named_entries: Vec<NamedServerEntry>,
        pass_environment: bool,
    ) -> Result<Self> {
        let mut named = HashMap::new();
        for entry in named_entries {
            validate_name(&entry.name)?;
            let name = entry.name.clone();
            if named.insert(name.clone(), entry).is_some() {
                return Err(ProxyError::Config(format!("duplicate named server `{name}`")).into());
            }
        }
        Ok(Self {
            default,
            named,
            pass_environment,
        })
    }

    /// Load named entries from the JSON configuration file. Entries with
    /// `enabled: false` are dropped here.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] when the file cannot be read, is not
    /// valid JSON, or an entry is missing `command`.
    pub fn load_config_file(path: &Path) -> Result<Vec<NamedServerEntry>> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let file: NamedServerFile = serde_json::from_str(&raw).map_err(|e| {
            ProxyError::Config(format!("invalid named-server config {}: {e}", path.display()))
        })?;

        let mut entries: Vec<NamedServerEntry> = file
            .mcp_servers
            .into_iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(name, cfg)| NamedServerEntry {
                name,
                command: cfg.command,
                args: cfg.args,
                env: cfg.env,
                header_to_env: cfg.header_to_env,
                cwd: cfg.cwd,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Parse one `--named-server NAME CMDSTRING` pair. The command string
    /// is split on ASCII whitespace; commands that need quoting belong in
    /// the configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] for an empty command string.
    pub fn parse_cli_entry(name: &str, command_string: &str) -> Result<NamedServerEntry> {
        let mut parts = command_string.split_whitespace().map(String::from);
        let command = parts.next().ok_or_else(|| {
            ProxyError::Config(format!("named server `{name}` has an empty command"))
        })?;
        Ok(NamedServerEntry {
            name: name.to_string(),
            command,
            args: parts.collect(),
            env: HashMap::new(),
            header_to_env: HashMap::new(),
            cwd: None,
        })
    }

    /// Look up an enabled named entry.
    pub fn get(&self, name: &str) -> Option<&NamedServerEntry> {
        self.named.get(name)
    }

    /// The default (unnamed) server, when configured.
    pub fn default_server(&self) -> Option<&NamedServerEntry> {
        self.default.as_ref()
    }

    /// Whether children inherit the parent environment.
    pub fn pass_environment(&self) -> bool {
        self.pass_environment
    }

    /// All status-reportable entry names (default first when present).
    pub fn status_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.default.is_some() {
            names.push(DEFAULT_SERVER_KEY.to_string());
        }
        let mut named: Vec<String> = self.named.keys().cloned().collect();
        named.sort();
        names.extend(named);
        names
    }

    /// `true` when neither a default nor any named server is configured.
    pub fn is_empty(&self) -> bool {
        self.default.is_none() && self.named.is_empty()
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(ProxyError::Config(format!(
            "invalid server name `{name}`: must match ^[A-Za-z0-9._-]+$"
        ))
        .into())
    }
}
