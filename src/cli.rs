//! Command-line interface definition for the MCP proxy
//!
//! This module defines the CLI structure using clap's derive API. The
//! surface is flat (no subcommands): the positional argument selects the
//! mode. An absolute `http(s)://` URL puts the proxy in stdio-to-remote
//! mode; anything else (or nothing, with `--named-server*` flags) starts
//! the HTTP front-end.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use url::Url;

use crate::auth::{OAuthConfig, VerifySsl};
use crate::error::{ProxyError, Result};

/// Transport used to reach a remote MCP server in stdio-to-remote mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// SSE stream plus companion POST endpoint.
    #[value(name = "sse")]
    Sse,
    /// Streamable HTTP single endpoint.
    #[value(name = "streamablehttp")]
    StreamableHttp,
}

/// Which of the two surface shapes this invocation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMode {
    /// stdio ingress, remote HTTP upstream.
    Client(Url),
    /// HTTP ingress, local stdio children.
    Server,
}

/// mcp-proxy - bidirectional MCP transport bridge
///
/// Bridges MCP sessions between stdio, SSE, and Streamable HTTP: speak
/// stdio to a parent client and forward to a remote server, or listen on
/// an HTTP port and spawn local stdio servers per incoming session.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp-proxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Remote server URL (stdio-to-remote mode) or the default server's
    /// command (HTTP server mode)
    #[arg(value_name = "COMMAND_OR_URL")]
    pub command_or_url: Option<String>,

    /// Arguments passed to the default server's command
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Extra header sent on outbound HTTP requests (repeatable)
    #[arg(
        short = 'H',
        long = "headers",
        value_names = ["KEY", "VALUE"],
        num_args = 2,
        action = ArgAction::Append
    )]
    pub headers: Vec<String>,

    /// Transport used to reach the remote server
    #[arg(long, value_enum, default_value = "sse")]
    pub transport: TransportKind,

    /// TLS verification: `true`, `false`, or a PEM CA bundle path
    #[arg(
        long = "verify-ssl",
        value_name = "BOOL|PATH",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub verify_ssl: Option<String>,

    /// Disable TLS certificate verification
    #[arg(long = "no-verify-ssl")]
    pub no_verify_ssl: bool,

    /// OAuth2 client-credentials client id
    #[arg(long = "client-id")]
    pub client_id: Option<String>,

    /// OAuth2 client-credentials client secret
    #[arg(long = "client-secret")]
    pub client_secret: Option<String>,

    /// OAuth2 token endpoint URL
    #[arg(long = "token-url")]
    pub token_url: Option<String>,

    /// Environment variable for spawned servers (repeatable)
    #[arg(
        short = 'e',
        long = "env",
        value_names = ["KEY", "VALUE"],
        num_args = 2,
        action = ArgAction::Append
    )]
    pub env: Vec<String>,

    /// Working directory for spawned servers
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Pass the proxy's own environment through to spawned servers
    #[arg(long = "pass-environment", overrides_with = "no_pass_environment")]
    pub pass_environment: bool,

    /// Do not pass the proxy's environment through (the default)
    #[arg(long = "no-pass-environment", overrides_with = "pass_environment")]
    pub no_pass_environment: bool,

    /// Port for the HTTP front-end (0 picks an ephemeral port)
    #[arg(long, alias = "sse-port", default_value_t = 0)]
    pub port: u16,

    /// Host for the HTTP front-end
    #[arg(long, alias = "sse-host", default_value = "127.0.0.1")]
    pub host: String,

    /// Stateless Streamable HTTP: one child per POST, no session ids
    #[arg(long, overrides_with = "no_stateless")]
    pub stateless: bool,

    /// Stateful Streamable HTTP (the default)
    #[arg(long = "no-stateless", overrides_with = "stateless")]
    pub no_stateless: bool,

    /// Allowed Origin header value (repeatable); empty denies all
    /// cross-origin requests
    #[arg(long = "allow-origin", value_name = "ORIGIN", action = ArgAction::Append)]
    pub allow_origin: Vec<String>,

    /// Named server: NAME and its command string (repeatable)
    #[arg(
        long = "named-server",
        value_names = ["NAME", "CMD"],
        num_args = 2,
        action = ArgAction::Append
    )]
    pub named_server: Vec<String>,

    /// JSON configuration file for named servers; when given,
    /// --named-server flags are ignored
    #[arg(long = "named-server-config", value_name = "PATH")]
    pub named_server_config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,

    /// Shortcut for --log-level debug (wins over --log-level)
    #[arg(long, overrides_with = "no_debug")]
    pub debug: bool,

    /// Disable debug logging
    #[arg(long = "no-debug", overrides_with = "debug")]
    pub no_debug: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Mode selection: an absolute HTTP(S) URL means stdio-to-remote,
    /// anything else means HTTP server mode.
    pub fn mode(&self) -> ProxyMode {
        if let Some(raw) = &self.command_or_url {
            if let Ok(url) = Url::parse(raw) {
                if matches!(url.scheme(), "http" | "https") {
                    return ProxyMode::Client(url);
                }
            }
        }
        ProxyMode::Server
    }

    /// The `-H/--headers` pairs as a map.
    pub fn header_map(&self) -> HashMap<String, String> {
        pair_map(&self.headers)
    }

    /// The `-e/--env` pairs as a map.
    pub fn env_map(&self) -> HashMap<String, String> {
        pair_map(&self.env)
    }

    /// The `--named-server` pairs as `(name, command_string)` tuples.
    pub fn named_server_pairs(&self) -> Vec<(String, String)> {
        self.named_server
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect()
    }

    /// Resolve the TLS verification policy.
    ///
    /// # Errors
    ///
    /// Never fails today; kept fallible for symmetry with the other
    /// resolver methods so `main` handles everything uniformly.
    pub fn verify_ssl_policy(&self) -> Result<VerifySsl> {
        if self.no_verify_ssl {
            return Ok(VerifySsl::Disabled);
        }
        Ok(match self.verify_ssl.as_deref() {
            None => VerifySsl::Enabled,
            Some("true") => VerifySsl::Enabled,
            Some("false") => VerifySsl::Disabled,
            Some(path) => VerifySsl::CaBundle(PathBuf::from(path)),
        })
    }

    /// Assemble the OAuth client-credentials configuration, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] when only some of `--client-id`,
    /// `--client-secret`, `--token-url` are given, or the token URL does
    /// not parse.
    pub fn oauth_config(&self) -> Result<Option<OAuthConfig>> {
        match (&self.client_id, &self.client_secret, &self.token_url) {
            (None, None, None) => Ok(None),
            (Some(client_id), Some(client_secret), Some(token_url)) => {
                let token_url = Url::parse(token_url).map_err(|e| {
                    ProxyError::Config(format!("invalid --token-url `{token_url}`: {e}"))
                })?;
                Ok(Some(OAuthConfig {
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                    token_url,
                }))
            }
            _ => Err(ProxyError::Config(
                "--client-id, --client-secret, and --token-url must be given together".to_string(),
            )
            .into()),
        }
    }

    /// Whether spawned children inherit the proxy's environment.
    pub fn pass_environment_flag(&self) -> bool {
        self.pass_environment && !self.no_pass_environment
    }

    /// Whether Streamable HTTP ingress runs stateless.
    pub fn stateless_flag(&self) -> bool {
        self.stateless && !self.no_stateless
    }

    /// The effective tracing filter directive.
    pub fn log_filter(&self) -> String {
        if self.debug && !self.no_debug {
            "debug".to_string()
        } else {
            self.log_level.clone()
        }
    }
}

/// Fold clap's flattened KEY VALUE repetitions into a map.
fn pair_map(pairs: &[String]) -> HashMap<String, String> {
    pairs
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}
