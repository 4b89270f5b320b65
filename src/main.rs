//! mcp-proxy - bidirectional MCP transport bridge
//!
//! Main entry point: parses the CLI, initializes tracing, and runs one of
//! the two surface shapes (stdio-to-remote, or the HTTP front-end over
//! local stdio children). Exit codes: 0 on clean shutdown, 2 on
//! configuration errors, 1 on runtime errors.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mcp_proxy::auth::{apply_access_token_env, build_http_client, ClientCredentials};
use mcp_proxy::bridge::Bridge;
use mcp_proxy::cli::{Cli, ProxyMode, TransportKind};
use mcp_proxy::config::{NamedServerEntry, NamedServerRegistry, DEFAULT_SERVER_KEY};
use mcp_proxy::error::{is_config_error, ProxyError, Result};
use mcp_proxy::server::{serve, AppState};
use mcp_proxy::transport::sse::SseTransport;
use mcp_proxy::transport::stdio::ParentStdioTransport;
use mcp_proxy::transport::streamable::StreamableHttpTransport;
use mcp_proxy::transport::Transport;

/// How long a global shutdown waits for live bridges to drain.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(&cli);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            eprintln!("mcp-proxy: {e:#}");
            if is_config_error(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.mode() {
        ProxyMode::Client(url) => run_client(cli, url).await,
        ProxyMode::Server => run_server(cli).await,
    }
}

/// stdio-to-remote mode: the parent MCP client speaks over our stdio,
/// the remote server over SSE or Streamable HTTP.
async fn run_client(cli: Cli, url: url::Url) -> Result<()> {
    let mut headers = cli.header_map();
    apply_access_token_env(&mut headers);

    let http = build_http_client(&cli.verify_ssl_policy()?)?;
    let auth = cli
        .oauth_config()?
        .map(|config| Arc::new(ClientCredentials::new(config, http.clone())));

    let upstream: Arc<dyn Transport> = match cli.transport {
        TransportKind::Sse => {
            Arc::new(SseTransport::connect(http, url, headers, auth).await?)
        }
        TransportKind::StreamableHttp => Arc::new(StreamableHttpTransport::new(
            http,
            url,
            headers,
            auth,
            cli.stateless_flag(),
        )),
    };
    let ingress: Arc<dyn Transport> = Arc::new(ParentStdioTransport::new());

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    Bridge::new(ingress, upstream, &shutdown).run().await
}

/// HTTP server mode: SSE and Streamable HTTP ingress over local stdio
/// children.
async fn run_server(cli: Cli) -> Result<()> {
    let named_entries = match &cli.named_server_config {
        Some(path) => {
            if !cli.named_server.is_empty() {
                tracing::warn!(
                    "--named-server flags are ignored because --named-server-config is set"
                );
            }
            NamedServerRegistry::load_config_file(path)?
        }
        None => cli
            .named_server_pairs()
            .iter()
            .map(|(name, command)| NamedServerRegistry::parse_cli_entry(name, command))
            .collect::<Result<Vec<_>>>()?,
    };

    let default = cli.command_or_url.as_ref().map(|command| NamedServerEntry {
        name: DEFAULT_SERVER_KEY.to_string(),
        command: command.clone(),
        args: cli.args.clone(),
        env: cli.env_map(),
        header_to_env: std::collections::HashMap::new(),
        cwd: cli.cwd.clone(),
    });

    let registry = Arc::new(NamedServerRegistry::new(
        default,
        named_entries,
        cli.pass_environment_flag(),
    )?);
    if registry.is_empty() {
        return Err(ProxyError::Config(
            "nothing to serve: give a command, --named-server, or --named-server-config"
                .to_string(),
        )
        .into());
    }

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let state = AppState::new(
        registry,
        cli.allow_origin.clone(),
        cli.stateless_flag(),
        shutdown.clone(),
    );
    let status = Arc::clone(&state.status);

    serve(state, &cli.host, cli.port, |_| {}).await?;

    // The listener has stopped; give live bridges the drain window before
    // the process exits (their tokens are children of `shutdown`).
    let deadline = Instant::now() + SHUTDOWN_DRAIN;
    while status.total_live() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

/// Flip the global token on ctrl-c or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    });
}

/// Initialize the tracing subscriber.
///
/// The environment filter wins when set; otherwise the CLI's log level
/// applies. Logs go to stderr so server-mode stdout stays clean and
/// stdio-mode stdout stays pure MCP.
fn init_tracing(cli: &Cli) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
