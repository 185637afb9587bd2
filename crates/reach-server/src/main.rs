//! Reach server binary: opens the SQLite store, serves the OpenClaw control
//! plane, and optionally runs the push dispatcher against a browser relay.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reach_ai::{OpenAiClient, OpenAiConfig};
use reach_dispatch::{Dispatcher, DispatcherConfig, HttpRelayAgent};
use reach_engagement::{EngagementService, ReplyClassifier};
use reach_openclaw::{run_openclaw_server, ApiKeyRegistry, OpenClawState};
use reach_store::{OutreachStore, SqliteOutreachStore};

/// Outbound relay requests share one bounded timeout.
const RELAY_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Parser)]
#[command(
    name = "reach-server",
    about = "Outreach orchestration engine: missions, quota-gated dispatch, engagement loop",
    version
)]
struct Cli {
    /// SQLite database path.
    #[arg(long, env = "REACH_DB", default_value = "reach.db")]
    db: PathBuf,

    /// Address the control plane listens on.
    #[arg(long, env = "REACH_LISTEN", default_value = "127.0.0.1:8787")]
    listen: String,

    /// TOML file listing control-plane API keys.
    #[arg(long, env = "REACH_KEYS")]
    keys: PathBuf,

    /// Secret signing control-plane bearer tokens.
    #[arg(long, env = "REACH_TOKEN_SECRET")]
    token_secret: String,

    /// Secret signing tracking links and unsubscribe payloads.
    #[arg(long, env = "REACH_TRACKING_SECRET")]
    tracking_secret: String,

    /// Secret trusted internal callers present for quota reads. Empty
    /// disables those reads.
    #[arg(long, env = "REACH_INTERNAL_SECRET", default_value = "")]
    internal_secret: String,

    /// Push-mode relay endpoint. Absent means relays pull work over the
    /// agent endpoints instead.
    #[arg(long, env = "REACH_RELAY_URL")]
    relay_url: Option<String>,

    /// Seconds between dispatcher cycles.
    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,

    /// Per-provider batch cap for one dispatch cycle.
    #[arg(long, default_value_t = 5)]
    batch_size: usize,

    /// Age in seconds at which a processing task counts as abandoned.
    #[arg(long, default_value_t = 900)]
    stale_after_secs: u64,

    /// API key enabling the model-backed reply classifier.
    #[arg(long, env = "OPENAI_API_KEY")]
    openai_api_key: Option<String>,

    /// Chat model used for reply classification.
    #[arg(long, default_value = "gpt-4o-mini")]
    openai_model: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let store = SqliteOutreachStore::new(&cli.db)
        .with_context(|| format!("open outreach store at {}", cli.db.display()))?;
    let store: Arc<dyn OutreachStore> = Arc::new(store);
    info!(db = %cli.db.display(), "outreach store ready");

    let registry = ApiKeyRegistry::load(&cli.keys)
        .with_context(|| format!("load api key file {}", cli.keys.display()))?;
    info!(keys = registry.keys.len(), "api key registry loaded");

    let classifier = match cli
        .openai_api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
    {
        Some(api_key) => {
            let client = OpenAiClient::new(OpenAiConfig {
                api_key: api_key.to_string(),
                ..OpenAiConfig::default()
            })
            .context("construct classifier client")?;
            info!(model = %cli.openai_model, "reply classifier backed by chat model");
            ReplyClassifier::with_client(Arc::new(client), cli.openai_model.clone())
        }
        None => {
            info!("reply classifier running heuristic-only");
            ReplyClassifier::heuristic_only()
        }
    };

    let engagement = EngagementService::new(
        Arc::clone(&store),
        classifier,
        cli.tracking_secret.clone(),
    );
    let state = Arc::new(OpenClawState::new(
        Arc::clone(&store),
        engagement,
        registry,
        cli.token_secret.clone(),
        cli.internal_secret.clone(),
    ));

    if let Some(relay_url) = cli
        .relay_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
    {
        let agent = HttpRelayAgent::new(relay_url, RELAY_TIMEOUT_MS)
            .context("construct relay agent")?;
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(agent),
            DispatcherConfig {
                batch_size: cli.batch_size.max(1),
                poll_interval: Duration::from_secs(cli.poll_interval_secs.max(1)),
                stale_after: Duration::from_secs(cli.stale_after_secs.max(1)),
                ..DispatcherConfig::default()
            },
        );
        info!(relay_url, "push dispatcher enabled");
        tokio::spawn(async move {
            if let Err(error) = dispatcher.run().await {
                warn!(error = %error, "dispatcher loop stopped");
            }
        });
    } else {
        info!("no relay url configured, relays pull over the agent endpoints");
    }

    run_openclaw_server(&cli.listen, state).await
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;

    use super::Cli;

    const REQUIRED_ARGS: [&str; 7] = [
        "reach-server",
        "--keys",
        "keys.toml",
        "--token-secret",
        "ts",
        "--tracking-secret",
        "gs",
    ];

    #[test]
    fn unit_cli_defaults_are_stable() {
        let cli = Cli::parse_from(REQUIRED_ARGS);
        assert_eq!(cli.db, PathBuf::from("reach.db"));
        assert_eq!(cli.listen, "127.0.0.1:8787");
        assert_eq!(cli.keys, PathBuf::from("keys.toml"));
        assert!(cli.internal_secret.is_empty());
        assert!(cli.relay_url.is_none());
        assert_eq!(cli.poll_interval_secs, 30);
        assert_eq!(cli.batch_size, 5);
        assert_eq!(cli.stale_after_secs, 900);
        assert!(cli.openai_api_key.is_none());
        assert_eq!(cli.openai_model, "gpt-4o-mini");
    }

    #[test]
    fn functional_cli_flags_accept_overrides() {
        let cli = Cli::parse_from([
            "reach-server",
            "--db",
            "/tmp/reach.db",
            "--listen",
            "0.0.0.0:9000",
            "--keys",
            "/etc/reach/keys.toml",
            "--token-secret",
            "ts",
            "--tracking-secret",
            "gs",
            "--internal-secret",
            "is",
            "--relay-url",
            "http://127.0.0.1:4848/execute",
            "--poll-interval-secs",
            "5",
            "--batch-size",
            "10",
            "--stale-after-secs",
            "300",
            "--openai-api-key",
            "sk-test",
            "--openai-model",
            "gpt-4o",
        ]);
        assert_eq!(cli.db, PathBuf::from("/tmp/reach.db"));
        assert_eq!(cli.listen, "0.0.0.0:9000");
        assert_eq!(cli.internal_secret, "is");
        assert_eq!(
            cli.relay_url.as_deref(),
            Some("http://127.0.0.1:4848/execute")
        );
        assert_eq!(cli.poll_interval_secs, 5);
        assert_eq!(cli.batch_size, 10);
        assert_eq!(cli.stale_after_secs, 300);
        assert_eq!(cli.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(cli.openai_model, "gpt-4o");
    }

    #[test]
    fn regression_cli_requires_key_file_and_secrets() {
        assert!(Cli::try_parse_from(["reach-server"]).is_err());
        assert!(Cli::try_parse_from(["reach-server", "--keys", "keys.toml"]).is_err());
    }
}
