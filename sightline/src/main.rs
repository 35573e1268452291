//! sightline - command-line front end for the telemetry client
//!
//! Commands:
//! - Show the effective configuration, identity and opt-out state
//! - Track a single event and wait for its delivery
//! - Opt out of / back into tracking
//! - Reset the persisted identity
//!
//! Uses XDG Base Directory specification for file locations:
//! - Identity storage: $XDG_DATA_HOME/sightline/ (~/.local/share/sightline/)
//! - Config: $XDG_CONFIG_HOME/sightline/config.toml (~/.config/sightline/config.toml)
//! - Logs: $XDG_STATE_HOME/sightline/ (~/.local/state/sightline/)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use sightline_core::identity::SessionPolicy;
use sightline_core::privacy::PrivacyPolicy;
use sightline_core::{
    Config, HostStorage, IdentityStore, PrivacyGate, PrivacyState, StaticHost, Tracker,
    TrackerConfig, TrackerEnv,
};

/// Page the CLI reports events from unless `--url` says otherwise
const DEFAULT_PAGE_URL: &str = "https://cli.sightline.local/";

#[derive(Parser)]
#[command(name = "sightline")]
#[command(about = "Inspect and drive the sightline telemetry client")]
#[command(version)]
struct Args {
    /// Write logs to the state directory
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, identity and opt-out state
    Status,

    /// Track one event and wait for it to be delivered
    Track {
        /// Event name
        name: String,

        /// Event property as key=value (value parsed as JSON when possible)
        #[arg(short = 'p', long = "prop", value_parser = parse_property)]
        properties: Vec<(String, Value)>,

        /// Page URL the event is attributed to
        #[arg(long, default_value = DEFAULT_PAGE_URL)]
        url: String,

        /// Seconds to wait for delivery
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },

    /// Stop all tracking for this profile
    OptOut,

    /// Resume tracking after an opt-out
    OptIn,

    /// Forget the anonymous and session ids and mint new ones
    Reset,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard = if args.verbose {
        Some(sightline_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Track {
            name,
            properties,
            url,
            timeout,
        } => cmd_track(&config, &name, properties, &url, Duration::from_secs(timeout)),
        Command::OptOut => cmd_opt_out(&config),
        Command::OptIn => cmd_opt_in(&config),
        Command::Reset => cmd_reset(&config),
    }
}

fn open_storage() -> Result<HostStorage> {
    let dir = Config::data_dir();
    HostStorage::in_dir(&dir)
        .with_context(|| format!("failed to open identity storage in {}", dir.display()))
}

fn privacy_gate(config: &TrackerConfig, storage: &HostStorage) -> Result<PrivacyGate> {
    let host = Arc::new(StaticHost::parse(DEFAULT_PAGE_URL)?);
    Ok(PrivacyGate::new(
        Arc::clone(&storage.local),
        host,
        PrivacyPolicy::from_config(config),
    ))
}

fn identity_store(config: &TrackerConfig, storage: &HostStorage) -> IdentityStore {
    IdentityStore::new(
        Arc::clone(&storage.local),
        Arc::clone(&storage.session),
        SessionPolicy {
            idle_timeout: config.session_timeout_duration(),
        },
    )
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn cmd_status(config: &Config) -> Result<()> {
    let tracker = config.tracker.clone().normalized();
    let storage = open_storage()?;
    let gate = privacy_gate(&tracker, &storage)?;
    let identity = identity_store(&tracker, &storage);

    println!("Sightline Client Status");
    println!("=======================");
    println!();
    println!("Config file:     {}", Config::config_path().display());
    println!("Storage:         {}", Config::data_dir().display());
    println!(
        "Client ID:       {}",
        tracker.resolve_client_id().as_deref().unwrap_or("<not set>")
    );
    println!("Collector:       {}", tracker.api_url);
    println!(
        "Batching:        {} (size {}, timeout {}ms)",
        yes_no(tracker.enable_batching),
        tracker.batch_size,
        tracker.batch_timeout
    );
    println!(
        "Retries:         {} (max {}, initial delay {}ms)",
        yes_no(tracker.enable_retries),
        tracker.max_retries,
        tracker.initial_retry_delay
    );
    println!();
    println!("Opted out:       {}", yes_no(gate.is_opted_out()));
    println!(
        "Anonymous ID:    {}",
        identity.anonymous_id().as_deref().unwrap_or("<none>")
    );

    match identity.session() {
        Some(session) => {
            let expired = identity.policy().is_expired(&session, now_ms());
            println!(
                "Session ID:      {}{}",
                session.id,
                if expired { " (expired)" } else { "" }
            );
        }
        None => println!("Session ID:      <none>"),
    }

    Ok(())
}

fn cmd_track(
    config: &Config,
    name: &str,
    properties: Vec<(String, Value)>,
    url: &str,
    timeout: Duration,
) -> Result<()> {
    let tracker_config = TrackerConfig {
        track_screen_views: false,
        ..config.tracker.clone()
    };
    if tracker_config.resolve_client_id().is_none() {
        bail!(
            "no clientId configured: set [tracker] clientId in {} or {}",
            Config::config_path().display(),
            sightline_core::config::CLIENT_ID_ENV
        );
    }

    let host = Arc::new(StaticHost::parse(url)?);
    let storage = open_storage()?;
    let properties: Map<String, Value> = properties.into_iter().collect();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(track_and_wait(tracker_config, host, storage, name, properties, timeout))
}

async fn track_and_wait(
    config: TrackerConfig,
    host: Arc<StaticHost>,
    storage: HostStorage,
    name: &str,
    properties: Map<String, Value>,
    timeout: Duration,
) -> Result<()> {
    let env = TrackerEnv::production(&config, host, storage)?;
    let tracker = Tracker::init(config, env);

    match tracker.privacy_state() {
        Some(PrivacyState::Allowed) => {}
        Some(state) => {
            println!("Tracking suppressed ({:?}); nothing sent", state);
            return Ok(());
        }
        None => bail!("tracker failed to start"),
    }

    tracker.track(name, Value::Object(properties));
    if tracker.shutdown(timeout).await {
        tracing::info!(event = name, "delivery finished");
        println!("Tracked {:?}", name);
    } else {
        println!("Tracked {:?}; delivery still pending after {:?}", name, timeout);
    }
    Ok(())
}

fn cmd_opt_out(config: &Config) -> Result<()> {
    let storage = open_storage()?;
    privacy_gate(&config.tracker, &storage)?.opt_out();
    println!("Opted out of tracking");
    Ok(())
}

fn cmd_opt_in(config: &Config) -> Result<()> {
    let storage = open_storage()?;
    privacy_gate(&config.tracker, &storage)?.opt_in();
    println!("Opted in to tracking");
    Ok(())
}

fn cmd_reset(config: &Config) -> Result<()> {
    let storage = open_storage()?;
    let (anonymous_id, session_id) = identity_store(&config.tracker, &storage).reset(now_ms());
    println!("Anonymous ID:    {}", anonymous_id);
    println!("Session ID:      {}", session_id);
    Ok(())
}

/// Parse `key=value`; the value is JSON when it parses, a string otherwise
fn parse_property(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty property name in {:?}", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_property() {
        assert_eq!(
            parse_property("plan=pro").unwrap(),
            ("plan".to_string(), Value::String("pro".to_string()))
        );
        assert_eq!(
            parse_property("seats=3").unwrap(),
            ("seats".to_string(), Value::from(3))
        );
        assert_eq!(
            parse_property("beta=true").unwrap(),
            ("beta".to_string(), Value::Bool(true))
        );
        assert_eq!(
            parse_property("note=a=b").unwrap(),
            ("note".to_string(), Value::String("a=b".to_string()))
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=x").is_err());
    }
}
