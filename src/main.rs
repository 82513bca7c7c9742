use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::middleware::{RequestInfo, RouteLimiter};
use turnstile::store::RedisWindowStore;
use turnstile::{RateLimiter, TurnstileConfig, TurnstileError};

/// Operational tooling for the Turnstile admission controller.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the configured route policies in match order
    Policies,
    /// Connect to the store and load the evaluation script
    Probe,
    /// Run the route interceptor decision against the configured store
    Check {
        /// HTTP method of the simulated call
        #[arg(long, default_value = "GET")]
        method: String,
        /// Request path of the simulated call
        #[arg(long)]
        path: String,
        /// Direct peer address
        #[arg(long)]
        client_ip: Option<IpAddr>,
        /// Raw forwarded-address header value
        #[arg(long)]
        forwarded_for: Option<String>,
        /// Number of consecutive calls to evaluate
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    config.validate()?;
    info!(
        policies = config.policies.len(),
        failure_mode = ?config.limiter.failure_mode,
        "Configuration loaded"
    );

    match cli.command {
        Command::Policies => print_policies(&config),
        Command::Probe => {
            let limiter = connect(&config).await?;
            let script = limiter.preload().await?;
            println!("{}", json!({ "store": "ok", "script": script.as_str() }));
            Ok(())
        }
        Command::Check {
            method,
            path,
            client_ip,
            forwarded_for,
            times,
        } => {
            let limiter = connect(&config).await?;
            let route_limiter = RouteLimiter::from_config(limiter.clone(), &config)?;

            let mut request = RequestInfo::new(method, path);
            if let Some(ip) = client_ip {
                request = request.with_peer(ip);
            }
            if let Some(header) = forwarded_for {
                request = request.with_forwarded_for(header);
            }

            let target = route_limiter.target(&request);
            if target.is_none() {
                warn!("No policy applies to this call (or the client is unknown)");
            }

            for attempt in 1..=times {
                let outcome = match route_limiter.check(&request).await {
                    Ok(()) => "allowed",
                    Err(TurnstileError::RateLimited { .. }) => "rate_limited",
                    Err(TurnstileError::StoreUnavailable(_)) => "store_unavailable",
                    Err(e) => return Err(e.into()),
                };
                let window_len = match &target {
                    Some((key, _)) => limiter.window_len(key).await.ok().flatten(),
                    None => None,
                };
                println!(
                    "{}",
                    json!({
                        "attempt": attempt,
                        "key": target.as_ref().map(|(key, _)| key.to_string()),
                        "outcome": outcome,
                        "window_len": window_len,
                    })
                );
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect(config: &TurnstileConfig) -> anyhow::Result<Arc<RateLimiter>> {
    let store = RedisWindowStore::connect_with_config(config.store.redis())
        .await
        .context("connecting to the window store")?;
    let limiter = RateLimiter::new(Arc::new(store))
        .with_operation_timeout(config.store.operation_timeout());
    Ok(Arc::new(limiter))
}

fn print_policies(config: &TurnstileConfig) -> anyhow::Result<()> {
    let registry = config.registry()?;
    for (position, policy) in registry.iter().enumerate() {
        let quota = policy.quota();
        println!(
            "{}",
            json!({
                "position": position,
                "method": policy.method(),
                "path_prefix": policy.path_prefix(),
                "interval_ms": quota.interval_ms(),
                "max_requests": quota.max_requests(),
            })
        );
    }
    Ok(())
}
