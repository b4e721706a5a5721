//! Mercure hub entry point

mod cli;

use crate::cli::{Cli, Commands, ServeArgs, TokenArgs};
use anyhow::{Context, Result};
use clap::Parser;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use mercure::auth::{Claims, JwtKey, MercureClaim};
use mercure::hub::{Hub, HubConfig};
use mercure::transport;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Token(args) => token(args),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = hub_config(&args)?;

    let transport = transport::from_dsn(&args.transport)
        .await
        .context("Unable to create the transport")?;
    let hub = Hub::new(config, transport).context("Invalid hub configuration")?;

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.addr))?;

    info!(addr = %args.addr, "Mercure hub listening");

    axum::serve(
        listener,
        hub.router().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(hub.clone()))
    .await
    .context("Server error")?;

    info!("Mercure hub stopped");
    Ok(())
}

fn hub_config(args: &ServeArgs) -> Result<HubConfig> {
    let publisher_jwt = jwt_key(
        args.publisher_jwt_key.as_deref().or(args.jwt_key.as_deref()),
        args.publisher_jwt_algorithm.as_deref().unwrap_or(&args.jwt_algorithm),
        args.publisher_jwks_url.as_deref(),
    )
    .context("Invalid publisher JWT key")?;

    let subscriber_jwt = jwt_key(
        args.subscriber_jwt_key.as_deref().or(args.jwt_key.as_deref()),
        args.subscriber_jwt_algorithm.as_deref().unwrap_or(&args.jwt_algorithm),
        args.subscriber_jwks_url.as_deref(),
    )
    .context("Invalid subscriber JWT key")?;

    if publisher_jwt.is_none() {
        warn!("No publisher key configured: anyone can publish");
    }

    Ok(HubConfig {
        publisher_jwt,
        subscriber_jwt,
        anonymous: args.anonymous,
        subscriptions: args.subscriptions,
        publish_origins: args.publish_origins.clone(),
        cors_origins: args.cors_origins.clone(),
        cookie_name: args.cookie_name.clone(),
        write_timeout: Duration::from_secs(args.write_timeout),
        dispatch_timeout: Duration::from_secs(args.dispatch_timeout),
        heartbeat: Duration::from_secs(args.heartbeat),
        subscriber_buffer: args.subscriber_buffer,
        cache_max_entries_per_shard: args.cache_max_entries_per_shard,
        cache_shard_count: args.cache_shard_count,
        protocol_version_compatibility: args.protocol_version_compatibility,
    })
}

/// A JWKS URL takes precedence over a key
fn jwt_key(key: Option<&str>, alg: &str, jwks_url: Option<&str>) -> Result<Option<JwtKey>> {
    if let Some(url) = jwks_url {
        return Ok(Some(JwtKey::jwks(url)));
    }

    key.map(|k| JwtKey::from_config(k, alg)).transpose().map_err(Into::into)
}

fn token(args: TokenArgs) -> Result<()> {
    let alg = Algorithm::from_str(&args.algorithm)
        .ok()
        .filter(|a| matches!(a, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512))
        .with_context(|| format!("Unsupported algorithm for shared secrets: {}", args.algorithm))?;

    let payload = args
        .payload
        .as_deref()
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("Invalid JSON payload")?;

    let exp = match args.ttl {
        Some(ttl) => Some(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() + ttl),
        None => None,
    };

    let claims = Claims {
        mercure: Some(MercureClaim {
            publish: (!args.publish.is_empty()).then_some(args.publish),
            subscribe: (!args.subscribe.is_empty()).then_some(args.subscribe),
            payload,
        }),
        exp,
        ..Default::default()
    };

    let token = jsonwebtoken::encode(
        &Header::new(alg),
        &claims,
        &EncodingKey::from_secret(args.secret.as_bytes()),
    )
    .context("Failed to sign token")?;

    println!("{}", token);
    Ok(())
}

async fn shutdown_signal(hub: Hub) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Unable to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutting down, closing the transport");

    // Ends every event stream so the graceful shutdown can complete
    if let Err(e) = hub.stop().await {
        warn!(error = %e, "Failed to close the transport");
    }
}
