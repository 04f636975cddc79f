use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_s3::Client;
use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use streamgate::backend::SessionId;
use streamgate::config::{AppConfig, CliArgs};
use streamgate::handler::ProxyState;
use streamgate::pool::SessionPool;
use streamgate::s3::{
    build_client, S3Authenticator, S3LinkRegistry, S3MessageStore, S3Session,
};
use streamgate::server::build_router;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = CliArgs::parse();
    let config = Arc::new(AppConfig::try_from(args)?);

    // ---------- primary session ----------
    let home_sdk = load_sdk_config(config.region.as_deref(), None).await;
    let home_client = build_client(&home_sdk, None, &config.s3);
    home_client
        .head_bucket()
        .bucket(&config.bucket)
        .send()
        .await
        .with_context(|| format!("home bucket {} is not reachable", config.bucket))?;
    info!(bucket = %config.bucket, datacenter = config.home_dc, "home bucket reachable");

    let mut identities: Vec<(SessionId, SdkConfig, Client)> =
        vec![(0, home_sdk, home_client.clone())];

    // ---------- extra sessions, one per profile ----------
    for (idx, profile) in config.session_profiles.iter().enumerate() {
        let id = idx as SessionId + 1;
        let sdk = load_sdk_config(config.region.as_deref(), Some(profile.as_str())).await;
        let client = build_client(&sdk, None, &config.s3);
        match client.head_bucket().bucket(&config.bucket).send().await {
            Ok(_) => identities.push((id, sdk, client)),
            Err(e) => error!(session = id, profile = %profile, "failed to start session: {e}"),
        }
    }

    let mut authenticator = S3Authenticator::new(config.datacenters.clone(), config.s3.clone());
    for (id, sdk, _) in &identities {
        authenticator.add_identity(*id, sdk.clone());
    }

    let pool = Arc::new(SessionPool::new(Arc::new(authenticator)));
    for (id, _, client) in identities {
        pool.register(
            id,
            Arc::new(S3Session::new(client, config.bucket.clone(), config.home_dc)),
        );
    }
    if pool.len() > 1 {
        info!(sessions = pool.len(), "multi-session mode enabled");
    }

    // ---------- application state ----------
    let state = ProxyState {
        config: config.clone(),
        pool,
        messages: Arc::new(S3MessageStore::new(home_client.clone(), config.bucket.clone())),
        links: Arc::new(S3LinkRegistry::new(home_client, config.bucket.clone())),
    };

    // ---------- HTTP server ----------
    let app = build_router(state).layer(TraceLayer::new_for_http());
    let addr = SocketAddr::new(config.bind_ip, config.port);
    let listener = TcpListener::bind(addr).await?;
    info!("streamgate listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutdown complete");
    Ok(())
}

async fn load_sdk_config(region: Option<&str>, profile: Option<&str>) -> SdkConfig {
    let region_provider = match region {
        Some(r) => RegionProviderChain::first_try(Some(aws_config::Region::new(r.to_owned())))
            .or_default_provider(),
        None => RegionProviderChain::default_provider(),
    };
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
    if let Some(p) = profile {
        loader = loader.profile_name(p);
    }
    loader.load().await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("cannot listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "streamgate=info,tower_http=info".into()
            }),
        )
        .with_target(false)
        .compact()
        .init();
}
