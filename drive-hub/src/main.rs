use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use drive_hub::api;
use drive_hub_core::auth::{Hs256Verifier, TokenVerifier};
use drive_hub_core::drive::{Drive, StorageSelector};
use drive_hub_core::encryption::{AesGcmEncryption, EncryptionProvider, NoopEncryption};
use drive_hub_core::events::Notification;
use drive_hub_core::ledger::memory::MemoryLedger;
use drive_hub_core::ledger::Ledger;
use drive_hub_core::settings::{Settings, StorageBackend};
use drive_hub_core::storage::{MemoryStorage, S3Storage, StorageProvider};
use drive_hub_core::sync::{SyncOptions, Synchronizer};

#[derive(Parser, Debug)]
#[command(name = "drive-hub", about = "Event-synchronized shared drive server")]
struct Args {
    /// Address the HTTP server binds to.
    #[arg(long, default_value = "127.0.0.1:3000")]
    addr: String,

    /// Entity holding the manager role on the fresh ledger.
    #[arg(long, default_value = "root")]
    manager: String,

    /// HS256 secret for verifying bearer tokens. When absent, only the
    /// X-Entity-Id header identifies callers.
    #[arg(long)]
    jwt_secret: Option<String>,

    /// Base64-encoded 32-byte master key sealing private content. When
    /// absent, private files are stored unencrypted.
    #[arg(long)]
    master_key: Option<String>,

    /// Coalescing window for cache refreshes, in milliseconds.
    #[arg(long, default_value_t = 100)]
    debounce_ms: u64,
}

/// Routes `memory` settings to one shared in-process store and `s3`
/// settings to a client for the configured bucket.
fn storage_selector(base: aws_config::SdkConfig) -> Box<StorageSelector> {
    let memory: Arc<dyn StorageProvider> = Arc::new(MemoryStorage::new());
    Box::new(move |settings: &Settings| match settings.backend {
        StorageBackend::Memory => Ok(memory.clone()),
        StorageBackend::S3 => {
            if settings.s3_bucket.is_empty() {
                anyhow::bail!("s3 backend selected without a bucket");
            }
            let mut builder = aws_sdk_s3::config::Builder::from(&base);
            if let Some(endpoint) = &settings.s3_endpoint {
                builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
            }
            if let Some(region) = &settings.s3_region {
                builder = builder.region(aws_sdk_s3::config::Region::new(region.clone()));
            }
            let client = aws_sdk_s3::Client::from_conf(builder.build());
            let provider: Arc<dyn StorageProvider> =
                Arc::new(S3Storage::new(client, settings.s3_bucket.clone()));
            Ok(provider)
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new(&args.manager));
    let sync = Synchronizer::start(
        ledger.clone(),
        SyncOptions {
            debounce: Duration::from_millis(args.debounce_ms),
            ..SyncOptions::default()
        },
    )
    .await?;

    let encryption: Arc<dyn EncryptionProvider> = match &args.master_key {
        Some(encoded) => {
            let key = BASE64.decode(encoded)?;
            Arc::new(AesGcmEncryption::new(&key)?)
        }
        None => {
            warn!("no master key configured; private content is stored unencrypted");
            Arc::new(NoopEncryption)
        }
    };

    let aws = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .load()
        .await;
    let drive = Arc::new(
        Drive::new(
            ledger,
            sync.cache(),
            sync.local_events(),
            encryption,
            storage_selector(aws),
        )
        .await?,
    );

    let verifier: Option<Arc<dyn TokenVerifier>> = args
        .jwt_secret
        .as_deref()
        .map(|secret| Arc::new(Hs256Verifier::new(secret.as_bytes())) as Arc<dyn TokenVerifier>);
    if verifier.is_none() {
        warn!("no JWT secret configured; trusting the X-Entity-Id header");
    }

    // Reselect the storage provider whenever a settings change lands,
    // whether it came from this node or over the ledger feed.
    let mut updates = sync.notifications().subscribe();
    let drive_updates = drive.clone();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(Notification::SettingsChanged) => {
                    if let Err(err) = drive_updates.refresh_settings().await {
                        warn!(error = %err, "settings refresh failed");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let app = api::router(drive, sync.notifications(), verifier);
    let listener = TcpListener::bind(&args.addr).await?;
    info!(addr = %args.addr, manager = %args.manager, "drive hub listening");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    sync.stop().await;
    Ok(())
}
