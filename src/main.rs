//! Offload Server - personal cloud storage over chat-service attachments

use chrono::Utc;
use clap::Parser;
use offload_server::api::{router, AppState};
use offload_server::archive::scheduler::Scheduler;
use offload_server::archive::ArchiveService;
use offload_server::config::Config;
use offload_server::crypto::MasterKey;
use offload_server::metrics::Metrics;
use offload_server::store::{MemoryStore, MetaStore};
use offload_server::types::{ProviderHandle, User, UserRole};
use rand::RngCore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Version string including build timestamp for --version output
fn version_long() -> &'static str {
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("OFFLOAD_BUILD_TIME"),
        )
    })
}

/// Offload Server — stores encrypted file parts as chat attachments
#[derive(Parser, Debug)]
#[command(name = "offload_server")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Register a webhook provider handle, then exit
    #[arg(long, value_name = "URL")]
    add_webhook: Option<String>,

    /// Create a user (password read from stdin), then exit
    #[arg(long, value_name = "NAME")]
    add_user: Option<String>,

    /// Quota in bytes for --add-user (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    quota_bytes: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Config is loaded before the runtime exists so blocking_threads can
    // shape the runtime; async_main reloads it for everything else.
    let pre_config = load_config(&cli);

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();
    if let Some(bt) = pre_config.blocking_threads {
        runtime_builder.max_blocking_threads(bt);
    }
    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(cli))
}

fn load_config(cli: &Cli) -> Config {
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path).unwrap_or_else(|_| Config::load())
    } else {
        Config::load()
    };
    config.apply_env();
    config
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    // Priority: RUST_LOG > OFFLOAD_LOG_LEVEL > --verbose > default
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("OFFLOAD_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("offload_server=trace,tower_http=trace")
            } else {
                EnvFilter::new("offload_server=info,tower_http=info")
            }
        });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = load_config(&cli);
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    tokio::fs::create_dir_all(&config.data_dir).await?;

    let store: Arc<dyn MetaStore> = match &config.store_path {
        Some(path) => {
            info!("  Store: JSON snapshot at {:?}", path);
            Arc::new(MemoryStore::open(path)?)
        }
        None => {
            warn!("  Store: volatile in-memory (set OFFLOAD_STORE_PATH to persist)");
            Arc::new(MemoryStore::new())
        }
    };

    // One-shot admin commands.
    if let Some(url) = cli.add_webhook {
        let handle = ProviderHandle {
            id: Uuid::new_v4().to_string(),
            url,
            enabled: true,
            created_at: Utc::now(),
        };
        store.upsert_webhook(handle.clone()).await?;
        eprintln!("Registered webhook handle {}", handle.id);
        return Ok(());
    }
    if let Some(username) = cli.add_user {
        use std::io::BufRead;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        let password = line.trim_end_matches(['\n', '\r']);
        if password.is_empty() {
            return Err("password must not be empty".into());
        }
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.clone(),
            password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)?,
            role: UserRole::User,
            quota_bytes: cli.quota_bytes,
            used_bytes: 0,
            created_at: Utc::now(),
        };
        store.insert_user(user.clone()).await?;
        eprintln!("Created user {} ({})", username, user.id);
        return Ok(());
    }

    info!(
        "Starting Offload Server v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("OFFLOAD_BUILD_TIME"),
    );
    info!("  Listen address: {}", config.listen_addr);
    info!("  Data directory: {:?}", config.data_dir);
    info!("  Chunk size: {} KiB", config.chunk_size_bytes / 1024);
    info!(
        "  Disk limits: soft {} GiB / hard {} GiB",
        config.disk_soft_limit_gb, config.disk_hard_limit_gb
    );
    info!(
        "  Workers: {} × poll {} ms, {} part uploads",
        config.worker_concurrency, config.worker_poll_ms, config.upload_parts_concurrency
    );
    if config.bot.is_some() {
        info!("  Bot provider: configured");
    }

    let secret = resolve_master_secret(&config, store.as_ref()).await?;
    let key = MasterKey::derive(&secret);
    drop(secret);

    let metrics = Arc::new(Metrics::new());
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    );
    metrics
        .build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    let webhook_count = store.list_webhooks().await?.len();
    if webhook_count == 0 && config.bot.is_none() {
        warn!("  No providers configured — uploads will fail until --add-webhook or bot credentials are set");
    } else {
        info!("  Webhook handles: {webhook_count}");
    }

    let service = ArchiveService::new(config.clone(), store, key, Some(metrics.clone()));

    let scheduler = Scheduler::new(service.clone());
    let scheduler_handle = scheduler.spawn();

    let state = Arc::new(AppState {
        service,
        metrics,
    });
    let app = router(state);

    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Offload Server listening on http://{}", config.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler_handle.abort();
    info!("Server shutdown complete");
    Ok(())
}

/// Master secret resolution: env/config wins, else the persisted settings
/// value, else generate one and persist it.
async fn resolve_master_secret(
    config: &Config,
    store: &dyn MetaStore,
) -> Result<Zeroizing<String>, Box<dyn std::error::Error>> {
    if let Some(secret) = &config.master_secret {
        return Ok(Zeroizing::new(secret.clone()));
    }
    if let Some(secret) = store.get_setting("master_secret").await? {
        return Ok(Zeroizing::new(secret));
    }

    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let secret = hex::encode(raw);
    store.set_setting("master_secret", &secret).await?;
    warn!("Generated a new master secret and stored it in settings — back it up; losing it loses every archive");
    Ok(Zeroizing::new(secret))
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
