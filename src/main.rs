use anyhow::{Context, Result, bail};
use std::{io::ErrorKind, path::Path, sync::Arc};
use thread_store::{
    config::{AppConfig, Backend},
    routes,
    services::{StoreService, StoreSettings},
    transport::{
        DiscordTransport, SqliteTransport, Transport,
        discord::DiscordConfig,
    },
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting thread-store with config: {:?}", cfg);

    // --- Initialize transport ---
    let transport: Arc<dyn Transport> = match cfg.backend {
        Backend::Discord => {
            if migrate {
                bail!("--migrate only applies to the sqlite backend");
            }
            let token = cfg.discord_token.clone().context("DISCORD_TOKEN is not set")?;
            let guild_id = cfg.guild_id.clone().context("GUILD_ID is not set")?;
            let mut discord = DiscordConfig::new(token, guild_id);
            discord.request_timeout = cfg.request_timeout;
            Arc::new(DiscordTransport::new(discord)?)
        }
        Backend::Sqlite => {
            ensure_database_dir(&cfg.database_url)?;
            let sqlite = SqliteTransport::connect(&cfg.database_url)
                .await
                .with_context(|| format!("opening {}", cfg.database_url))?;

            // --- Handle migration mode ---
            if migrate {
                tracing::info!("Database migration complete.");
                return Ok(()); // exit after migration
            }
            Arc::new(sqlite)
        }
    };

    if let Err(err) = transport.health_check().await {
        tracing::warn!("Storage platform not reachable yet: {}", err);
    }

    // --- Initialize core service ---
    let settings = StoreSettings {
        part_size: cfg.part_size,
        ..StoreSettings::default()
    };
    let store = StoreService::new(transport, settings);
    let progress = Arc::clone(store.progress());

    // --- Build router ---
    let app = routes::routes::routes(store, cfg.max_upload_bytes);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", err);
                return;
            }
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        }
    });

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                shutdown.cancelled().await;
                // Progress sockets never end on their own.
                progress.close();
            }
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Create the directory holding a file-backed SQLite database.
fn ensure_database_dir(database_url: &str) -> Result<()> {
    let db_path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if db_path.is_empty() || db_path.starts_with(":memory:") {
        return Ok(());
    }
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    Ok(())
}
