mod models;
mod handlers;
mod routes;
mod docs;
mod config;
mod db;
mod errors;
mod presence;
mod rooms;
mod state;
mod ws;

use axum::{http::{HeaderValue, Method}, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use routes::{create_api_routes, create_presence_routes, create_sync_routes};
use docs::ApiDoc;
use config::Config;
use db::{DbDocs, DocumentStore, MemoryDocs};
use presence::RoomPresenceHub;
use rooms::{DocumentRegistry, PersistenceScheduler, RetryExecutor};
use state::AppState;
use ws::SessionCoordinator;
use tracing::{info, error, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use std::{panic, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};

#[tokio::main(flavor = "current_thread")]
async fn main() {

    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Load configuration before logging so LOG_LEVEL applies
    let config_result = Config::load();
    let config = config_result.as_ref().cloned().unwrap_or_default();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Debug for our app, LOG_LEVEL for everything else
            format!("coedit_server=debug,tower_http=debug,axum::rejection=trace,{}", config.log_level).into()
        }))
        .init();

    info!("Starting server...");
    match &config_result {
        Ok(_) => info!("✅ Configuration loaded successfully"),
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            warn!("Using default configuration");
        }
    }

    // Pick the document store
    let (store, storage_backend): (Arc<dyn DocumentStore>, &'static str) = match &config.db_url {
        Some(db_url) => match DbDocs::new(db_url).await {
            Ok(docs) => {
                info!("Database initialized successfully");
                (Arc::new(docs), "postgres")
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Falling back to in-memory documents - nothing survives a restart");
                (Arc::new(MemoryDocs::new()), "memory")
            }
        },
        None => {
            warn!("No database URL configured - documents are kept in memory and lost on restart");
            (Arc::new(MemoryDocs::new()), "memory")
        }
    };

    let registry = DocumentRegistry::new(
        store,
        RetryExecutor::new(config.retry_policy()),
        PersistenceScheduler::new(config.save_debounce()),
    );
    let state = Arc::new(AppState {
        coordinator: SessionCoordinator::new(registry.clone(), RoomPresenceHub::new()),
        storage_backend,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Combine all routes
    let app_routes = Router::new()
        // Mount API routes
        .nest("/api", create_api_routes(state.clone()))
        // Mount the presence channel
        .merge(create_presence_routes(state.clone()))
        // Mount Swagger UI
        .merge(SwaggerUi::new("/swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors_layer(&config))
        // Add tracing layer
        .layer(TraceLayer::new_for_http());

    let sync_routes = create_sync_routes(state.clone())
        .layer(TraceLayer::new_for_http());

    // Start the sync server
    let sync_addr = config.sync_address();
    let sync_listener = tokio::net::TcpListener::bind(&sync_addr)
        .await
        .unwrap_or_else(|_| panic!("Failed to bind sync server to {}", sync_addr));

    let sync_shutdown = shutdown_rx.clone();
    let sync_server = tokio::spawn(async move {
        if let Err(e) = axum::serve(sync_listener, sync_routes)
            .with_graceful_shutdown(wait_for_shutdown(sync_shutdown))
            .await
        {
            error!("Sync server error: {}", e);
        }
    });

    let sweeper = config.idle_room_timeout().map(|timeout| {
        spawn_idle_sweeper(registry.clone(), timeout, config.idle_sweep_interval(), shutdown_rx.clone())
    });

    // Start the HTTP/API server
    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("🚀 Server running on http://{}", config.server_address());
    info!("👥 Presence channel available at ws://{}/presence", config.server_address());
    info!("📡 Sync server available at ws://{}/<roomId>", sync_addr);
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    axum::serve(listener, app_routes)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("Server failed to start");

    if let Err(e) = sync_server.await {
        error!("Sync server task failed: {}", e);
    }
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    // Flush every open room before exiting
    registry.close_all().await;
    info!("Shutdown complete");
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origin_list()
        .into_iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring invalid CORS origin '{}': {}", origin, e);
                None
            }
        })
        .collect();

    if origins.is_empty() {
        if config.is_development() {
            warn!("No CORS origins configured - allowing any origin in development");
            return CorsLayer::permissive();
        }
        return CorsLayer::new();
    }
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
}

/// Periodically close rooms nobody is connected to
fn spawn_idle_sweeper(
    registry: DocumentRegistry,
    idle_timeout: Duration,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!("Idle rooms are closed after {:?}", idle_timeout);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = registry.evict_idle(idle_timeout).await;
                    if !evicted.is_empty() {
                        info!("Closed {} idle rooms", evicted.len());
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
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
    info!("Shutdown signal received");
}
