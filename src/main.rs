use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use courier::api::{AppState, api_routes};
use courier::automation::{ConversationManager, InboundHandler};
use courier::config::{DispatchConfig, ServerConfig};
use courier::dispatch::{Dispatcher, HttpGatewayTransport, OutboundTransport};
use courier::events::EventBus;
use courier::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let server_config = ServerConfig::from_env();
    let dispatch_config = DispatchConfig::from_env();

    // ── Logging ──────────────────────────────────────────────────────────
    // Dropping the guard stops the background file writer.
    let (file_layer, _log_guard) = match &server_config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "courier.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    server_config
        .validate()
        .context("Invalid server configuration")?;

    eprintln!("📨 Courier v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", server_config.db_path.display());
    eprintln!("   Gateway: {}", server_config.gateway_url);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws/events", server_config.port);
    eprintln!("   API: http://0.0.0.0:{}/api", server_config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&server_config.db_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open database at {}",
                    server_config.db_path.display()
                )
            })?,
    );

    // ── Core services ────────────────────────────────────────────────────
    let events = EventBus::new(server_config.event_capacity);
    let transport: Arc<dyn OutboundTransport> = Arc::new(HttpGatewayTransport::new(
        server_config.gateway_url.clone(),
        server_config.gateway_token.clone(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&db),
        Arc::clone(&transport),
        events.clone(),
        dispatch_config.clone(),
    ));
    dispatcher
        .start()
        .await
        .context("Failed to start dispatcher")?;

    let conversations = Arc::new(ConversationManager::new(Arc::clone(&db), events.clone()));
    let inbound = Arc::new(InboundHandler::new(
        Arc::clone(&conversations),
        transport,
        dispatch_config.retry.clone(),
        dispatch_config.send_timeout,
    ));

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = api_routes(AppState {
        dispatcher: Arc::clone(&dispatcher),
        conversations,
        inbound,
        events,
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server_config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", server_config.port))?;
    tracing::info!(port = server_config.port, "Courier server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    dispatcher.shutdown().await;
    Ok(())
}
