use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chat_gateway::auth::JwtValidator;
use chat_gateway::config::{BrokerBackend, Config};
use chat_gateway::db::directory::PgDirectory;
use chat_gateway::gateway::fanout::RoomBroker;
use chat_gateway::gateway::ordering::SharedRoomLock;
use chat_gateway::gateway::redis::RedisBroker;
use chat_gateway::gateway::registry::RoomRegistry;
use chat_gateway::gateway::supervisor::Supervisor;
use chat_gateway::gateway::Gateway;
use chat_gateway::store::PgMessageStore;
use chat_gateway::AppState;

const DB_POOL_SIZE: usize = 20;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    let db = chat_gateway::db::pool::connect(&config.database_url, DB_POOL_SIZE)
        .expect("failed to build connection pool");

    let directory = Arc::new(PgDirectory::new(db.clone()));
    let store = Arc::new(PgMessageStore::new(db, config.history_page_size));
    let validator = Arc::new(JwtValidator::new(
        config.jwt_signing_key.as_bytes(),
        directory.clone(),
    ));

    let (broker, room_lock): (Arc<dyn RoomBroker>, Option<Arc<dyn SharedRoomLock>>) =
        match &config.broker {
            BrokerBackend::Redis {
                url,
                channel_prefix,
            } => {
                let broker = RedisBroker::connect(url, channel_prefix)
                    .await
                    .expect("failed to connect to Redis");
                let room_lock = Arc::new(broker.room_lock());
                (Arc::new(broker), Some(room_lock))
            }
            BrokerBackend::InProcess => {
                tracing::warn!("REDIS_URL not set; rooms are not shared across gateway processes");
                (Arc::new(RoomRegistry::new()), None)
            }
        };

    let mut gateway = Gateway::new(validator, directory, store, broker)
        .with_outbound_buffer(config.outbound_buffer);
    if let Some(room_lock) = room_lock {
        gateway = gateway.with_shared_room_lock(room_lock);
    }
    let supervisor = Arc::new(Supervisor::new(config.max_connections));
    let grace = Duration::from_secs(config.shutdown_grace_secs);

    tracing::info!(
        redis = matches!(config.broker, BrokerBackend::Redis { .. }),
        max_connections = ?config.max_connections,
        "chat-gateway configured"
    );

    let state = AppState {
        config: Arc::new(config),
        gateway,
        supervisor: supervisor.clone(),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(chat_gateway::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "chat-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");

    let draining = supervisor.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.begin_shutdown();
        })
        .await
        .expect("server error");

    // Upgraded sockets outlive the HTTP server; give them the grace period.
    if supervisor.drain(grace).await {
        tracing::info!("all connections closed");
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(?err, "failed to install SIGTERM handler");
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
    tracing::info!("shutdown signal received");
}
