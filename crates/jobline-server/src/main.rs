use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use jobline_api::conversations;
use jobline_api::middleware::require_auth;
use jobline_api::{AppState, AppStateInner};
use jobline_core::{MessagingService, NullDirectory};
use jobline_gateway::Dispatcher;
use jobline_gateway::connection;

#[derive(Clone)]
struct ServerState {
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobline=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("JOBLINE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("JOBLINE_DB_PATH").unwrap_or_else(|_| "jobline.db".into());
    let host = std::env::var("JOBLINE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("JOBLINE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init store and fan-out
    let db = Arc::new(jobline_db::Database::open(&PathBuf::from(&db_path))?);
    let dispatcher = Dispatcher::new();
    let service = MessagingService::new(db, dispatcher.clone(), Arc::new(NullDirectory));

    let app_state: AppState = Arc::new(AppStateInner {
        service,
        jwt_secret: jwt_secret.clone(),
    });

    // Routes
    let protected_routes = Router::new()
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages),
        )
        .route("/messages", post(conversations::send_message))
        .route(
            "/conversations/{conversation_id}/archive",
            post(conversations::set_archived),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(conversations::mark_read),
        )
        .route(
            "/conversations/{conversation_id}",
            delete(conversations::delete_conversation),
        )
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new().route("/gateway", get(ws_upgrade)).with_state(ServerState {
        dispatcher,
        jwt_secret,
    });

    let app = Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Jobline messaging server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.jwt_secret)
    })
}
