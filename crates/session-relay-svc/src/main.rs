//! Session Relay Service
//!
//! HTTP service coordinating threshold-signature sessions: participant
//! registration, session start/completion signals, encrypted message
//! routing, setup-message distribution and published keysign results.
//! The relay stores ciphertext only and never learns key material.

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use clap::Parser;
use session_relay::RelayStore;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tss_core::{PartyId, RelayMessage, SignatureRecord};

/// Header scoping keysign traffic to one in-flight message
const MESSAGE_ID_HEADER: &str = "message_id";

/// Session relay service CLI arguments
#[derive(Parser, Debug)]
#[command(name = "session-relay-svc")]
#[command(about = "Coordination relay for threshold-signature sessions")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:18080", env = "RELAY_LISTEN")]
    listen: String,

    /// Idle session / message TTL in seconds
    #[arg(long, default_value = "300", env = "RELAY_TTL")]
    ttl: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let args = Args::parse();
    info!(listen = %args.listen, ttl = args.ttl, "Starting session relay service");

    let store = RelayStore::new(args.ttl);

    // periodic sweep of expired sessions and messages
    let cleanup_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            cleanup_store.cleanup();
        }
    });

    let app = router(store);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(address = %args.listen, "Listening");
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(store: RelayStore) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/:session_id",
            post(register_parties)
                .get(get_participants)
                .delete(delete_session),
        )
        .route("/start/:session_id", post(start_session).get(get_started))
        .route(
            "/complete/:session_id",
            post(mark_complete).get(get_completed),
        )
        .route(
            "/complete/keysign/:session_id",
            post(post_keysign_complete).get(get_keysign_complete),
        )
        .route("/message/:session_id", post(post_message))
        .route("/message/:session_id/:party_id", get(get_messages))
        .route(
            "/message/:session_id/:party_id/:hash",
            delete(delete_message),
        )
        .route(
            "/setup-message/:session_id",
            post(post_setup_message).get(get_setup_message),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(store)
}

fn message_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MESSAGE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Health check endpoint
async fn health(State(store): State<RelayStore>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "session-relay-svc",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": store.session_count(),
    }))
}

/// Register one or more parties in a session
async fn register_parties(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
    Json(parties): Json<Vec<PartyId>>,
) -> impl IntoResponse {
    store.register(&session_id, &parties);
    info!(%session_id, ?parties, "parties registered");
    StatusCode::CREATED
}

/// Parties registered so far
async fn get_participants(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match store.participants(&session_id) {
        Ok(parties) => (StatusCode::OK, Json(parties)).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Drop every record the relay holds for the session
async fn delete_session(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    store.delete_session(&session_id);
    info!(%session_id, "session deleted");
    StatusCode::OK
}

/// Freeze the committee and signal every participant to begin
async fn start_session(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
    Json(committee): Json<Vec<PartyId>>,
) -> impl IntoResponse {
    info!(%session_id, parties = committee.len(), "session started");
    store.start(&session_id, committee);
    StatusCode::CREATED
}

/// The frozen committee, 404 while the session has not started
async fn get_started(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match store.started_committee(&session_id) {
        Some(committee) => (StatusCode::OK, Json(committee)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Record completion marks for one or more parties
async fn mark_complete(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
    Json(parties): Json<Vec<PartyId>>,
) -> impl IntoResponse {
    store.complete(&session_id, &parties);
    StatusCode::CREATED
}

/// Parties that reported completion so far
async fn get_completed(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    Json(store.completed(&session_id))
}

/// Publish the signature produced for one keysign message
async fn post_keysign_complete(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(signature): Json<SignatureRecord>,
) -> impl IntoResponse {
    let Some(message_id) = message_id(&headers) else {
        return StatusCode::BAD_REQUEST;
    };
    store.put_keysign_complete(&session_id, &message_id, signature);
    StatusCode::CREATED
}

/// Signature a peer already produced, 404 while none is published
async fn get_keysign_complete(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let Some(message_id) = message_id(&headers) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match store.keysign_complete(&session_id, &message_id) {
        Some(signature) => (StatusCode::OK, Json(signature)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Store an encrypted message for each of its recipients
async fn post_message(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(message): Json<RelayMessage>,
) -> impl IntoResponse {
    if message.session_id != session_id {
        return StatusCode::BAD_REQUEST;
    }
    store.post_message(message_id(&headers).as_deref(), &message);
    StatusCode::ACCEPTED
}

/// Messages addressed to a party, oldest first
async fn get_messages(
    State(store): State<RelayStore>,
    Path((session_id, party_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    Json(store.fetch_messages(&session_id, &party_id, message_id(&headers).as_deref()))
}

/// Remove an applied message from one recipient's queue
async fn delete_message(
    State(store): State<RelayStore>,
    Path((session_id, party_id, hash)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    store.delete_message(&session_id, &party_id, &hash, message_id(&headers).as_deref());
    StatusCode::OK
}

/// Publish the encrypted setup message for joiners to download
async fn post_setup_message(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    store.put_setup_message(&session_id, message_id(&headers).as_deref(), body);
    StatusCode::CREATED
}

/// The encrypted setup message, 404 while the initiator has not uploaded it
async fn get_setup_message(
    State(store): State<RelayStore>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    match store.setup_message(&session_id, message_id(&headers).as_deref()) {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
