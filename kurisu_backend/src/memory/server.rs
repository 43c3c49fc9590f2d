use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};

use super::{
    AddMemoriesRequest, ChatMemoryQuery, ChatMemoryResponse, ContextQuery, ContextResponse,
    DeleteMemoryRequest, MemoryStore, StatusResponse,
};

type ApiError = (StatusCode, Json<StatusResponse>);

pub fn router(store: Arc<dyn MemoryStore>) -> Router {
    Router::new()
        .route("/is_alive", get(is_alive))
        .route("/add_memories", post(add_memories))
        .route("/get_context", get(get_context))
        .route("/get_chat_memory", get(get_chat_memory))
        .route("/delete_memory", delete(delete_memory))
        .with_state(store)
}

pub async fn serve_memory(store: Arc<dyn MemoryStore>, bind_addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind memory server to {}", bind_addr))?;
    serve_on(listener, store).await
}

/// Serve on an already bound listener.
pub async fn serve_on(listener: tokio::net::TcpListener, store: Arc<dyn MemoryStore>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Memory server listening on {}", addr);
    }
    axum::serve(listener, router(store))
        .await
        .context("Memory server failed")?;
    Ok(())
}

fn internal(error: impl std::fmt::Display) -> ApiError {
    tracing::error!("Memory request failed: {}", error);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(StatusResponse::error(error.to_string())),
    )
}

async fn is_alive(
    State(store): State<Arc<dyn MemoryStore>>,
) -> Result<Json<StatusResponse>, ApiError> {
    match store.connect().await {
        Ok(()) => Ok(Json(StatusResponse::ok("memory store is alive"))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(StatusResponse::error(e.to_string())),
        )),
    }
}

async fn add_memories(
    State(store): State<Arc<dyn MemoryStore>>,
    Json(request): Json<AddMemoriesRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let count = request.memory_chain.len();
    store
        .add_memories(&request.memory_chain)
        .await
        .map_err(internal)?;
    Ok(Json(StatusResponse::ok(format!("stored {} memories", count))))
}

async fn get_context(
    State(store): State<Arc<dyn MemoryStore>>,
    Query(query): Query<ContextQuery>,
) -> Result<Json<ContextResponse>, ApiError> {
    let context = store.get_context(&query.query).await.map_err(internal)?;
    Ok(Json(ContextResponse { context }))
}

async fn get_chat_memory(
    State(store): State<Arc<dyn MemoryStore>>,
    Query(query): Query<ChatMemoryQuery>,
) -> Result<Json<ChatMemoryResponse>, ApiError> {
    let chat_history = store
        .get_chat_memory(query.limit)
        .await
        .map_err(internal)?;
    Ok(Json(ChatMemoryResponse { chat_history }))
}

async fn delete_memory(
    State(store): State<Arc<dyn MemoryStore>>,
    Json(request): Json<DeleteMemoryRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    match store.delete_memory(&request.uuid).await {
        Ok(true) => Ok(Json(StatusResponse::ok(format!(
            "deleted memory {}",
            request.uuid
        )))),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(StatusResponse::error(format!(
                "no memory with uuid {}",
                request.uuid
            ))),
        )),
        Err(e) => Err(internal(e)),
    }
}
