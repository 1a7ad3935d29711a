pub mod auth;
pub mod db;
pub mod http;
pub mod hub;
pub mod mailbox;
pub mod repo;
pub mod state;
pub mod ws_chat;
pub mod ws_common;

pub use state::AppState;

use axum::{
    response::IntoResponse,
    routing::{get, post},
    Router,
};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_chat::ws_chat_handler))
        .route("/healthz", get(health::healthz))
        .route(
            "/users",
            post(http::users::register_user),
        )
        .route("/users/:email", get(http::users::get_user_by_email))
        .route(
            "/tokens/authentication",
            post(http::users::authenticate),
        )
        .fallback(fallback_404)
        .with_state(state)
}

async fn fallback_404() -> impl IntoResponse {
    http::response::not_found("no such route")
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
}
