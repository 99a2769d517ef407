mod actor;
mod handlers;

use std::sync::Arc;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use actor::{ActorId, ACTOR_HEADER};

use crate::service::ReleaseService;

pub fn create_router(service: Arc<ReleaseService>) -> Router {
    let api = Router::new()
        // Games
        .route("/games", get(handlers::list_games))
        .route("/games", post(handlers::create_game))
        .route("/games/{id}", get(handlers::get_game))
        .route("/games/{id}", put(handlers::update_game))
        .route("/games/{id}", delete(handlers::delete_game))
        .route("/games/{id}/disable", post(handlers::disable_game))
        .route("/games/{id}/enable", post(handlers::enable_game))
        .route("/games/{id}/rollout", put(handlers::update_rollout))
        .route("/games/{id}/reset", post(handlers::reset_game))
        .route("/games/{id}/activate/{version_id}", post(handlers::activate_version))
        .route("/games/{id}/versions", get(handlers::list_versions))
        .route("/games/{id}/versions", post(handlers::create_version))
        // Versions
        .route("/versions/{id}", get(handlers::get_version))
        .route("/versions/{id}", put(handlers::update_version))
        .route("/versions/{id}", delete(handlers::delete_version))
        .route("/versions/{id}/actions", get(handlers::list_actions))
        .route("/versions/{id}/transitions", post(handlers::transition_version))
        // Audit
        .route("/audit", get(handlers::query_audit))
        // Registry
        .route("/registry", get(handlers::get_registry))
        .route("/registry/sync", post(handlers::sync_registry))
        .route("/registry/consumers/{consumer_id}", get(handlers::get_consumer_registry))
        // Health
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}
