pub mod admin;
pub mod agent;

#[cfg(test)]
pub(crate) mod test_helpers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    // Endpoint-facing upload routes, scoped by environment
    let agent = Router::new()
        .route("/{env}/carve_init", post(agent::carve_init))
        .route("/{env}/carve_block", post(agent::carve_block));

    let api = Router::new()
        .route(
            "/api/carves",
            get(admin::list_carves).post(admin::schedule_carve),
        )
        .route(
            "/api/carves/{carve_id}",
            get(admin::get_carve).delete(admin::delete_carve),
        )
        .route("/api/carves/{carve_id}/archive", post(admin::archive_carve))
        .route("/api/carves/{carve_id}/download", get(admin::download_carve));

    Router::new()
        .route("/health", get(admin::health))
        .merge(api)
        .merge(agent)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
