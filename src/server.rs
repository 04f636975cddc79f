use axum::routing::get;
use axum::Router;

use crate::handler::{handle_head, handle_health, handle_show, handle_stream, ProxyState};

/// Build the axum router: health check, share info and the streaming route.
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/", get(handle_health))
        .route("/show/:token", get(handle_show))
        .route(
            "/dl/:message_id/:file_name",
            get(handle_stream).head(handle_head),
        )
        .with_state(state)
}
