use tower_http::cors::{Any, CorsLayer};

/// The gateway accepts every origin; authentication belongs in front of it.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_headers(Any)
        .allow_methods(Any)
}
