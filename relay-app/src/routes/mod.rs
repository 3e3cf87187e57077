pub mod conversations;
pub mod health;
pub mod sessions;
pub mod turns;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(conversations::router())
        .merge(health::router())
        .merge(sessions::router())
        .merge(turns::router())
}
