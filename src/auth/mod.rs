use crate::state::AppState;
use axum::Router;

mod dto;
pub mod google;
pub mod handlers;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod service;
pub mod session;

#[cfg(test)]
pub(crate) mod memory;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::me_routes())
}
