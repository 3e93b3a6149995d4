use axum::{routing::get, Router};

use crate::state::AppState;

pub mod branches;
pub mod contracts;
pub mod health;
pub mod invoices;
pub mod meters;
pub mod rooms;
pub mod tenants;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(branches::router())
        .merge(rooms::router())
        .merge(tenants::router())
        .merge(contracts::router())
        .merge(meters::router())
        .merge(invoices::router())
}
