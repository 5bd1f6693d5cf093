//! Management API served under `/api/v2.0`

pub mod jobservice;

use crate::server::AppState;
use axum::Router;

pub fn routes() -> Router<AppState> {
    jobservice::routes()
}
