//! Read-only query surface plus the pause/unpause operator actions.
//!
//! Everything here is a pure consumer of derived state - the loops never
//! depend on the API.

pub mod handlers;
pub mod models;

pub use handlers::AppState;
