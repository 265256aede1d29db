//! Route builders.

pub mod api;
pub mod common;

pub use api::{connection_routes, dynamic_routes};
pub use common::{common_routes, common_routes_with_ready};
