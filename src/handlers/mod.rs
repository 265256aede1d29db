//! HTTP handlers for the connection, query, and dynamic endpoint surfaces.

pub mod connection;
pub mod dynamic;
pub mod query;
