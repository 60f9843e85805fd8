//! Shared building blocks for the push dispatch bridge: the queue record model,
//! configuration, the common error type and connection helpers.

pub mod config;
pub mod db;
pub mod error;
pub mod redis_pool;
pub mod types;
