//! Desk and room booking: a per-resource availability index with a
//! write-ahead log, booking policy, and the reservation lifecycle on top.

pub mod audit;
pub mod clock;
pub mod config;
pub mod engine;
pub mod idempotency;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod policy;
pub mod service;
pub mod settings;
pub mod suggest;
pub mod sweeper;
pub mod wal;
pub mod window;
