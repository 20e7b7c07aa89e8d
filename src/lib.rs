pub mod api;
pub mod config;
pub mod directory;
pub mod engine;
pub mod limits;
pub mod model;
pub mod observability;
pub mod store;
pub mod tasks;
pub mod wal;
pub mod wire;
