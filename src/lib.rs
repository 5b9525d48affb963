pub mod audit;
pub mod auth;
pub mod campus;
pub mod catalog;
pub mod engine;
pub mod identity;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod observability;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
