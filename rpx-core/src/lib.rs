pub mod config;
pub mod envsubst;
pub mod observability;
pub mod proto;
pub mod wire;
