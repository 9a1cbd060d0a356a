pub mod api;
pub mod config;
pub mod metrics;
pub mod rate_limit;
pub mod server;
pub mod sessions;

pub use server::PairingServer;
