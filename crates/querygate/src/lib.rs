pub mod config;
pub mod connection;
pub mod server;
pub mod transport;
pub mod worker;
pub mod writer;

pub use config::GatewayConfig;
pub use connection::run_connection;
pub use server::{AppState, router, serve};
