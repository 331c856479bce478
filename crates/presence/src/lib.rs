pub mod auth;
pub mod config;
pub mod dispatcher;
pub mod movement;
pub mod registry;
pub mod server;
pub mod session;
pub mod signaling;

pub use config::PresenceServerConfig;
pub use server::run_server;
