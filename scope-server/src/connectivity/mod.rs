//! Network association and self-update.

pub mod update;
pub mod wifi;

pub use update::{RestartStrategy, UpdateConfig, UpdateError, Updater};
pub use wifi::{NmcliBackend, SimulatedWifi, WifiBackend, WifiManager};

#[derive(Debug, thiserror::Error)]
pub enum ConnectivityError {
    #[error("Network '{0}' not found")]
    NetworkNotFound(String),
    #[error("Network '{0}' is secured, a password is required")]
    PasswordRequired(String),
    #[error("{0}")]
    Backend(String),
    #[error("WiFi task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
