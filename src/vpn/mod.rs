//! VPN engine integration
//!
//! Architecture:
//! - config.rs: runtime VPN configuration and sing-box document synthesis
//! - state.rs: connection state machine and listener fan-out
//! - engine.rs: sing-box instance lifecycle and traffic accounting

pub mod config;
pub mod engine;
pub mod state;

pub use config::{build_engine_config, Config, DnsMode};
pub use engine::Engine;
pub use state::{State, StateMachine};

/// VPN-related errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("no server configuration provided")]
    MissingServer,

    #[error("already connected, disconnect first")]
    AlreadyConnected,

    #[error("sing-box binary not found")]
    EngineNotFound,

    #[error("failed to start engine: {0}")]
    EngineStart(String),

    #[error("failed to serialize engine config: {0}")]
    ConfigSerialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VpnResult<T> = Result<T, VpnError>;
