//! # wampd-server
//!
//! TCP front end for the wampd dealer.
//!
//! This crate provides:
//! - TCP connection handling with async I/O
//! - Binary frame and JSON line wire modes
//! - Session handshake (HELLO/WELCOME/ABORT/GOODBYE)
//! - Message dispatch into the dealer
//! - Registration meta event broadcasting
//! - Periodic call timeout sweeping
//! - Prometheus metrics

pub mod broadcast;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod session;
pub mod sweeper;

pub use broadcast::{EventFilter, MetaEvent, MetaEventBroadcaster};
pub use config::{Config, ConfigError, DealerConfig, MetricsConfig, NetworkConfig, RealmConfig};
pub use error::ServerError;
pub use handler::{Disposition, MessageHandler, RouterInfo};
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState, WireMode};
pub use sweeper::{SweeperStats, TimeoutSweeper};
