//! Tab-scoped relay for captured RPC traffic, and the inspector that reads it.
//!
//! Observers living with a page forward [`capture::CaptureEvent`]s to the
//! [`relay::Relay`], which routes them to the inspector attached to the same
//! tab. The inspector keeps a bounded, searchable buffer of what it received.

pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod inspector;
pub mod live;
pub mod observer;
pub mod protocol;
pub mod relay;
pub mod resilient;
pub mod server;
pub mod stringify;

pub use config::RelayConfig;
pub use error::RelayError;
