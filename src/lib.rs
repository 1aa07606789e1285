//! Tidemail service core
//!
//! The service layer of the Tidemail desktop shell: supervises the
//! locally-running peer-to-peer mail engine and owns the durable
//! configuration, credential storage, and encrypted backup/restore
//! paths. Window, tray, and webview concerns live in the shell; this
//! crate stays UI-agnostic and talks to consumers over event channels.
//!
//! ## Module Organization
//!
//! - `service/`: engine lifecycle coordination and auto-restart
//! - `config/`: durable, thread-safe application settings
//! - `credentials/`: vault-backed secret storage with encrypted fallback
//! - `backup/`: encrypted configuration/database snapshots
//! - `crypto/`: password-based authenticated encryption
//! - `engine/`: control surface consumed from the external mail engine
//! - `events/`: bounded event channels for shell consumers
//! - `types/`: shared error types

pub mod backup;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod engine;
pub mod events;
pub mod service;
pub mod types;

pub use types::error::{Result, TideError};
