//! Base types and error handling.
//!
//! - [`NetError`](neterror::NetError): error taxonomy with stable numeric codes
//! - [`EngineConfig`](config::EngineConfig): engine-wide settings
//! - [`IoResultExt`](context::IoResultExt): context helpers for `io::Error`

pub mod config;
pub mod context;
pub mod neterror;
