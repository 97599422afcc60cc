//! # devid
//!
//! Runs a device-fingerprinting script inside an emulated browser host and
//! extracts the device identifier it computes.
//!
//! ## Safety
//!
//! The crate denies unsafe code. The single exception is the constructor of
//! host closures in `globals`, which only ever captures reference-counted
//! Rust state.
//!
//! A run proceeds in four steps:
//!
//! - **Profile** - request-style signals (user agent, languages, referer,
//!   platform) are turned into an [`EnvironmentProfile`]
//! - **Global graph** - a fresh engine context is populated with `window`,
//!   `document`, `navigator`, storage, timers and `XMLHttpRequest`
//! - **Injection** - the script is evaluated once
//! - **Polling** - the completion accessor is probed until it returns a
//!   non-empty string, while timers fire and requests complete
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devid::Sandbox;
//! use std::path::Path;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), devid::Error> {
//!     let sandbox = Sandbox::builder().build();
//!     let id = sandbox.run_file(Path::new("sm.js")).await?;
//!     println!("{id}");
//!     Ok(())
//! }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod element;
mod error;
pub mod globals;
pub mod network;
pub mod profile;
mod sandbox;
pub mod store;
pub mod timers;

pub use config::ServiceConfig;
pub use error::Error;
pub use network::{NetworkConfig, NetworkConfigBuilder, TransportError};
pub use profile::{EnvironmentProfile, ProfileInputs, RefererLocation};
pub use sandbox::{
    DEFAULT_ACCESSOR, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT, ResourceLimits, Sandbox,
    SandboxBuilder,
};
pub use store::{BrowserState, KeyValueStore};
