//! # mirror-daemon: screen mirroring daemon
//!
//! Serves remote viewers over TCP using the `mirror-core` session
//! plane. A synthetic capture source stands in for the hardware
//! encoder, and a console surface plays the UI thread.
//!
//! ## Modules
//!
//! - [`wire`]: `MRR0` packet framing and typed messages
//! - [`transport`]: `SessionTransport` over a split `TcpStream`
//! - [`backend`]: zstd test-pattern `EncoderBackend`
//! - [`service`]: accept loop, slice tick, IP reconfiguration
//! - [`console`]: headless UI surface
//! - [`netcfg`]: socket to the network-configuration daemon
//! - [`config`]: TOML configuration

pub mod backend;
pub mod config;
pub mod console;
pub mod error;
pub mod netcfg;
pub mod service;
pub mod transport;
pub mod wire;

pub use error::DaemonError;
