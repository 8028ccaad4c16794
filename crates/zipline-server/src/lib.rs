//! Zipline zipper
//!
//! The zipper is the broker of the dispatch fabric. Sources and stream
//! functions connect to it, authenticate, and register; the zipper then routes
//! every data frame to the stream functions observing its tag and routes
//! backflow to the sources waiting for it.
//!
//! # Components
//!
//! - [`server`]: Accept loop, handshake, serving loop, dispatch
//! - [`config`]: Server configuration
//! - [`downstream`]: Mesh mirroring to other zippers
//! - [`error`]: Server error types
//!
//! The server is generic over [`Transport`](zipline_core::transport::Transport)
//! and [`Environment`](zipline_core::Environment): the binary runs it on QUIC,
//! tests on the in-memory transport, and the simulation harness on turmoil.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod downstream;
pub mod error;
pub mod server;

pub use config::ServerConfig;
pub use downstream::{ClientDownstream, Downstream};
pub use error::ServerError;
pub use server::Server;
