//! Zipline core: connections, registry, and routing
//!
//! Everything between the frame codec and the server or client control loops
//! lives here. Nothing in this crate spawns long-lived tasks or owns a
//! listener; the server and client crates drive these pieces.
//!
//! # Architecture
//!
//! A [`transport::Transport`] yields multiplexed connections. Each zipline
//! peer uses one bidirectional stream per connection, wrapped in a
//! [`frame_conn::FrameConn`] that reads and writes whole frames and folds
//! every way a connection can end into one closed-error with a recorded
//! cause.
//!
//! Registered peers become [`connection::Connection`]s and are tracked by two
//! shared services with internal locking:
//!
//! - the [`connector::Connector`] knows which connections exist
//! - the [`router::Router`] knows who subscribes to which tag
//!
//! Time and randomness come from an [`env::Environment`] so the simulation
//! harness can substitute a seeded one.
//!
//! # Components
//!
//! - [`auth`]: Credentials, authenticators, metadata builders
//! - [`connection`]: Registered connection and its handshake identity
//! - [`connector`]: Connection registry
//! - [`mod@env`]: Environment abstraction (time, RNG)
//! - [`error`]: Closed, registry, routing, and auth errors
//! - [`frame_conn`]: Frame channel with close semantics
//! - [`router`]: Tag router and load-balance selection
//! - [`transport`]: Transport abstraction (in-memory and QUIC)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod connection;
pub mod connector;
pub mod env;
pub mod error;
pub mod frame_conn;
pub mod router;
pub mod transport;

pub use connection::{Connection, ConnectionInfo, Peer};
pub use connector::Connector;
pub use env::{Environment, SystemEnv};
pub use error::{AuthError, CloseCode, ConnClosed, ConnectionError, RegistryError, RouteError};
pub use frame_conn::{ConnContext, FrameConn, FrameConnConfig};
pub use router::{Registration, Router, RouterMode};
