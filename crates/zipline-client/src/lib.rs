//! Zipline client
//!
//! Connects sources, stream functions, and upstream zippers to a zipper.
//!
//! A source writes tagged data and receives backflow:
//!
//! ```no_run
//! # use zipline_client::{Client, ClientConfig};
//! # use zipline_core::{SystemEnv, transport::MemTransport};
//! # async fn run(transport: MemTransport) -> Result<(), zipline_client::ClientError> {
//! let mut config = ClientConfig::source("src-1");
//! config.observe_data_tags = vec![0x61];
//! let source = Client::new(transport, SystemEnv, config);
//! source.set_backflow_handler(|tag, data| tracing::info!(tag, len = data.len(), "backflow"));
//! source.connect("127.0.0.1:9000").await?;
//! source.write(0x10, "hello").await?;
//! # Ok(())
//! # }
//! ```
//!
//! A stream function observes tags and answers through its [`Context`]:
//!
//! ```no_run
//! # use zipline_client::{Client, ClientConfig};
//! # use zipline_core::{SystemEnv, transport::MemTransport};
//! # async fn run(transport: MemTransport) -> Result<(), zipline_client::ClientError> {
//! let sfn = Client::new(transport, SystemEnv, ClientConfig::stream_function("sfn-1", [0x10]));
//! sfn.set_data_handler(|ctx| async move {
//!     let _ = ctx.write_backflow(0x61, ctx.data().clone()).await;
//! });
//! sfn.connect("127.0.0.1:9000").await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod context;
pub mod error;

pub use client::{BoxFuture, Client, ClientState};
pub use config::{ClientConfig, ReconnectPolicy};
pub use context::Context;
pub use error::ClientError;
pub use zipline_core::auth::Credential;
