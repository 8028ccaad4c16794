//! Deterministic simulation harness for zipline.
//!
//! Turmoil-based implementations of the [`Environment`](zipline_core::Environment)
//! and [`Transport`](zipline_core::transport::Transport) traits, so the real
//! zipper and client run unmodified under simulated latency, loss, and
//! virtual time. Also carries the router reference model used by property
//! tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod model;
pub mod sim_env;
pub mod sim_transport;

use std::sync::Arc;

pub use model::{RouterModel, RouterOp, RouterOutcome, apply_to_router};
pub use sim_env::SimEnv;
pub use sim_transport::{SimConnection, SimTransport};
use zipline_client::{Client, ClientConfig};
use zipline_server::{Server, ServerConfig};

/// Port every simulated zipper listens on.
pub const ZIPPER_PORT: u16 = 9000;

/// Run a zipper inside the current turmoil host until its listener closes.
pub async fn serve_zipper(config: ServerConfig, seed: u64) -> turmoil::Result {
    let transport = SimTransport::bind(&format!("0.0.0.0:{ZIPPER_PORT}")).await?;
    let server = Arc::new(Server::new(transport, SimEnv::with_seed(seed), config));
    server.serve().await?;
    Ok(())
}

/// Client inside the current turmoil host.
pub fn sim_client(config: ClientConfig, seed: u64) -> Client<SimTransport, SimEnv> {
    Client::new(SimTransport::dialer(), SimEnv::with_seed(seed), config)
}

/// Address of the zipper running on turmoil host `host`.
pub fn zipper_addr(host: &str) -> String {
    format!("{host}:{ZIPPER_PORT}")
}
