//! Client configuration.

use std::time::Duration;

use zipline_core::auth::Credential;
use zipline_proto::{Metadata, StreamType, Tag};

/// How the reconnect supervisor retries after a disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait between attempts
    pub interval: Duration,
    /// Give up after this many consecutive failures (`None` retries forever)
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self { interval: Duration::ZERO, max_attempts: Some(0) }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { interval: Duration::from_secs(1), max_attempts: None }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name announced in the handshake
    pub name: String,
    /// Client id; a random one is generated when empty
    pub id: String,
    /// Role of this client
    pub stream_type: StreamType,
    /// Tags to receive (data for stream functions, backflow for sources)
    pub observe_data_tags: Vec<Tag>,
    /// Credential presented to the server
    pub credential: Credential,
    /// Authenticate with a separate exchange before the handshake
    pub separate_auth: bool,
    /// Only receive data targeted at this value
    pub wanted_target: Option<String>,
    /// Metadata announced in the handshake and attached to written data
    pub metadata: Metadata,
    /// Protocol version string announced in the handshake
    pub version: String,
    /// Bound on the whole handshake exchange
    pub handshake_timeout: Duration,
    /// Close if nothing arrives for this long
    pub idle_timeout: Option<Duration>,
    /// Reconnect behavior
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// A source named `name`.
    pub fn source(name: impl Into<String>) -> Self {
        Self { name: name.into(), stream_type: StreamType::Source, ..Self::default() }
    }

    /// A stream function named `name` observing `tags`.
    pub fn stream_function(name: impl Into<String>, tags: impl Into<Vec<Tag>>) -> Self {
        Self {
            name: name.into(),
            stream_type: StreamType::StreamFunction,
            observe_data_tags: tags.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            id: String::new(),
            stream_type: StreamType::Source,
            observe_data_tags: Vec::new(),
            credential: Credential::none(),
            separate_auth: false,
            wanted_target: None,
            metadata: Metadata::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}
