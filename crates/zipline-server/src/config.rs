//! Zipper configuration.

use std::{collections::BTreeSet, time::Duration};

use zipline_core::{RouterMode, auth::AuthRegistry};

/// Configuration of one zipper.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name of this zipper, announced to downstreams
    pub name: String,
    /// Bound on authentication plus handshake
    pub handshake_timeout: Duration,
    /// Close connections that send nothing for this long
    pub idle_timeout: Option<Duration>,
    /// Stream function names allowed to register; empty allows any name and
    /// lets several connections share one
    pub functions: Vec<String>,
    /// Authenticators; empty disables authentication
    pub auths: AuthRegistry,
    /// Answer every handshake with a redirect to this endpoint
    pub redirect_to: Option<String>,
}

impl ServerConfig {
    /// Router policy implied by [`ServerConfig::functions`].
    pub fn router_mode(&self) -> RouterMode {
        if self.functions.is_empty() {
            RouterMode::Open
        } else {
            RouterMode::Workflow(self.functions.iter().cloned().collect::<BTreeSet<_>>())
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "zipper".to_string(),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: None,
            functions: Vec::new(),
            auths: AuthRegistry::new(),
            redirect_to: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functions_select_workflow_mode() {
        let mut config = ServerConfig::default();
        assert_eq!(config.router_mode(), RouterMode::Open);

        config.functions = vec!["sfn-2".into(), "sfn-1".into()];
        let RouterMode::Workflow(names) = config.router_mode() else {
            unreachable!("expected workflow mode");
        };
        assert_eq!(names.into_iter().collect::<Vec<_>>(), ["sfn-1", "sfn-2"]);
    }
}
