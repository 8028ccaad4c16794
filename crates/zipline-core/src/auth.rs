//! Authentication collaborators.
//!
//! Clients present a credential as `"name:payload"`. The server looks up the
//! [`Authentication`] registered under `name` and hands it the payload. An
//! empty [`AuthRegistry`] accepts everyone.
//!
//! After authentication, a [`MetadataBuilder`] produces the connection
//! metadata that the router and dispatcher see.

use std::{collections::HashMap, fmt, sync::Arc};

use zipline_proto::{HandshakeFrame, Metadata, ProtocolError, TARGET_KEY};

use crate::error::AuthError;

/// Credential name used when the client supplies none.
pub const NONE_CREDENTIAL: &str = "none";

/// A credential checker, registered by name.
pub trait Authentication: Send + Sync + 'static {
    /// Name clients use to select this authenticator.
    fn name(&self) -> &str;

    /// Check `payload`. `Some` carries metadata to attach to the connection.
    fn authenticate(&self, payload: &str) -> Option<Metadata>;
}

/// Shared-secret authentication: the payload must equal the token.
#[derive(Clone)]
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    /// Accept exactly `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuth").field("token", &"<redacted>").finish()
    }
}

impl Authentication for TokenAuth {
    fn name(&self) -> &str {
        "token"
    }

    fn authenticate(&self, payload: &str) -> Option<Metadata> {
        (payload == self.token).then(Metadata::new)
    }
}

/// Client credential, split into authenticator name and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    name: String,
    payload: String,
}

impl Credential {
    /// Parse `"name:payload"`. A string without `:` is the `none` credential.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some((name, payload)) => Self { name: name.to_string(), payload: payload.to_string() },
            None => Self::none(),
        }
    }

    /// The empty credential.
    pub fn none() -> Self {
        Self { name: NONE_CREDENTIAL.to_string(), payload: String::new() }
    }

    /// Authenticator name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload handed to the authenticator.
    pub fn payload(&self) -> &str {
        &self.payload
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self::none()
    }
}

/// Authenticators keyed by name.
#[derive(Clone, Default)]
pub struct AuthRegistry {
    auths: HashMap<String, Arc<dyn Authentication>>,
}

impl AuthRegistry {
    /// Registry that requires no authentication.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `auth` under its name, replacing any previous one.
    pub fn register(&mut self, auth: impl Authentication) {
        self.auths.insert(auth.name().to_string(), Arc::new(auth));
    }

    /// Whether any authenticator is registered.
    pub fn is_required(&self) -> bool {
        !self.auths.is_empty()
    }

    /// Check a credential. With nothing registered every credential passes.
    pub fn authenticate(&self, name: &str, payload: &str) -> Result<Metadata, AuthError> {
        if self.auths.is_empty() {
            return Ok(Metadata::new());
        }
        let auth = self.auths.get(name).ok_or_else(|| AuthError::NotFound { name: name.to_string() })?;
        auth.authenticate(payload).ok_or_else(|| AuthError::Refused { name: name.to_string() })
    }
}

impl fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.auths.keys().collect();
        names.sort();
        f.debug_struct("AuthRegistry").field("auths", &names).finish()
    }
}

/// Builds connection metadata once a handshake is accepted.
pub trait MetadataBuilder: Send + Sync + 'static {
    /// Metadata for the sender of `handshake`, given what authentication
    /// produced.
    fn build(&self, handshake: &HandshakeFrame, auth: Metadata) -> Result<Metadata, ProtocolError>;
}

/// Handshake metadata, overlaid by authentication metadata, plus the wanted
/// target under [`TARGET_KEY`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMetadataBuilder;

impl MetadataBuilder for DefaultMetadataBuilder {
    fn build(&self, handshake: &HandshakeFrame, auth: Metadata) -> Result<Metadata, ProtocolError> {
        let mut metadata = Metadata::decode(&handshake.metadata)?;
        metadata.merge(&auth);
        if !handshake.wanted_target.is_empty() {
            metadata.set(TARGET_KEY, handshake.wanted_target.clone());
        }
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_parsing() {
        let credential = Credential::parse("token:the-token");
        assert_eq!(credential.name(), "token");
        assert_eq!(credential.payload(), "the-token");

        let credential = Credential::parse("token:a:b");
        assert_eq!(credential.payload(), "a:b");

        assert_eq!(Credential::parse("no-colon"), Credential::none());
        assert_eq!(Credential::parse("").name(), NONE_CREDENTIAL);
    }

    #[test]
    fn empty_registry_allows_everyone() {
        let registry = AuthRegistry::new();
        assert!(!registry.is_required());
        assert_eq!(registry.authenticate("none", ""), Ok(Metadata::new()));
    }

    #[test]
    fn token_auth() {
        let mut registry = AuthRegistry::new();
        registry.register(TokenAuth::new("secret"));

        assert!(registry.authenticate("token", "secret").is_ok());
        assert_eq!(
            registry.authenticate("token", "wrong"),
            Err(AuthError::Refused { name: "token".into() })
        );
        assert_eq!(registry.authenticate("none", ""), Err(AuthError::NotFound { name: "none".into() }));
    }

    #[test]
    fn token_is_not_printed() {
        assert!(!format!("{:?}", TokenAuth::new("secret")).contains("secret"));
    }

    #[test]
    fn default_builder_merges_sources() {
        let mut declared = Metadata::new();
        declared.set("region", "eu");
        declared.set("role", "guest");
        let handshake = HandshakeFrame {
            metadata: declared.encode().unwrap(),
            wanted_target: "user-1".into(),
            ..Default::default()
        };
        let mut auth = Metadata::new();
        auth.set("role", "admin");

        let metadata = DefaultMetadataBuilder.build(&handshake, auth).unwrap();
        assert_eq!(metadata.get("region"), Some("eu"));
        assert_eq!(metadata.get("role"), Some("admin"));
        assert_eq!(metadata.target(), Some("user-1"));
    }

    #[test]
    fn default_builder_rejects_garbage_metadata() {
        let handshake = HandshakeFrame { metadata: vec![0xff, 0x00].into(), ..Default::default() };
        assert!(DefaultMetadataBuilder.build(&handshake, Metadata::new()).is_err());
    }
}
