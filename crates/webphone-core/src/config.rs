//! Softphone configuration
//!
//! [`SoftphoneConfig`] carries everything the user agent needs to open a
//! signaling connection and register: credentials, the registrar domain, the
//! WebSocket signaling endpoint and the ICE servers handed to every peer
//! transport.
//!
//! The control plane issues this configuration as a JSON document, so the type
//! deserializes from the camelCase shape that API produces, including the
//! legacy `websocket` and `stunServer` fields.
//!
//! # Examples
//!
//! ```rust
//! use webphone_core::{IceServer, SoftphoneConfig};
//!
//! let config = SoftphoneConfig::new("user42", "pbx.example.com", "wss://pbx.example.com:8088/ws")
//!     .with_password("secret")
//!     .with_display_name("Front Desk")
//!     .with_ice_server(IceServer::turn("turn:turn.example.com:3478", "webphone", "s3cret"));
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.identity_uri(), "sip:user42@pbx.example.com");
//! assert_eq!(config.resolve_target("5551234"), "sip:5551234@pbx.example.com");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SoftphoneError, SoftphoneResult};

/// STUN server used when the configuration names none
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Registration expiry used when the configuration names none
pub const DEFAULT_REGISTRATION_EXPIRY: u32 = 300;

/// A STUN or TURN server handed to the peer transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URL, e.g. `stun:stun.example.com:3478` or `turn:turn.example.com:3478`
    #[serde(alias = "urls")]
    pub url: String,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// A TURN server with long-term credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Whether this entry points at a relay (TURN) server
    pub fn is_turn(&self) -> bool {
        self.url.starts_with("turn:") || self.url.starts_with("turns:")
    }

    fn validate(&self) -> SoftphoneResult<()> {
        const SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

        if !SCHEMES.iter().any(|scheme| self.url.starts_with(scheme)) {
            return Err(SoftphoneError::config(format!(
                "ICE server URL '{}' must use a stun:, stuns:, turn: or turns: scheme",
                self.url
            )));
        }
        if self.is_turn() && (self.username.is_none() || self.credential.is_none()) {
            return Err(SoftphoneError::config(format!(
                "TURN server '{}' requires a username and credential",
                self.url
            )));
        }
        Ok(())
    }
}

/// Softphone configuration bound to one connection attempt
///
/// Immutable once passed to [`UserAgent::connect`](crate::UserAgent::connect);
/// a later `connect` replaces it entirely.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftphoneConfig {
    /// Display name presented to callees; falls back to the username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// SIP user part used for the identity and authentication
    pub username: String,

    /// Authentication password
    #[serde(default)]
    pub password: String,

    /// SIP domain of the registrar
    pub domain: String,

    /// WebSocket signaling endpoint (`ws://` or `wss://`)
    #[serde(alias = "websocket")]
    pub signaling_uri: String,

    /// Ordered ICE servers for the peer transport
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,

    /// Registration expiry in seconds
    #[serde(default = "default_registration_expiry")]
    pub registration_expiry_seconds: u32,

    /// Single STUN server as issued by older control-plane versions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stun_server: Option<String>,

    /// Whether the UI should connect as soon as the configuration arrives
    #[serde(default)]
    pub auto_connect: bool,

    /// Validity flag set by the control plane
    #[serde(default, skip_serializing)]
    valid: Option<bool>,
}

fn default_registration_expiry() -> u32 {
    DEFAULT_REGISTRATION_EXPIRY
}

impl SoftphoneConfig {
    /// Create a configuration with default expiry and ICE servers
    pub fn new(
        username: impl Into<String>,
        domain: impl Into<String>,
        signaling_uri: impl Into<String>,
    ) -> Self {
        Self {
            display_name: None,
            username: username.into(),
            password: String::new(),
            domain: domain.into(),
            signaling_uri: signaling_uri.into(),
            ice_servers: Vec::new(),
            registration_expiry_seconds: DEFAULT_REGISTRATION_EXPIRY,
            stun_server: None,
            auto_connect: false,
            valid: None,
        }
    }

    /// Decode the softphone configuration document issued by the control plane
    ///
    /// Rejects documents the control plane flagged with `"valid": false`.
    ///
    /// ```rust
    /// use webphone_core::SoftphoneConfig;
    ///
    /// let json = r#"{
    ///     "displayName": "User 42",
    ///     "username": "user42",
    ///     "password": "password123",
    ///     "domain": "pbx.example.com",
    ///     "websocket": "wss://pbx.example.com:8088/ws",
    ///     "stunServer": "stun:stun.l.google.com:19302",
    ///     "autoConnect": true,
    ///     "valid": true
    /// }"#;
    ///
    /// let config = SoftphoneConfig::from_json(json).unwrap();
    /// assert_eq!(config.signaling_uri, "wss://pbx.example.com:8088/ws");
    /// assert_eq!(config.ice_servers.len(), 1);
    /// assert!(config.auto_connect);
    /// ```
    pub fn from_json(json: &str) -> SoftphoneResult<Self> {
        let mut config: Self = serde_json::from_str(json)
            .map_err(|e| SoftphoneError::config(format!("malformed softphone config: {e}")))?;

        if config.valid == Some(false) {
            return Err(SoftphoneError::config(
                "control plane marked the softphone config as invalid",
            ));
        }

        if config.ice_servers.is_empty() {
            if let Some(stun) = config.stun_server.take() {
                config.ice_servers.push(IceServer::stun(stun));
            }
        }

        Ok(config)
    }

    /// Set the display name
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    /// Set the authentication password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Append an ICE server
    pub fn with_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    /// Replace the ICE server list
    pub fn with_ice_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.ice_servers = servers;
        self
    }

    /// Set the registration expiry
    pub fn with_registration_expiry(mut self, seconds: u32) -> Self {
        self.registration_expiry_seconds = seconds;
        self
    }

    /// Check the configuration before any connection is attempted
    pub fn validate(&self) -> SoftphoneResult<()> {
        if self.username.trim().is_empty() {
            return Err(SoftphoneError::config("username is required"));
        }
        if self.domain.trim().is_empty() {
            return Err(SoftphoneError::config("domain is required"));
        }
        if self.registration_expiry_seconds == 0 {
            return Err(SoftphoneError::config(
                "registration expiry must be greater than zero",
            ));
        }

        let uri = Url::parse(&self.signaling_uri).map_err(|e| {
            SoftphoneError::config(format!(
                "signaling URI '{}' is not a valid URL: {e}",
                self.signaling_uri
            ))
        })?;
        if !matches!(uri.scheme(), "ws" | "wss") {
            return Err(SoftphoneError::config(format!(
                "signaling URI must use ws:// or wss://, got {}://",
                uri.scheme()
            )));
        }

        for server in &self.ice_servers {
            server.validate()?;
        }

        Ok(())
    }

    /// Display name presented to remote parties
    pub fn display_name(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.username)
    }

    /// Signaling identity, `sip:{username}@{domain}`
    pub fn identity_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.domain)
    }

    /// ICE servers to hand the transport, with the legacy and default fallbacks applied
    pub fn effective_ice_servers(&self) -> Vec<IceServer> {
        if !self.ice_servers.is_empty() {
            return self.ice_servers.clone();
        }
        let url = self.stun_server.as_deref().unwrap_or(DEFAULT_STUN_SERVER);
        vec![IceServer::stun(url)]
    }

    /// Turn a dialed number or user into a SIP URI in this domain
    ///
    /// Targets that already carry a `sip:` or `sips:` scheme pass through.
    pub fn resolve_target(&self, target: &str) -> String {
        let target = target.trim();
        if target.starts_with("sip:") || target.starts_with("sips:") {
            target.to_string()
        } else {
            format!("sip:{}@{}", target, self.domain)
        }
    }
}

impl fmt::Debug for SoftphoneConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftphoneConfig")
            .field("display_name", &self.display_name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .field("signaling_uri", &self.signaling_uri)
            .field("ice_servers", &self.ice_servers.len())
            .field("registration_expiry_seconds", &self.registration_expiry_seconds)
            .field("auto_connect", &self.auto_connect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SoftphoneConfig {
        SoftphoneConfig::new("user42", "pbx.example.com", "wss://pbx.example.com:8088/ws")
            .with_password("secret")
    }

    #[test]
    fn defaults_follow_control_plane_conventions() {
        let config = config();
        assert_eq!(config.registration_expiry_seconds, 300);
        assert_eq!(config.display_name(), "user42");
        assert_eq!(
            config.effective_ice_servers(),
            vec![IceServer::stun(DEFAULT_STUN_SERVER)]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_display_name_falls_back_to_username() {
        let config = config().with_display_name("");
        assert_eq!(config.display_name(), "user42");
    }

    #[test]
    fn rejects_non_websocket_signaling_uri() {
        let config = SoftphoneConfig::new("user42", "pbx.example.com", "https://pbx.example.com");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SoftphoneError::InvalidConfiguration { .. }));

        let config = SoftphoneConfig::new("user42", "pbx.example.com", "not a url");
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_identity() {
        let config = SoftphoneConfig::new("", "pbx.example.com", "wss://pbx.example.com/ws");
        assert!(config.validate().is_err());

        let config = SoftphoneConfig::new("user42", " ", "wss://pbx.example.com/ws");
        assert!(config.validate().is_err());

        let config = self::config().with_registration_expiry(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn turn_servers_need_credentials() {
        let config = config().with_ice_server(IceServer::stun("turn:turn.example.com:3478"));
        assert!(config.validate().is_err());

        let config = self::config()
            .with_ice_server(IceServer::turn("turn:turn.example.com:3478", "u", "p"));
        assert!(config.validate().is_ok());

        let config = self::config().with_ice_server(IceServer::stun("http://stun.example.com"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn resolves_dial_targets() {
        let config = config();
        assert_eq!(config.resolve_target("5551234"), "sip:5551234@pbx.example.com");
        assert_eq!(config.resolve_target(" 200 "), "sip:200@pbx.example.com");
        assert_eq!(
            config.resolve_target("sip:alice@other.example.com"),
            "sip:alice@other.example.com"
        );
    }

    #[test]
    fn decodes_control_plane_document() {
        let json = r#"{
            "displayName": "Usuario 42",
            "username": "user42",
            "password": "password123",
            "domain": "pbx.example.com",
            "websocket": "wss://pbx.example.com:8088/ws",
            "stunServer": "stun:stun.example.com:3478",
            "autoConnect": true,
            "valid": true
        }"#;

        let config = SoftphoneConfig::from_json(json).unwrap();
        assert_eq!(config.display_name(), "Usuario 42");
        assert_eq!(config.signaling_uri, "wss://pbx.example.com:8088/ws");
        assert_eq!(config.ice_servers, vec![IceServer::stun("stun:stun.example.com:3478")]);
        assert_eq!(config.registration_expiry_seconds, 300);
        assert!(config.auto_connect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn decodes_ice_server_urls_alias() {
        let json = r#"{
            "username": "user42",
            "domain": "pbx.example.com",
            "signalingUri": "wss://pbx.example.com/ws",
            "iceServers": [
                { "urls": "stun:stun1.example.com:19302" },
                { "url": "turn:turn.example.com:3478", "username": "u", "credential": "p" }
            ],
            "registrationExpirySeconds": 600
        }"#;

        let config = SoftphoneConfig::from_json(json).unwrap();
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.ice_servers[1].is_turn());
        assert_eq!(config.registration_expiry_seconds, 600);
    }

    #[test]
    fn rejects_documents_marked_invalid() {
        let json = r#"{
            "username": "user42",
            "domain": "pbx.example.com",
            "websocket": "wss://pbx.example.com/ws",
            "valid": false
        }"#;
        assert!(SoftphoneConfig::from_json(json).is_err());
        assert!(SoftphoneConfig::from_json("{").is_err());
    }

    #[test]
    fn debug_output_redacts_password() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("secret"));
    }
}
