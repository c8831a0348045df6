use minidom::Element;
use thiserror::Error;
use xmpp_parsers::stanza_error::StanzaError;

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("connection timeout")]
    Timeout,

    #[error("transport error: {0}")]
    TransportError(String),
}

impl ConnectionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ConnectionError::AuthenticationFailed(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("stanza parse failed: {0}")]
    ParseFailed(String),

    #[error("stanza serialization failed: {0}")]
    SerializeFailed(String),
}

/// A string that is not a valid JID. Keeps the parser's reason as text so
/// the error stays `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed JID {input:?}: {reason}")]
pub struct JidError {
    pub input: String,
    pub reason: String,
}

impl JidError {
    pub fn new(input: &str, source: jid::Error) -> Self {
        Self {
            input: input.to_string(),
            reason: source.to_string(),
        }
    }
}

/// Errors surfaced by the session core.
#[derive(Debug, Clone, Error)]
pub enum XmppError {
    #[error("not connected")]
    NotConnected,

    #[error("a login is already in progress")]
    AlreadyConnecting,

    #[error("session is already online")]
    AlreadyOnline,

    /// The peer answered a request with a stanza of type `error`.
    #[error("request failed: {}", describe_stanza_error(.0))]
    Protocol(StanzaError),

    #[error("connection lost")]
    ConnectionLost,

    #[error("roster push from unauthorized entity {from}")]
    UnauthorizedPush { from: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    InvalidJid(#[from] JidError),

    #[error("plugin {plugin} failed: {message}")]
    Plugin { plugin: String, message: String },
}

/// Render a stanza error as `condition (type)` plus the first non-empty text.
pub fn describe_stanza_error(error: &StanzaError) -> String {
    let condition = Element::from(error.defined_condition.clone());
    let mut out = format!("{} ({})", condition.name(), error.type_);
    if let Some(text) = error.texts.values().find(|text| !text.is_empty()) {
        out.push_str(": ");
        out.push_str(text);
    }
    out
}

#[cfg(test)]
mod tests {
    use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType};

    use super::*;

    #[test]
    fn only_authentication_failures_are_final() {
        assert!(!ConnectionError::AuthenticationFailed("bad password".into()).is_retryable());
        assert!(ConnectionError::Timeout.is_retryable());
        assert!(ConnectionError::StreamError("reset".into()).is_retryable());
    }

    #[test]
    fn stanza_error_display_includes_text() {
        let error = StanzaError::new(
            ErrorType::Cancel,
            DefinedCondition::ItemNotFound,
            "en",
            "no such roster item",
        );
        assert_eq!(
            XmppError::Protocol(error).to_string(),
            "request failed: item-not-found (cancel): no such roster item"
        );
    }

    #[test]
    fn empty_text_is_left_out() {
        let error = StanzaError::new(ErrorType::Auth, DefinedCondition::NotAuthorized, "en", "");
        assert_eq!(describe_stanza_error(&error), "not-authorized (auth)");
    }

    #[test]
    fn jid_error_keeps_input_and_reason() {
        let error = JidError::new("@example.com", jid::Error::NodeEmpty);
        assert_eq!(error.input, "@example.com");
        assert!(error.to_string().starts_with("malformed JID \"@example.com\": "));
    }
}
