use async_trait::async_trait;

use crate::{error::ConnectionError, jid::Jid};

/// Everything a transport needs to open and authenticate a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub username: String,
    pub domain: String,
    pub password: String,
    /// Endpoint URL; transports fall back to discovery when absent.
    pub service: Option<String>,
    /// Requested resource; the server may assign a different one.
    pub resource: Option<String>,
    pub timeout_seconds: u32,
}

/// A bidirectional stanza stream.
///
/// `connect` performs stream negotiation, authentication and resource
/// binding, returning the bound full JID. Afterwards `recv` yields exactly
/// one stanza frame per call; an error from `recv` means the stream is gone.
/// `send` and `recv` borrow `&self` so one task can read while another writes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait XmppTransport: Send + Sync + 'static {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Jid, ConnectionError>;

    async fn send(&self, data: &[u8]) -> Result<(), ConnectionError>;

    async fn recv(&self) -> Result<Vec<u8>, ConnectionError>;

    async fn close(&self) -> Result<(), ConnectionError>;
}
