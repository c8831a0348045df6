use tern_xmpp::{JidError, XmppError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RosterError {
    #[error(transparent)]
    Xmpp(#[from] XmppError),

    #[error("invalid contact JID: {0}")]
    InvalidJid(#[from] JidError),
}

pub type Result<T> = std::result::Result<T, RosterError>;
