//! XMPP addresses.
//!
//! The address types come from the `jid` crate; this module adds the
//! parsing and comparison helpers the session core and plugins share.

pub use jid::{BareJid, FullJid, Jid};

use crate::error::JidError;

pub fn parse_jid(raw: &str) -> Result<Jid, JidError> {
    Jid::new(raw).map_err(|source| JidError::new(raw, source))
}

/// Parse and drop any resource.
pub fn parse_bare_jid(raw: &str) -> Result<BareJid, JidError> {
    parse_jid(raw).map(Jid::into_bare)
}

/// Whether two addresses name the same account, ignoring resources.
pub fn same_bare(a: &Jid, b: &Jid) -> bool {
    a.node() == b.node() && a.domain() == b.domain()
}
