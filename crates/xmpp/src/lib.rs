//! Session core of an XMPP client.
//!
//! A [`Connection`] owns a pluggable [`XmppTransport`], correlates requests
//! with their responses, dispatches inbound stanzas to registered handlers,
//! and drives the [`ConnectionState`] lifecycle. Protocol extensions attach
//! through [`PluginLifecycle`].

pub mod connection;
pub mod error;
pub mod handler;
pub mod jid;
pub mod plugin;
pub mod session;
pub mod stanza;
pub mod transport;

pub use connection::{Connection, WeakConnection};
pub use error::{ConnectionError, JidError, PipelineError, XmppError, describe_stanza_error};
pub use handler::{DispatchOutcome, HandlerOptions, HandlerRef, HandlerRegistry, Matcher};
pub use self::jid::{BareJid, FullJid, Jid, parse_bare_jid, parse_jid, same_bare};
pub use plugin::PluginLifecycle;
pub use session::{ConnectionState, LogInRequest};
pub use stanza::{
    Stanza, StanzaBuilder, StanzaExt, build_iq_error, build_iq_result, parse_stanza,
    plain_stanza_error, serialize_stanza,
};
pub use transport::{ConnectionConfig, XmppTransport};

pub use xmpp_parsers::ns;
pub use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};
