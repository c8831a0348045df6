use std::borrow::Cow;
use std::collections::BTreeMap;
use std::str::FromStr;

use minidom::{Element, ElementBuilder};
use xmpp_parsers::ns;
use xmpp_parsers::stanza_error::{DefinedCondition, ErrorType, StanzaError};

use crate::{
    connection::WeakConnection,
    error::{PipelineError, XmppError},
    jid::{Jid, parse_jid},
};

/// A top-level `<iq/>`, `<message/>` or `<presence/>` element.
pub type Stanza = Element;

const STANZA_NAMES: [&str; 3] = ["iq", "message", "presence"];

/// Parse one inbound frame into a stanza.
///
/// Frames cut out of a `jabber:client` stream usually omit the inherited
/// default namespace; it is restored before parsing.
pub fn parse_stanza(raw: &[u8]) -> Result<Stanza, PipelineError> {
    let xml = std::str::from_utf8(raw).map_err(|error| {
        PipelineError::ParseFailed(format!("invalid UTF-8 stanza bytes: {error}"))
    })?;
    let trimmed = xml.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::ParseFailed(
            "stanza payload is empty".to_string(),
        ));
    }

    let element = Element::from_str(&with_default_namespace(trimmed)).map_err(|error| {
        PipelineError::ParseFailed(format!("failed to parse stanza XML: {error}"))
    })?;

    if !STANZA_NAMES.contains(&element.name()) {
        return Err(PipelineError::ParseFailed(format!(
            "unsupported stanza element <{}/>",
            element.name()
        )));
    }
    Ok(element)
}

pub fn serialize_stanza(stanza: &Stanza) -> Result<Vec<u8>, PipelineError> {
    let mut payload = Vec::new();
    stanza.write_to(&mut payload).map_err(|error| {
        PipelineError::SerializeFailed(format!(
            "failed to serialize <{}/> stanza: {error}",
            stanza.name()
        ))
    })?;
    Ok(payload)
}

fn with_default_namespace(xml: &str) -> Cow<'_, str> {
    match scan_start_tag(xml) {
        Some((name_end, false)) => Cow::Owned(format!(
            "{} xmlns='{}'{}",
            &xml[..name_end],
            ns::JABBER_CLIENT,
            &xml[name_end..]
        )),
        _ => Cow::Borrowed(xml),
    }
}

/// Walk the attributes of the leading start tag. Returns the byte offset
/// where the element name ends and whether an `xmlns` attribute is present,
/// or `None` when the tag is not well formed.
fn scan_start_tag(xml: &str) -> Option<(usize, bool)> {
    let body = xml.strip_prefix('<')?;
    let name_len = body.find(|c: char| c.is_whitespace() || c == '/' || c == '>')?;
    if name_len == 0 {
        return None;
    }
    let name_end = 1 + name_len;
    let mut rest = &xml[name_end..];
    loop {
        rest = rest.trim_start();
        if rest.starts_with('>') || rest.starts_with("/>") {
            return Some((name_end, false));
        }
        let attr_len = rest.find(|c: char| c.is_whitespace() || c == '=')?;
        let (attr, after) = rest.split_at(attr_len);
        let value = after.trim_start().strip_prefix('=')?.trim_start();
        let quote = value.chars().next().filter(|c| matches!(c, '\'' | '"'))?;
        let close = value[1..].find(quote)?;
        if attr == "xmlns" {
            return Some((name_end, true));
        }
        rest = &value[close + 2..];
    }
}

/// Attribute and payload accessors shared by every stanza kind.
pub trait StanzaExt {
    fn stanza_type(&self) -> Option<&str>;
    fn stanza_id(&self) -> Option<&str>;
    fn from_jid(&self) -> Option<Jid>;
    fn to_jid(&self) -> Option<Jid>;
    /// Whether the stanza or one of its direct children is in `namespace`.
    fn has_payload_ns(&self, namespace: &str) -> bool;
    /// The error carried by a stanza of type `error`.
    fn stanza_error(&self) -> Option<StanzaError>;
}

impl StanzaExt for Element {
    fn stanza_type(&self) -> Option<&str> {
        self.attr("type")
    }

    fn stanza_id(&self) -> Option<&str> {
        self.attr("id")
    }

    fn from_jid(&self) -> Option<Jid> {
        self.attr("from").and_then(|raw| parse_jid(raw).ok())
    }

    fn to_jid(&self) -> Option<Jid> {
        self.attr("to").and_then(|raw| parse_jid(raw).ok())
    }

    fn has_payload_ns(&self, namespace: &str) -> bool {
        self.ns() == namespace || self.children().any(|child| child.ns() == namespace)
    }

    fn stanza_error(&self) -> Option<StanzaError> {
        if self.stanza_type() != Some("error") {
            return None;
        }
        let parsed = self
            .get_child("error", ns::JABBER_CLIENT)
            .and_then(|error| StanzaError::try_from(error.clone()).ok());
        // a missing or unreadable <error/> child still means failure
        Some(parsed.unwrap_or_else(|| {
            plain_stanza_error(ErrorType::Cancel, DefinedCondition::UndefinedCondition)
        }))
    }
}

/// A stanza error with no descriptive text.
pub fn plain_stanza_error(type_: ErrorType, defined_condition: DefinedCondition) -> StanzaError {
    StanzaError {
        type_,
        by: None,
        defined_condition,
        texts: BTreeMap::new(),
        other: None,
        alternate_address: None,
    }
}

/// An `<iq type='result'/>` acknowledging `request`.
pub fn build_iq_result(request: &Stanza) -> Stanza {
    reply_iq(request, "result").build()
}

/// An `<iq type='error'/>` rejecting `request` with `error`.
pub fn build_iq_error(request: &Stanza, error: &StanzaError) -> Stanza {
    reply_iq(request, "error")
        .append(Element::from(error.clone()))
        .build()
}

fn reply_iq(request: &Stanza, reply_type: &str) -> ElementBuilder {
    let mut builder = Element::builder("iq", ns::JABBER_CLIENT).attr("type", reply_type);
    if let Some(id) = request.attr("id") {
        builder = builder.attr("id", id);
    }
    if let Some(from) = request.attr("from") {
        builder = builder.attr("to", from);
    }
    builder
}

/// Fluent builder for outbound stanzas.
///
/// `c` opens a child and descends into it, `up` climbs back to the parent.
/// An `xmlns` attribute sets an element's namespace; otherwise it inherits
/// its parent's. Nothing is sent until `send` or `send_awaiting_response`,
/// and correlation ids are assigned only then, so a cloned template can be
/// sent more than once.
#[derive(Debug, Clone)]
pub struct StanzaBuilder {
    root: Element,
    open: Vec<Element>,
    connection: Option<WeakConnection>,
}

impl StanzaBuilder {
    /// A detached builder; `send*` on it fails with `NotConnected`.
    pub fn new(name: &str, attrs: &[(&str, &str)]) -> Self {
        Self {
            root: new_element(name, ns::JABBER_CLIENT, attrs),
            open: Vec::new(),
            connection: None,
        }
    }

    pub(crate) fn bound(connection: WeakConnection, name: &str, attrs: &[(&str, &str)]) -> Self {
        Self {
            connection: Some(connection),
            ..Self::new(name, attrs)
        }
    }

    /// Open a child element and make it current.
    pub fn c(mut self, name: &str, attrs: &[(&str, &str)]) -> Self {
        let namespace = self.current().ns();
        self.open.push(new_element(name, &namespace, attrs));
        self
    }

    /// Add a child element holding `text`; the current element is unchanged.
    pub fn c_text(mut self, name: &str, attrs: &[(&str, &str)], text: &str) -> Self {
        let namespace = self.current().ns();
        let mut child = new_element(name, &namespace, attrs);
        child.append_text_node(text);
        self.current_mut().append_child(child);
        self
    }

    /// Append a text node to the current element.
    pub fn t(mut self, text: &str) -> Self {
        self.current_mut().append_text_node(text);
        self
    }

    /// Set attributes on the current element, replacing existing values.
    pub fn attrs(mut self, attrs: &[(&str, &str)]) -> Self {
        let current = self.current_mut();
        for (name, value) in attrs.iter().filter(|(name, _)| *name != "xmlns") {
            current.set_attr(*name, *value);
        }
        self
    }

    /// Close the current element and return to its parent.
    pub fn up(mut self) -> Self {
        if let Some(child) = self.open.pop() {
            self.current_mut().append_child(child);
        }
        self
    }

    /// Finish building and return the root element.
    pub fn tree(mut self) -> Stanza {
        while !self.open.is_empty() {
            self = self.up();
        }
        self.root
    }

    pub async fn send(self) -> Result<(), XmppError> {
        let connection = self.upgrade()?;
        connection.send(self.tree()).await
    }

    pub async fn send_awaiting_response(self) -> Result<Stanza, XmppError> {
        let connection = self.upgrade()?;
        connection.send_awaiting_response(self.tree()).await
    }

    fn upgrade(&self) -> Result<crate::connection::Connection, XmppError> {
        self.connection
            .as_ref()
            .and_then(WeakConnection::upgrade)
            .ok_or(XmppError::NotConnected)
    }

    fn current(&self) -> &Element {
        self.open.last().unwrap_or(&self.root)
    }

    fn current_mut(&mut self) -> &mut Element {
        self.open.last_mut().unwrap_or(&mut self.root)
    }
}

fn new_element(name: &str, inherited_ns: &str, attrs: &[(&str, &str)]) -> Element {
    let namespace = attrs
        .iter()
        .find(|(key, _)| *key == "xmlns")
        .map_or(inherited_ns, |(_, value)| *value);
    let mut builder = Element::builder(name, namespace);
    for (key, value) in attrs.iter().filter(|(key, _)| *key != "xmlns") {
        builder = builder.attr(*key, *value);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_restores_default_namespace() {
        let stanza = parse_stanza(b"<iq type='result' id='r1'/>").unwrap();
        assert_eq!(stanza.name(), "iq");
        assert_eq!(stanza.ns(), ns::JABBER_CLIENT);
        assert_eq!(stanza.stanza_id(), Some("r1"));

        let presence = parse_stanza(b"<presence from='tim@example.com/phone'><show>away</show></presence>")
            .unwrap();
        assert_eq!(presence.ns(), ns::JABBER_CLIENT);
        assert!(presence.get_child("show", ns::JABBER_CLIENT).is_some());
    }

    #[test]
    fn parse_keeps_explicit_namespace() {
        let stanza = parse_stanza(
            b"<iq xmlns='jabber:client' type='set' id='p1'><query xmlns='jabber:iq:roster'/></iq>",
        )
        .unwrap();
        assert!(stanza.has_child("query", ns::ROSTER));
        assert!(stanza.has_payload_ns(ns::ROSTER));
    }

    #[test]
    fn parse_rejects_garbage_and_non_stanzas() {
        assert_matches!(parse_stanza(b"   "), Err(PipelineError::ParseFailed(_)));
        assert_matches!(parse_stanza(b"<iq"), Err(PipelineError::ParseFailed(_)));
        assert_matches!(parse_stanza(&[0xff, 0xfe]), Err(PipelineError::ParseFailed(_)));
        assert_matches!(
            parse_stanza(b"<stream:features xmlns:stream='http://etherx.jabber.org/streams'/>"),
            Err(PipelineError::ParseFailed(_))
        );
    }

    #[test]
    fn builder_nests_and_inherits_namespaces() {
        let stanza = StanzaBuilder::new("iq", &[("type", "set")])
            .c("query", &[("xmlns", ns::ROSTER)])
            .c("item", &[("jid", "tim@example.com")])
            .c_text("group", &[], "Friends")
            .tree();

        assert_eq!(stanza.ns(), ns::JABBER_CLIENT);
        let query = stanza.get_child("query", ns::ROSTER).unwrap();
        let item = query.get_child("item", ns::ROSTER).unwrap();
        assert_eq!(item.attr("jid"), Some("tim@example.com"));
        assert_eq!(item.get_child("group", ns::ROSTER).unwrap().text(), "Friends");
        assert_eq!(stanza.attr("xmlns"), None);
    }

    #[test]
    fn builder_up_returns_to_parent() {
        let stanza = StanzaBuilder::new("message", &[("to", "tim@example.com"), ("type", "chat")])
            .c("body", &[])
            .t("hello")
            .up()
            .c("active", &[("xmlns", "http://jabber.org/protocol/chatstates")])
            .tree();

        let names: Vec<&str> = stanza.children().map(Element::name).collect();
        assert_eq!(names, vec!["body", "active"]);
        assert_eq!(stanza.get_child("body", ns::JABBER_CLIENT).unwrap().text(), "hello");
    }

    #[test]
    fn builder_attrs_last_write_wins() {
        let stanza = StanzaBuilder::new("presence", &[("type", "subscribe")])
            .attrs(&[("type", "subscribed"), ("to", "tim@example.com")])
            .tree();
        assert_eq!(stanza.stanza_type(), Some("subscribed"));
        assert_eq!(stanza.attr("to"), Some("tim@example.com"));
    }

    #[test]
    fn builder_without_connection_assigns_no_id() {
        let template = StanzaBuilder::new("iq", &[("type", "get")]).c("ping", &[("xmlns", "urn:xmpp:ping")]);
        let first = template.clone().tree();
        let second = template.tree();
        assert_eq!(first.stanza_id(), None);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn detached_builder_cannot_send() {
        let result = StanzaBuilder::new("presence", &[]).send().await;
        assert_matches!(result, Err(XmppError::NotConnected));
    }

    #[test]
    fn serialize_then_parse_preserves_payload() {
        let original = StanzaBuilder::new("iq", &[("type", "get"), ("id", "q1")])
            .c("query", &[("xmlns", ns::ROSTER)])
            .tree();
        let bytes = serialize_stanza(&original).unwrap();
        let parsed = parse_stanza(&bytes).unwrap();
        assert_eq!(parsed.name(), "iq");
        assert_eq!(parsed.ns(), ns::JABBER_CLIENT);
        assert_eq!(parsed.stanza_type(), Some("get"));
        assert_eq!(parsed.stanza_id(), Some("q1"));
        assert!(parsed.has_child("query", ns::ROSTER));
    }

    #[test]
    fn iq_result_echoes_id_and_addresses_sender() {
        let request = parse_stanza(b"<iq type='set' id='push1' from='bob@example.com'><query xmlns='jabber:iq:roster'/></iq>")
            .unwrap();
        let result = build_iq_result(&request);
        assert_eq!(result.stanza_type(), Some("result"));
        assert_eq!(result.stanza_id(), Some("push1"));
        assert_eq!(result.attr("to"), Some("bob@example.com"));
        assert_eq!(result.children().count(), 0);
    }

    #[test]
    fn iq_error_carries_condition_and_text() {
        let request = parse_stanza(b"<iq type='get' id='v1' from='example.com'><query xmlns='jabber:iq:version'/></iq>")
            .unwrap();
        let error = StanzaError::new(
            ErrorType::Cancel,
            DefinedCondition::ServiceUnavailable,
            "en",
            "not supported",
        );
        let reply = build_iq_error(&request, &error);

        assert_eq!(reply.stanza_type(), Some("error"));
        assert_eq!(reply.stanza_id(), Some("v1"));
        assert_eq!(reply.attr("to"), Some("example.com"));
        let condition = reply
            .get_child("error", ns::JABBER_CLIENT)
            .and_then(|error| error.get_child("service-unavailable", ns::XMPP_STANZAS));
        assert!(condition.is_some());
        assert_eq!(reply.stanza_error(), Some(error));
    }

    #[test]
    fn stanza_error_reads_inbound_payload() {
        let stanza = parse_stanza(
            b"<iq type='error' id='e0'><error type='auth'><forbidden xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/><text xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'>go away</text></error></iq>",
        )
        .unwrap();
        let error = stanza.stanza_error().unwrap();
        assert_eq!(error.type_, ErrorType::Auth);
        assert_eq!(error.defined_condition, DefinedCondition::Forbidden);
        assert_eq!(error.texts.get(""), Some(&"go away".to_string()));
    }

    #[test]
    fn stanza_error_defaults_when_payload_is_missing() {
        let stanza = parse_stanza(b"<iq type='error' id='e1'/>").unwrap();
        let error = stanza.stanza_error().unwrap();
        assert_eq!(error.type_, ErrorType::Cancel);
        assert_eq!(error.defined_condition, DefinedCondition::UndefinedCondition);
        assert!(error.texts.is_empty());

        let unreadable = parse_stanza(b"<iq type='error' id='e3'><error type='cancel'/></iq>").unwrap();
        assert_eq!(
            unreadable.stanza_error().map(|error| error.defined_condition),
            Some(DefinedCondition::UndefinedCondition)
        );

        let ok = parse_stanza(b"<iq type='result' id='e2'/>").unwrap();
        assert_eq!(ok.stanza_error(), None);
    }

    #[test]
    fn namespace_lookalike_in_attribute_value_is_not_a_declaration() {
        let stanza = parse_stanza(b"<iq type='result' id='xmlns=1'/>").unwrap();
        assert_eq!(stanza.ns(), ns::JABBER_CLIENT);
        assert_eq!(stanza.stanza_id(), Some("xmlns=1"));

        let message = parse_stanza(b"<message id=\"a>b\"><body>hi</body></message>").unwrap();
        assert_eq!(message.ns(), ns::JABBER_CLIENT);
        assert_eq!(message.stanza_id(), Some("a>b"));
    }

    #[test]
    fn spaced_namespace_declaration_is_respected() {
        let stanza = parse_stanza(b"<iq xmlns = 'jabber:client' type='get' id='s1'/>").unwrap();
        assert_eq!(stanza.ns(), ns::JABBER_CLIENT);
        assert_eq!(stanza.stanza_id(), Some("s1"));

        assert_eq!(scan_start_tag("<iq xmlns\t=\"jabber:client\">"), Some((3, true)));
        assert_eq!(scan_start_tag("<presence/>"), Some((9, false)));
        assert_eq!(scan_start_tag("<iq id='open"), None);
    }

    #[test]
    fn jid_accessors_parse_addresses() {
        let stanza = parse_stanza(b"<message from='tim@example.com/phone' to='bob@example.com'/>").unwrap();
        assert_eq!(stanza.from_jid().unwrap().to_string(), "tim@example.com/phone");
        assert_eq!(stanza.to_jid().unwrap().to_string(), "bob@example.com");
    }
}
