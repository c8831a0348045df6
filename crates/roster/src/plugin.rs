use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use minidom::Element;
use tern_core::event::{Availability, ContactSnapshot, EventPayload, EventSource};
use tern_xmpp::{
    BareJid, Connection, HandlerOptions, HandlerRef, Matcher, PluginLifecycle, Stanza, StanzaExt,
    WeakConnection, XmppError, build_iq_result, ns, parse_bare_jid, parse_jid, same_bare,
};
use tracing::{debug, info, warn};

use crate::{
    contact::Contact,
    error::{Result, RosterError},
    subscription::{Outcome, SubscriptionEvent, apply},
};

/// Roster item exchange (XEP-0144).
pub const NS_ROSTER_X: &str = "jabber:x:roster";

const PLUGIN_NAME: &str = "roster";

/// Keeps the contact list and presence subscriptions in sync with the
/// server.
///
/// Create it with [`RosterPlugin::install`]; the returned handle and the
/// copy held by the connection share state.
#[derive(Clone)]
pub struct RosterPlugin {
    inner: Arc<RosterInner>,
}

struct RosterInner {
    contacts: Mutex<HashMap<BareJid, Contact>>,
    handlers: Mutex<Vec<HandlerRef>>,
    connection: WeakConnection,
}

impl RosterPlugin {
    pub fn install(connection: &Connection) -> Self {
        let plugin = Self {
            inner: Arc::new(RosterInner {
                contacts: Mutex::new(HashMap::new()),
                handlers: Mutex::new(Vec::new()),
                connection: connection.downgrade(),
            }),
        };
        connection.add_plugin(Arc::new(plugin.clone()));
        plugin
    }

    /// All known contacts, ordered by JID.
    pub fn contacts(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.lock_contacts().values().cloned().collect();
        contacts.sort_by_key(|contact| contact.jid.to_string());
        contacts
    }

    pub fn contact(&self, jid: &str) -> Result<Option<Contact>> {
        let jid = parse_bare(jid)?;
        Ok(self.lock_contacts().get(&jid).cloned())
    }

    /// Add `jid` to the roster and ask for its presence. A pending request
    /// from the same contact is approved first.
    pub async fn add_contact(&self, jid: &str) -> Result<()> {
        let connection = self.connected()?;
        let jid = parse_bare(jid)?;

        let awaiting_approval = self
            .lock_contacts()
            .get(&jid)
            .is_some_and(|contact| contact.pending_in);
        if awaiting_approval {
            self.approve(&connection, &jid).await?;
        }

        let target = jid.to_string();
        connection
            .iq(&[("type", "set")])
            .c("query", &[("xmlns", ns::ROSTER)])
            .c("item", &[("jid", &target)])
            .send_awaiting_response()
            .await?;
        connection
            .presence(&[("to", &target), ("type", "subscribe")])
            .send()
            .await?;

        let snapshot = self.update(&jid, |contact| {
            apply(contact, SubscriptionEvent::RequestSent);
        });
        info!(contact = %jid, "contact added");
        self.publish(&connection, "xmpp.roster.contact.updated", EventPayload::ContactUpdated {
            contact: snapshot,
        });
        Ok(())
    }

    /// Remove `jid` from the roster and revoke its subscription. The contact
    /// stays known with its state reset once the server confirmed the
    /// removal; a rejected request leaves it untouched.
    pub async fn remove_contact(&self, jid: &str) -> Result<()> {
        let connection = self.connected()?;
        let jid = parse_bare(jid)?;

        if !self.lock_contacts().contains_key(&jid) {
            debug!(contact = %jid, "remove_contact for unknown contact");
            return Ok(());
        }

        let target = jid.to_string();
        connection
            .iq(&[("type", "set")])
            .c("query", &[("xmlns", ns::ROSTER)])
            .c("item", &[("jid", &target), ("subscription", "remove")])
            .send_awaiting_response()
            .await?;

        let outcome = match self.lock_contacts().get_mut(&jid) {
            Some(contact) => apply(contact, SubscriptionEvent::Removed),
            None => Outcome::default(),
        };
        self.answer(&connection, &jid, outcome).await?;

        info!(contact = %jid, "contact removed");
        self.publish(&connection, "xmpp.roster.contact.removed", EventPayload::ContactRemoved {
            jid: target,
        });
        Ok(())
    }

    pub async fn approve_subscription(&self, jid: &str) -> Result<()> {
        let connection = self.connected()?;
        let jid = parse_bare(jid)?;
        self.approve(&connection, &jid).await
    }

    pub async fn deny_subscription(&self, jid: &str) -> Result<()> {
        let connection = self.connected()?;
        let jid = parse_bare(jid)?;

        let mut outcome = Outcome::default();
        let snapshot = self.update(&jid, |contact| {
            outcome = apply(contact, SubscriptionEvent::Deny);
        });
        self.answer(&connection, &jid, outcome).await?;
        self.publish(&connection, "xmpp.roster.contact.updated", EventPayload::ContactUpdated {
            contact: snapshot,
        });
        Ok(())
    }

    /// Fetch the roster and upsert every item.
    pub async fn refresh_roster(&self) -> Result<Vec<ContactSnapshot>> {
        let connection = self.connected()?;
        let response = connection
            .iq(&[("type", "get")])
            .c("query", &[("xmlns", ns::ROSTER)])
            .send_awaiting_response()
            .await?;

        let snapshots: Vec<ContactSnapshot> = match response.get_child("query", ns::ROSTER) {
            Some(query) => {
                let mut contacts = self.lock_contacts();
                roster_items(query)
                    .filter_map(|item| upsert_item(&mut contacts, item))
                    .map(|(contact, _)| contact)
                    .collect()
            }
            None => {
                debug!("roster result without query, keeping contacts");
                Vec::new()
            }
        };

        debug!(contacts = snapshots.len(), "roster received");
        self.publish(&connection, "xmpp.roster.received", EventPayload::RosterReceived {
            contacts: snapshots.clone(),
        });
        Ok(snapshots)
    }

    async fn approve(&self, connection: &Connection, jid: &BareJid) -> Result<()> {
        let mut outcome = Outcome::default();
        let snapshot = self.update(jid, |contact| {
            outcome = apply(contact, SubscriptionEvent::Approve);
        });
        self.answer(connection, jid, outcome).await?;
        self.publish(connection, "xmpp.roster.contact.updated", EventPayload::ContactUpdated {
            contact: snapshot,
        });
        Ok(())
    }

    async fn answer(&self, connection: &Connection, jid: &BareJid, outcome: Outcome) -> Result<()> {
        let Some(reply) = outcome.reply else {
            return Ok(());
        };
        connection
            .presence(&[("to", &jid.to_string()), ("type", reply.as_str())])
            .send()
            .await?;
        Ok(())
    }

    // ── Stanza handlers ───────────────────────────────────────────

    fn handle_roster_push(&self, stanza: &Stanza) -> bool {
        let Some(connection) = self.inner.connection.upgrade() else {
            return true;
        };

        // only the server, speaking for the account's bare JID, may push
        if let Some(from) = stanza.attr("from") {
            let own = connection.user_jid().map(|jid| jid.to_bare());
            let authorized = matches!(
                (parse_jid(from), own),
                (Ok(from), Some(own)) if from == own
            );
            if !authorized {
                let error = XmppError::UnauthorizedPush {
                    from: from.to_string(),
                };
                warn!(%error, "ignoring roster push");
                self.publish(&connection, "xmpp.roster.push.rejected", EventPayload::RosterPushRejected {
                    from: from.to_string(),
                });
                return true;
            }
        }

        if let Err(error) = connection.send_detached(build_iq_result(stanza)) {
            warn!(%error, "failed to acknowledge roster push");
        }

        let Some(query) = stanza.get_child("query", ns::ROSTER) else {
            return true;
        };
        let changes: Vec<(ContactSnapshot, bool)> = {
            let mut contacts = self.lock_contacts();
            roster_items(query)
                .filter_map(|item| upsert_item(&mut contacts, item))
                .collect()
        };
        for (contact, removed) in changes {
            debug!(contact = %contact.jid, subscription = %contact.subscription, removed, "roster push");
            if removed {
                self.publish(&connection, "xmpp.roster.contact.removed", EventPayload::ContactRemoved {
                    jid: contact.jid,
                });
            } else {
                self.publish(&connection, "xmpp.roster.contact.updated", EventPayload::ContactUpdated {
                    contact,
                });
            }
        }
        true
    }

    fn handle_presence(&self, stanza: &Stanza) -> bool {
        let Some(connection) = self.inner.connection.upgrade() else {
            return true;
        };
        let presence_type = stanza.stanza_type();
        if presence_type == Some("error") {
            return true;
        }
        let Some(from) = stanza.from_jid() else {
            return true;
        };
        if connection
            .user_jid()
            .is_some_and(|own| same_bare(&own, &from))
        {
            return true;
        }
        if is_muc_presence(stanza) {
            return false;
        }

        let status = stanza
            .get_child("status", ns::JABBER_CLIENT)
            .map(Element::text);
        let event = match presence_type {
            None | Some("unavailable") => None,
            Some("subscribe") => Some(SubscriptionEvent::Subscribe),
            Some("subscribed") => Some(SubscriptionEvent::Subscribed),
            Some("unsubscribed") => Some(SubscriptionEvent::Unsubscribed),
            Some(other) => {
                debug!(from = %from, presence_type = other, "presence type not tracked");
                return true;
            }
        };

        let bare = from.to_bare();
        let mut outcome = Outcome::default();
        let snapshot = self.update(&bare, |contact| match event {
            Some(event) => {
                if status.is_some() {
                    contact.status = status;
                }
                outcome = apply(contact, event);
            }
            None => {
                let availability = match presence_type {
                    Some(_) => Availability::Unavailable,
                    None => show_to_availability(stanza),
                };
                let resource = from.resource().map(|resource| resource.as_str());
                contact.update_presence(resource.unwrap_or_default(), availability, status);
            }
        });

        if let Some(reply) = outcome.reply {
            let answer = connection
                .presence(&[("to", &bare.to_string()), ("type", reply.as_str())])
                .tree();
            if let Err(error) = connection.send_detached(answer) {
                warn!(%error, contact = %bare, "failed to answer subscription presence");
            }
        }
        if outcome.request_raised {
            info!(contact = %bare, "subscription request");
            self.publish(&connection, "xmpp.subscription.request", EventPayload::SubscriptionRequest {
                from: bare.to_string(),
            });
        }
        self.publish(&connection, "xmpp.roster.contact.updated", EventPayload::ContactUpdated {
            contact: snapshot,
        });
        true
    }

    fn handle_roster_suggestion(&self, stanza: &Stanza) -> bool {
        let Some(exchange) = stanza.get_child("x", NS_ROSTER_X) else {
            return true;
        };
        let additions = exchange
            .children()
            .filter(|item| item.name() == "item" && item.attr("action") == Some("add"))
            .filter_map(|item| item.attr("jid"));
        for jid in additions {
            debug!(contact = jid, from = ?stanza.attr("from"), "roster suggestion");
            let plugin = self.clone();
            let jid = jid.to_string();
            tokio::spawn(async move {
                if let Err(error) = plugin.add_contact(&jid).await {
                    warn!(%error, contact = %jid, "failed to add suggested contact");
                }
            });
        }
        true
    }

    // ── State ─────────────────────────────────────────────────────

    fn update(&self, jid: &BareJid, change: impl FnOnce(&mut Contact)) -> ContactSnapshot {
        let mut contacts = self.lock_contacts();
        let contact = contacts
            .entry(jid.clone())
            .or_insert_with(|| Contact::new(jid));
        change(contact);
        contact.snapshot()
    }

    fn connected(&self) -> Result<Connection> {
        self.inner
            .connection
            .upgrade()
            .ok_or(RosterError::Xmpp(XmppError::NotConnected))
    }

    fn publish(&self, connection: &Connection, channel: &str, payload: EventPayload) {
        connection.publish(channel, EventSource::Plugin(PLUGIN_NAME.to_string()), payload);
    }

    fn lock_contacts(&self) -> MutexGuard<'_, HashMap<BareJid, Contact>> {
        self.inner
            .contacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Vec<HandlerRef>> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PluginLifecycle for RosterPlugin {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn register_handlers(&self, connection: &Connection) {
        let mut handlers = self.lock_handlers();
        for stale in handlers.drain(..) {
            connection.delete_handler(stale);
        }

        let plugin = self.clone();
        handlers.push(connection.add_handler(
            move |stanza| plugin.handle_roster_push(stanza),
            Matcher::new().name("iq").stanza_type("set").ns(ns::ROSTER),
            HandlerOptions::default(),
        ));
        let plugin = self.clone();
        handlers.push(connection.add_handler(
            move |stanza| plugin.handle_presence(stanza),
            Matcher::new().name("presence"),
            HandlerOptions::default(),
        ));
        let plugin = self.clone();
        handlers.push(connection.add_handler(
            move |stanza| plugin.handle_roster_suggestion(stanza),
            Matcher::new().name("message").ns(NS_ROSTER_X),
            HandlerOptions::default(),
        ));
    }

    fn unregister_handlers(&self, connection: &Connection) {
        for handle in self.lock_handlers().drain(..) {
            connection.delete_handler(handle);
        }
    }

    async fn on_before_online(&self, _connection: &Connection) -> std::result::Result<(), XmppError> {
        match self.refresh_roster().await {
            Ok(_) => Ok(()),
            Err(RosterError::Xmpp(error)) => Err(error),
            Err(error) => Err(XmppError::Plugin {
                plugin: PLUGIN_NAME.to_string(),
                message: error.to_string(),
            }),
        }
    }

    async fn on_offline(&self) {
        let mut contacts = self.lock_contacts();
        debug!(contacts = contacts.len(), "clearing roster");
        contacts.clear();
    }
}

fn parse_bare(jid: &str) -> Result<BareJid> {
    Ok(parse_bare_jid(jid)?)
}

fn roster_items(query: &Element) -> impl Iterator<Item = &Element> {
    query.children().filter(|child| child.name() == "item")
}

/// Apply one roster item. Returns the contact and whether it was removed.
fn upsert_item(
    contacts: &mut HashMap<BareJid, Contact>,
    item: &Element,
) -> Option<(ContactSnapshot, bool)> {
    let Some(jid) = item.attr("jid").and_then(|raw| parse_bare_jid(raw).ok()) else {
        warn!(jid = ?item.attr("jid"), "skipping roster item without a valid jid");
        return None;
    };

    let subscription = item.attr("subscription");
    let contact = contacts
        .entry(jid.clone())
        .or_insert_with(|| Contact::new(&jid));
    if let Some(name) = item.attr("name") {
        contact.name = Some(name.to_string());
    }
    apply(
        contact,
        SubscriptionEvent::RosterItem {
            subscription,
            ask: item.attr("ask"),
        },
    );
    Some((contact.snapshot(), subscription == Some("remove")))
}

fn show_to_availability(stanza: &Stanza) -> Availability {
    let show = stanza
        .get_child("show", ns::JABBER_CLIENT)
        .map(Element::text);
    match show.as_deref().map(str::trim) {
        Some("away" | "dnd" | "xa") => Availability::Away,
        _ => Availability::Present,
    }
}

fn is_muc_presence(stanza: &Stanza) -> bool {
    stanza.has_child("x", ns::MUC) || stanza.has_child("x", ns::MUC_USER)
}

#[cfg(test)]
mod tests {
    use tern_xmpp::parse_stanza;
    use tracing_test::traced_test;

    use super::*;

    fn stanza(xml: &str) -> Stanza {
        parse_stanza(xml.as_bytes()).unwrap()
    }

    #[test]
    fn show_mapping() {
        assert_eq!(
            show_to_availability(&stanza("<presence/>")),
            Availability::Present
        );
        assert_eq!(
            show_to_availability(&stanza("<presence><show>chat</show></presence>")),
            Availability::Present
        );
        for show in ["away", "dnd", "xa"] {
            let xml = format!("<presence><show>{show}</show></presence>");
            assert_eq!(show_to_availability(&stanza(&xml)), Availability::Away);
        }
    }

    #[test]
    fn muc_presence_is_recognised() {
        assert!(is_muc_presence(&stanza(
            "<presence><x xmlns='http://jabber.org/protocol/muc#user'/></presence>"
        )));
        assert!(is_muc_presence(&stanza(
            "<presence><x xmlns='http://jabber.org/protocol/muc'/></presence>"
        )));
        assert!(!is_muc_presence(&stanza("<presence><show>away</show></presence>")));
    }

    #[test]
    #[traced_test]
    fn upsert_reads_name_and_ask() {
        let mut contacts = HashMap::new();
        let push = stanza(
            "<iq type='set'><query xmlns='jabber:iq:roster'>\
             <item jid='tim@example.com/desk' name='Tim' subscription='none' ask='subscribe'/>\
             <item name='no jid'/>\
             </query></iq>",
        );
        let query = push.get_child("query", ns::ROSTER).unwrap();
        let changes: Vec<_> = roster_items(query)
            .filter_map(|item| upsert_item(&mut contacts, item))
            .collect();

        assert_eq!(changes.len(), 1);
        let (snapshot, removed) = &changes[0];
        assert!(!removed);
        assert_eq!(snapshot.jid, "tim@example.com");
        assert_eq!(snapshot.name.as_deref(), Some("Tim"));
        assert!(snapshot.pending_out);
        assert!(logs_contain("skipping roster item without a valid jid"));
    }

    #[test]
    fn parse_bare_strips_resource() {
        assert_eq!(
            parse_bare("tim@example.com/desk").unwrap().to_string(),
            "tim@example.com"
        );
        assert!(parse_bare("").is_err());
    }
}
