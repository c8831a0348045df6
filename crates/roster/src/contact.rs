use std::collections::HashMap;

use tern_core::event::{Availability, ContactSnapshot, Subscription};
use tern_xmpp::{BareJid, Jid};

/// What one resource of a contact last announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePresence {
    pub availability: Availability,
    pub status: Option<String>,
}

/// A roster entry, keyed by bare JID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub jid: BareJid,
    pub name: Option<String>,
    pub subscription: Subscription,
    /// The contact asked to see our presence and we have not answered.
    pub pending_in: bool,
    /// We asked to see the contact's presence and it has not answered.
    pub pending_out: bool,
    /// Online resources; a resource going unavailable is removed.
    pub resources: HashMap<String, ResourcePresence>,
    pub status: Option<String>,
}

impl Contact {
    pub fn new(jid: &Jid) -> Self {
        Self {
            jid: jid.to_bare(),
            name: None,
            subscription: Subscription::None,
            pending_in: false,
            pending_out: false,
            resources: HashMap::new(),
            status: None,
        }
    }

    /// The most available state over all resources.
    pub fn availability(&self) -> Availability {
        self.resources
            .values()
            .map(|presence| presence.availability)
            .min_by_key(|availability| rank(*availability))
            .unwrap_or(Availability::Unavailable)
    }

    /// Record presence from `resource`; an empty resource stands for the
    /// bare JID.
    pub fn update_presence(
        &mut self,
        resource: &str,
        availability: Availability,
        status: Option<String>,
    ) {
        if status.is_some() {
            self.status = status.clone();
        }
        if availability == Availability::Unavailable {
            self.resources.remove(resource);
        } else {
            self.resources.insert(
                resource.to_string(),
                ResourcePresence {
                    availability,
                    status,
                },
            );
        }
    }

    pub fn snapshot(&self) -> ContactSnapshot {
        ContactSnapshot {
            jid: self.jid.to_string(),
            name: self.name.clone(),
            subscription: self.subscription,
            pending_in: self.pending_in,
            pending_out: self.pending_out,
            availability: self.availability(),
            status: self.status.clone(),
        }
    }
}

fn rank(availability: Availability) -> u8 {
    match availability {
        Availability::Present => 0,
        Availability::Away => 1,
        Availability::Unavailable => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact::new(&"bob@example.com/phone".parse().unwrap())
    }

    #[test]
    fn keyed_by_bare_jid() {
        let contact = contact();
        assert_eq!(contact.jid.to_string(), "bob@example.com");
        assert_eq!(contact.availability(), Availability::Unavailable);
    }

    #[test]
    fn availability_is_best_resource() {
        let mut contact = contact();
        contact.update_presence("phone", Availability::Away, None);
        contact.update_presence("laptop", Availability::Present, Some("coding".into()));
        assert_eq!(contact.availability(), Availability::Present);

        contact.update_presence("laptop", Availability::Unavailable, None);
        assert_eq!(contact.availability(), Availability::Away);
        assert_eq!(contact.status.as_deref(), Some("coding"));

        contact.update_presence("phone", Availability::Unavailable, None);
        assert_eq!(contact.availability(), Availability::Unavailable);
    }

    #[test]
    fn snapshot_copies_flags() {
        let mut contact = contact();
        contact.subscription = Subscription::To;
        contact.pending_in = true;
        let snapshot = contact.snapshot();
        assert_eq!(snapshot.jid, "bob@example.com");
        assert_eq!(snapshot.subscription, Subscription::To);
        assert!(snapshot.pending_in);
        assert!(!snapshot.pending_out);
    }
}
