//! Presence subscription transitions (RFC 6121 section 3) applied to a
//! single [`Contact`].
//!
//! The functions here only mutate contact state and say what to answer;
//! sending is left to the plugin.

use tern_core::event::Subscription;

use crate::contact::Contact;

/// Something that moves a contact's subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent<'a> {
    /// Inbound presence of type `subscribe`.
    Subscribe,
    /// Inbound presence of type `subscribed`.
    Subscribed,
    /// Inbound presence of type `unsubscribed`.
    Unsubscribed,
    /// A roster item from a push or a roster result.
    RosterItem {
        subscription: Option<&'a str>,
        ask: Option<&'a str>,
    },
    /// The user approves the contact's request.
    Approve,
    /// The user rejects the contact's request.
    Deny,
    /// The user asked for the contact's presence.
    RequestSent,
    /// The user removed the contact from the roster.
    Removed,
}

/// Presence type to send back to the contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Subscribed,
    Unsubscribe,
    Unsubscribed,
}

impl Reply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Subscribed => "subscribed",
            Reply::Unsubscribe => "unsubscribe",
            Reply::Unsubscribed => "unsubscribed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub reply: Option<Reply>,
    /// The contact is now waiting for the user's decision.
    pub request_raised: bool,
}

impl Outcome {
    fn reply(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            request_raised: false,
        }
    }
}

pub fn apply(contact: &mut Contact, event: SubscriptionEvent<'_>) -> Outcome {
    match event {
        SubscriptionEvent::Subscribe => {
            if contact.subscription.is_subscribed() || contact.pending_out {
                // known contact, authorize right away
                authorize(contact)
            } else {
                contact.pending_in = true;
                Outcome {
                    reply: None,
                    request_raised: true,
                }
            }
        }
        SubscriptionEvent::Subscribed => {
            contact.pending_out = false;
            contact.subscription = match contact.subscription {
                Subscription::None => Subscription::To,
                Subscription::From => Subscription::Both,
                unchanged => unchanged,
            };
            Outcome::default()
        }
        SubscriptionEvent::Unsubscribed => Outcome::reply(Reply::Unsubscribe),
        SubscriptionEvent::RosterItem { subscription, ask } => {
            if subscription == Some("remove") {
                reset(contact);
            } else {
                contact.subscription = subscription
                    .and_then(|value| value.parse().ok())
                    .unwrap_or_default();
                contact.pending_out = ask == Some("subscribe");
            }
            Outcome::default()
        }
        SubscriptionEvent::Approve => authorize(contact),
        SubscriptionEvent::Deny => {
            contact.pending_in = false;
            Outcome::reply(Reply::Unsubscribed)
        }
        SubscriptionEvent::RequestSent => {
            contact.pending_out = true;
            Outcome::default()
        }
        SubscriptionEvent::Removed => {
            reset(contact);
            Outcome::reply(Reply::Unsubscribed)
        }
    }
}

fn authorize(contact: &mut Contact) -> Outcome {
    contact.pending_in = false;
    contact.subscription = match contact.subscription {
        Subscription::None => Subscription::From,
        Subscription::To => Subscription::Both,
        unchanged => unchanged,
    };
    Outcome::reply(Reply::Subscribed)
}

fn reset(contact: &mut Contact) {
    contact.subscription = Subscription::None;
    contact.pending_in = false;
    contact.pending_out = false;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(subscription: Subscription) -> Contact {
        let mut contact = Contact::new(&"tim@example.com".parse().unwrap());
        contact.subscription = subscription;
        contact
    }

    #[test]
    fn unknown_subscriber_raises_request() {
        let mut contact = contact(Subscription::None);
        let outcome = apply(&mut contact, SubscriptionEvent::Subscribe);
        assert!(outcome.request_raised);
        assert_eq!(outcome.reply, None);
        assert!(contact.pending_in);
        assert_eq!(contact.subscription, Subscription::None);
    }

    #[test]
    fn subscriber_we_follow_is_authorized() {
        let mut contact = contact(Subscription::To);
        contact.pending_in = true;
        let outcome = apply(&mut contact, SubscriptionEvent::Subscribe);
        assert_eq!(outcome.reply, Some(Reply::Subscribed));
        assert!(!contact.pending_in);
        assert_eq!(contact.subscription, Subscription::Both);
    }

    #[test]
    fn subscriber_we_asked_is_authorized() {
        let mut contact = contact(Subscription::None);
        contact.pending_out = true;
        let outcome = apply(&mut contact, SubscriptionEvent::Subscribe);
        assert_eq!(outcome.reply, Some(Reply::Subscribed));
        assert_eq!(contact.subscription, Subscription::From);
        assert!(contact.pending_out);
    }

    #[test]
    fn subscribed_clears_pending_out() {
        let mut contact = contact(Subscription::To);
        contact.pending_out = true;
        let outcome = apply(&mut contact, SubscriptionEvent::Subscribed);
        assert_eq!(outcome, Outcome::default());
        assert!(!contact.pending_out);
        assert_eq!(contact.subscription, Subscription::To);

        let mut contact = self::contact(Subscription::None);
        apply(&mut contact, SubscriptionEvent::Subscribed);
        assert_eq!(contact.subscription, Subscription::To);
    }

    #[test]
    fn reciprocal_subscribed_becomes_both() {
        let mut contact = contact(Subscription::From);
        apply(&mut contact, SubscriptionEvent::Subscribed);
        assert_eq!(contact.subscription, Subscription::Both);
    }

    #[test]
    fn unsubscribed_is_acknowledged_without_state_change() {
        let mut contact = contact(Subscription::Both);
        let outcome = apply(&mut contact, SubscriptionEvent::Unsubscribed);
        assert_eq!(outcome.reply, Some(Reply::Unsubscribe));
        assert_eq!(contact.subscription, Subscription::Both);
    }

    #[test]
    fn roster_item_takes_pushed_value() {
        let mut contact = contact(Subscription::None);
        apply(
            &mut contact,
            SubscriptionEvent::RosterItem {
                subscription: Some("from"),
                ask: Some("subscribe"),
            },
        );
        assert_eq!(contact.subscription, Subscription::From);
        assert!(contact.pending_out);

        apply(
            &mut contact,
            SubscriptionEvent::RosterItem {
                subscription: None,
                ask: None,
            },
        );
        assert_eq!(contact.subscription, Subscription::None);
        assert!(!contact.pending_out);
    }

    #[test]
    fn roster_removal_resets_flags() {
        let mut contact = contact(Subscription::Both);
        contact.pending_in = true;
        contact.pending_out = true;
        apply(
            &mut contact,
            SubscriptionEvent::RosterItem {
                subscription: Some("remove"),
                ask: None,
            },
        );
        assert_eq!(contact.subscription, Subscription::None);
        assert!(!contact.pending_in);
        assert!(!contact.pending_out);
    }

    #[test]
    fn deny_only_clears_pending_in() {
        let mut contact = contact(Subscription::To);
        contact.pending_in = true;
        let outcome = apply(&mut contact, SubscriptionEvent::Deny);
        assert_eq!(outcome.reply, Some(Reply::Unsubscribed));
        assert!(!contact.pending_in);
        assert_eq!(contact.subscription, Subscription::To);
    }

    #[test]
    fn removal_resets_and_unsubscribes() {
        let mut contact = contact(Subscription::Both);
        let outcome = apply(&mut contact, SubscriptionEvent::Removed);
        assert_eq!(outcome.reply, Some(Reply::Unsubscribed));
        assert_eq!(contact.subscription, Subscription::None);
    }
}
