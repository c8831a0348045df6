//! Roster and presence subscription tracking for a Tern connection.

pub mod contact;
pub mod error;
pub mod plugin;
pub mod subscription;

pub use contact::{Contact, ResourcePresence};
pub use error::{Result, RosterError};
pub use plugin::{NS_ROSTER_X, RosterPlugin};
pub use subscription::{Outcome, Reply, SubscriptionEvent};
