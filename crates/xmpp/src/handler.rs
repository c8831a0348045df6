//! Inbound stanza handler registry.
//!
//! Handlers are evaluated most specific first: a matcher pinning more fields
//! wins, ties keep registration order. Every matching handler runs. The
//! callback's return value only matters for handlers pinned to an `id`:
//! returning `true` there consumes the stanza.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error};

use crate::{
    jid::{parse_jid, same_bare},
    stanza::Stanza,
};

type HandlerFn = dyn Fn(&Stanza) -> bool + Send + Sync;

/// Stanza fields a handler is interested in; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matcher {
    /// Namespace of the stanza itself or of one of its direct children.
    pub ns: Option<String>,
    pub name: Option<String>,
    pub stanza_type: Option<String>,
    pub id: Option<String>,
    pub from: Option<String>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ns(mut self, ns: impl Into<String>) -> Self {
        self.ns = Some(ns.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn stanza_type(mut self, stanza_type: impl Into<String>) -> Self {
        self.stanza_type = Some(stanza_type.into());
        self
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    fn specificity(&self) -> usize {
        [
            self.ns.is_some(),
            self.name.is_some(),
            self.stanza_type.is_some(),
            self.id.is_some(),
            self.from.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }

    fn matches(&self, stanza: &Stanza, options: HandlerOptions) -> bool {
        if let Some(name) = &self.name {
            if stanza.name() != name {
                return false;
            }
        }
        if let Some(stanza_type) = &self.stanza_type {
            if stanza.attr("type") != Some(stanza_type.as_str()) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if stanza.attr("id") != Some(id.as_str()) {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if !from_matches(from, stanza.attr("from"), options.match_bare_from_jid) {
                return false;
            }
        }
        if let Some(ns) = &self.ns {
            let strip = options.ignore_namespace_fragment;
            let own = namespace_of(stanza, strip) == ns.as_str();
            if !own && !stanza.children().any(|child| namespace_of(child, strip) == ns.as_str()) {
                return false;
            }
        }
        true
    }
}

fn namespace_of(element: &Stanza, strip_fragment: bool) -> String {
    let ns = element.ns();
    if strip_fragment {
        if let Some((base, _)) = ns.split_once('#') {
            return base.to_string();
        }
    }
    ns
}

fn from_matches(expected: &str, actual: Option<&str>, bare: bool) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    if !bare {
        return expected == actual;
    }
    match (parse_jid(expected), parse_jid(actual)) {
        (Ok(expected), Ok(actual)) => same_bare(&expected, &actual),
        _ => expected == actual,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Compare `from` without the resource part.
    pub match_bare_from_jid: bool,
    /// Ignore a `#fragment` on the stanza's namespaces, so `ns` set to
    /// `http://jabber.org/protocol/muc` also sees `...muc#user` payloads.
    pub ignore_namespace_fragment: bool,
}

/// Opaque reference returned by `add`, used to delete the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRef(u64);

struct HandlerEntry {
    handle: HandlerRef,
    matcher: Matcher,
    options: HandlerOptions,
    callback: Box<HandlerFn>,
    removed: AtomicBool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers whose matcher accepted the stanza.
    pub matched: usize,
    /// Set when an id-pinned handler consumed the stanza.
    pub consumed: bool,
}

#[derive(Default)]
pub struct HandlerRegistry {
    entries: Mutex<Vec<Arc<HandlerEntry>>>,
    next_handle: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&self, callback: F, matcher: Matcher, options: HandlerOptions) -> HandlerRef
    where
        F: Fn(&Stanza) -> bool + Send + Sync + 'static,
    {
        let handle = HandlerRef(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let specificity = matcher.specificity();
        let entry = Arc::new(HandlerEntry {
            handle,
            matcher,
            options,
            callback: Box::new(callback),
            removed: AtomicBool::new(false),
        });

        let mut entries = self.lock();
        // after every entry at least as specific, keeping registration order
        let position = entries
            .iter()
            .position(|existing| existing.matcher.specificity() < specificity)
            .unwrap_or(entries.len());
        entries.insert(position, entry);
        handle
    }

    /// Remove a handler. Returns `false` if it was already gone.
    pub fn remove(&self, handle: HandlerRef) -> bool {
        let mut entries = self.lock();
        let Some(position) = entries.iter().position(|entry| entry.handle == handle) else {
            return false;
        };
        let entry = entries.remove(position);
        entry.removed.store(true, Ordering::Release);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run every matching handler against `stanza`.
    ///
    /// Iterates a snapshot, so callbacks may add or remove handlers; a handler
    /// removed mid-dispatch is skipped. A panicking callback is logged and
    /// counted as matched.
    pub fn dispatch(&self, stanza: &Stanza) -> DispatchOutcome {
        let snapshot: Vec<Arc<HandlerEntry>> = self.lock().clone();
        let mut outcome = DispatchOutcome::default();

        for entry in snapshot {
            if entry.removed.load(Ordering::Acquire) || !entry.matcher.matches(stanza, entry.options) {
                continue;
            }
            outcome.matched += 1;

            match catch_unwind(AssertUnwindSafe(|| (entry.callback)(stanza))) {
                Ok(true) if entry.matcher.id.is_some() => {
                    debug!(handler = entry.handle.0, "stanza consumed by id handler");
                    outcome.consumed = true;
                    break;
                }
                Ok(_) => {}
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(
                        handler = entry.handle.0,
                        stanza = stanza.name(),
                        panic = %message,
                        "stanza handler panicked"
                    );
                }
            }
        }

        outcome
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<HandlerEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
