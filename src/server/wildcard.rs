//! Tag discovery and the wildcard -> composite-tag map (spec §4.11).
//!
//! Shared between every connection and the embedding process, so it's a
//! standalone component reached through `Arc`, not owned by any one
//! connection. Lock order when both are needed: known-tags before
//! wildcard map, per spec §5.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Callback surface for the embedding process (spec §4.11). Default
/// implementations are no-ops, matching the ambient-scaffolding role of
/// this notification consumer.
pub trait WildcardObserver: Send + Sync {
    /// A wildcard tag gained its first (or another) concrete composite.
    fn on_resolved(&self, _wildcard: &str, _composite: &str) {}

    /// A wildcard tag lost its last composite.
    fn on_removed(&self, _wildcard: &str) {}
}

#[derive(Default)]
struct KnownTags {
    known: HashSet<String>,
    seen_since_last_batch: Vec<String>,
}

#[derive(Default)]
struct WildcardMap {
    composites: HashMap<String, HashSet<String>>,
}

/// Per-receiver known-wildcards set plus wildcard -> composites map.
pub struct WildcardRegistry {
    tags: Mutex<KnownTags>,
    map: Mutex<WildcardMap>,
    observer: Box<dyn WildcardObserver>,
}

impl std::fmt::Debug for WildcardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WildcardRegistry").finish_non_exhaustive()
    }
}

struct NoopObserver;
impl WildcardObserver for NoopObserver {}

impl Default for WildcardRegistry {
    fn default() -> Self {
        Self::new(Box::new(NoopObserver))
    }
}

impl WildcardRegistry {
    pub fn new(observer: Box<dyn WildcardObserver>) -> Self {
        Self {
            tags: Mutex::new(KnownTags::default()),
            map: Mutex::new(WildcardMap::default()),
            observer,
        }
    }

    /// Registers `composite` under `wildcard`, publishing a device-discovery
    /// notification the first time `wildcard` is seen, then invoking
    /// `on_resolved` outside any lock.
    pub fn register(&self, wildcard: &str, composite: &str) {
        let first_sight = {
            let mut tags = self.tags.lock().unwrap();
            let first_sight = tags.known.insert(wildcard.to_owned());
            if first_sight {
                tags.seen_since_last_batch.push(wildcard.to_owned());
            }
            first_sight
        };
        if first_sight {
            log::debug!(target: "screamroute_pulse::wildcard", "discovered {wildcard:?}");
        }

        {
            let mut map = self.map.lock().unwrap();
            map.composites
                .entry(wildcard.to_owned())
                .or_default()
                .insert(composite.to_owned());
        }

        self.observer.on_resolved(wildcard, composite);
    }

    /// Removes `composite` from `wildcard`'s set. If that was the last
    /// composite, calls `on_removed` outside any lock.
    pub fn remove(&self, wildcard: &str, composite: &str) {
        let now_empty = {
            let mut map = self.map.lock().unwrap();
            match map.composites.get_mut(wildcard) {
                Some(set) => {
                    set.remove(composite);
                    let empty = set.is_empty();
                    if empty {
                        map.composites.remove(wildcard);
                    }
                    empty
                }
                None => false,
            }
        };

        if now_empty {
            log::debug!(target: "screamroute_pulse::wildcard", "withdrawn {wildcard:?}");
            self.observer.on_removed(wildcard);
        }
    }

    /// Drains and returns the batch of wildcards seen since the last call.
    pub fn take_seen_batch(&self) -> Vec<String> {
        std::mem::take(&mut self.tags.lock().unwrap().seen_since_last_batch)
    }

    pub fn composite_count(&self, wildcard: &str) -> usize {
        self.map
            .lock()
            .unwrap()
            .composites
            .get(wildcard)
            .map_or(0, |set| set.len())
    }
}

/// Builds the composite tag `"<peer_identity> <program>"` (NULs stripped),
/// per spec §3's Wildcard/composite tag definition. `program` falls back to
/// `"PulseClient"` if empty.
pub fn composite_tag(peer_identity: &str, program: &str, uniquifier: u32) -> String {
    let program = if program.is_empty() {
        "PulseClient"
    } else {
        program
    };
    let base = format!("{peer_identity} {program}").replace('\0', "");
    format!("{base}#{uniquifier:06x}")
}

/// The composite tag with its uniquifier stripped.
pub fn base_tag(peer_identity: &str, program: &str) -> String {
    let program = if program.is_empty() {
        "PulseClient"
    } else {
        program
    };
    format!("{peer_identity} {program}").replace('\0', "")
}

/// The wildcard tag for a base tag: the base tag with `*` appended.
pub fn wildcard_tag(base: &str) -> String {
    format!("{base}*")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn composite_tag_strips_nuls_and_uniquifies() {
        let tag = composite_tag("127.0.0.1", "firefox\0", 5);
        assert_eq!(tag, "127.0.0.1 firefox#000005");
    }

    #[test]
    fn composite_tag_falls_back_to_pulseclient() {
        let tag = composite_tag("local", "", 0);
        assert_eq!(tag, "local PulseClient#000000");
    }

    #[test]
    fn wildcard_tag_appends_star() {
        assert_eq!(wildcard_tag("local PulseClient#000000"), "local PulseClient#000000*");
    }

    #[derive(Default)]
    struct CountingObserver {
        resolved: AtomicUsize,
        removed: AtomicUsize,
    }

    impl WildcardObserver for CountingObserver {
        fn on_resolved(&self, _wildcard: &str, _composite: &str) {
            self.resolved.fetch_add(1, Ordering::SeqCst);
        }

        fn on_removed(&self, _wildcard: &str) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn first_registration_reports_discovery_and_resolution() {
        let registry = WildcardRegistry::default();
        registry.register("local PulseClient*", "local PulseClient#000000");

        assert_eq!(registry.take_seen_batch(), vec!["local PulseClient*"]);
        assert_eq!(registry.composite_count("local PulseClient*"), 1);
        assert!(registry.take_seen_batch().is_empty());
    }

    #[test]
    fn removing_last_composite_calls_on_removed() {
        let observer = std::sync::Arc::new(CountingObserver::default());

        struct Forwarding(std::sync::Arc<CountingObserver>);
        impl WildcardObserver for Forwarding {
            fn on_resolved(&self, wildcard: &str, composite: &str) {
                self.0.on_resolved(wildcard, composite);
            }
            fn on_removed(&self, wildcard: &str) {
                self.0.on_removed(wildcard);
            }
        }

        let registry = WildcardRegistry::new(Box::new(Forwarding(observer.clone())));
        registry.register("w*", "c1");
        registry.remove("w*", "c1");

        assert_eq!(observer.resolved.load(Ordering::SeqCst), 1);
        assert_eq!(observer.removed.load(Ordering::SeqCst), 1);
        assert_eq!(registry.composite_count("w*"), 0);
    }
}
