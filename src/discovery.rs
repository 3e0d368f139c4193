//! Advertise/discover bookkeeping for the control plane (§4.6).
//!
//! Mirrors the reference daemon's `AllJoynObj` name-service tables: an
//! `AdvertiseName` call registers a name with a TTL; `FindAdvertisedName`
//! registers interest in a prefix and is notified (`FoundAdvertisedName`)
//! of every currently- and later-advertised name under it. A background
//! reaper expires advertisements whose TTL has lapsed and emits
//! `LostAdvertisedName` for them, waking early via [`event_listener`]
//! whenever a fresh advertisement might move the next deadline earlier.

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use event_listener::Event;
use parking_lot::RwLock;
use zbus::names::OwnedUniqueName;

/// How long an advertisement lives without being refreshed, absent any
/// narrower configured floor.
pub const DEFAULT_ADVERTISE_TTL: Duration = Duration::from_secs(120);

#[derive(Clone, Debug)]
struct Advertisement {
    owner: OwnedUniqueName,
    expires_at: Instant,
}

/// One discovered-or-lost transition the reaper (or an `AdvertiseName`/
/// `CancelAdvertiseName` call) produces, for the control plane to turn
/// into `FoundAdvertisedName`/`LostAdvertisedName` signals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameMapEvent {
    Found { name: String, owner: OwnedUniqueName },
    Lost { name: String, owner: OwnedUniqueName },
}

pub struct DiscoveryMap {
    advertised: RwLock<HashMap<String, Advertisement>>,
    /// Endpoints interested in names under a given prefix.
    watchers: RwLock<HashMap<String, HashSet<OwnedUniqueName>>>,
    wake: Event,
    /// Effective advertise TTL, already clamped against the configured
    /// floor (`Config::observed_name_ttl_floor_ms`, §4.9).
    ttl: Duration,
}

impl Default for DiscoveryMap {
    fn default() -> Self {
        Self::new(DEFAULT_ADVERTISE_TTL)
    }
}

impl DiscoveryMap {
    pub fn new(ttl: Duration) -> Self {
        Self {
            advertised: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            wake: Event::new(),
            ttl,
        }
    }

    /// Registers (or refreshes) `name` as advertised by `owner`.
    /// Returns a `Found` event addressed to every watcher whose prefix
    /// matches, so the caller can unicast each one to the right
    /// connection rather than guessing a single recipient.
    pub fn advertise(
        &self,
        name: String,
        owner: OwnedUniqueName,
    ) -> Vec<(OwnedUniqueName, NameMapEvent)> {
        self.advertised.write().insert(
            name.clone(),
            Advertisement {
                owner: owner.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        self.wake.notify(usize::MAX);

        self.matching_watchers(&name)
            .into_iter()
            .map(|watcher| {
                (
                    watcher,
                    NameMapEvent::Found {
                        name: name.clone(),
                        owner: owner.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn cancel_advertise(
        &self,
        name: &str,
        owner: &OwnedUniqueName,
    ) -> Vec<(OwnedUniqueName, NameMapEvent)> {
        let mut advertised = self.advertised.write();
        if advertised.get(name).map(|a| &a.owner) != Some(owner) {
            return Vec::new();
        }
        advertised.remove(name);
        drop(advertised);

        self.matching_watchers(name)
            .into_iter()
            .map(|watcher| {
                (
                    watcher,
                    NameMapEvent::Lost {
                        name: name.to_string(),
                        owner: owner.clone(),
                    },
                )
            })
            .collect()
    }

    /// Drops every advertisement owned by `owner`, e.g. on disconnect.
    pub fn cancel_all(&self, owner: &OwnedUniqueName) -> Vec<(OwnedUniqueName, NameMapEvent)> {
        let mut advertised = self.advertised.write();
        let dropped: Vec<_> = advertised
            .iter()
            .filter(|(_, a)| &a.owner == owner)
            .map(|(name, a)| (name.clone(), a.owner.clone()))
            .collect();
        for (name, _) in &dropped {
            advertised.remove(name);
        }
        drop(advertised);

        dropped
            .into_iter()
            .flat_map(|(name, owner)| {
                self.matching_watchers(&name)
                    .into_iter()
                    .map(move |watcher| {
                        (
                            watcher,
                            NameMapEvent::Lost {
                                name: name.clone(),
                                owner: owner.clone(),
                            },
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Registers `watcher` as interested in every currently- and
    /// future-advertised name under `prefix`, returning the names
    /// already advertised so the caller can emit their `Found` events
    /// immediately.
    pub fn find(&self, prefix: String, watcher: OwnedUniqueName) -> Vec<(String, OwnedUniqueName)> {
        let already: Vec<_> = self
            .advertised
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(&prefix))
            .map(|(name, a)| (name.clone(), a.owner.clone()))
            .collect();

        self.watchers.write().entry(prefix).or_default().insert(watcher);

        already
    }

    pub fn cancel_find(&self, prefix: &str, watcher: &OwnedUniqueName) {
        if let Some(set) = self.watchers.write().get_mut(prefix) {
            set.remove(watcher);
        }
    }

    pub fn advertised_names(&self) -> Vec<String> {
        self.advertised.read().keys().cloned().collect()
    }

    fn matching_watchers(&self, name: &str) -> Vec<OwnedUniqueName> {
        self.watchers
            .read()
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
            .flat_map(|(_, set)| set.iter().cloned())
            .collect()
    }

    /// Removes and returns every expired advertisement as of now.
    fn reap_expired(&self) -> Vec<(OwnedUniqueName, NameMapEvent)> {
        let now = Instant::now();
        let mut advertised = self.advertised.write();
        let expired: Vec<_> = advertised
            .iter()
            .filter(|(_, a)| a.expires_at <= now)
            .map(|(name, a)| (name.clone(), a.owner.clone()))
            .collect();
        for (name, _) in &expired {
            advertised.remove(name);
        }
        drop(advertised);

        expired
            .into_iter()
            .flat_map(|(name, owner)| {
                self.matching_watchers(&name)
                    .into_iter()
                    .map(move |watcher| {
                        (
                            watcher,
                            NameMapEvent::Lost {
                                name: name.clone(),
                                owner: owner.clone(),
                            },
                        )
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.advertised.read().values().map(|a| a.expires_at).min()
    }
}

/// Runs forever, periodically reaping expired advertisements and
/// handing the resulting `(watcher, event)` pairs to `on_event`.
pub async fn run_reaper<F>(map: std::sync::Arc<DiscoveryMap>, on_event: F)
where
    F: Fn(OwnedUniqueName, NameMapEvent) + Send + 'static,
{
    loop {
        let wait = match map.next_deadline() {
            // A few hundred ms of jitter keeps a bus with many
            // simultaneously-expiring advertisements from reaping them
            // all in the exact same tick.
            Some(deadline) => {
                deadline.saturating_duration_since(Instant::now())
                    + Duration::from_millis(fastrand::u64(0..250))
            }
            None => Duration::from_secs(3600),
        };

        let listener = map.wake.listen();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = listener => {}
        }

        for (watcher, event) in map.reap_expired() {
            on_event(watcher, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    fn unique(s: &str) -> OwnedUniqueName {
        OwnedUniqueName::try_from(s).unwrap()
    }

    #[test]
    fn find_reports_already_advertised_names() {
        let map = DiscoveryMap::default();
        map.advertise("com.example.foo".into(), unique(":1.1"));

        let found = map.find("com.example.".into(), unique(":1.2"));
        assert_eq!(found, vec![("com.example.foo".into(), unique(":1.1"))]);
    }

    #[test]
    fn advertise_notifies_existing_watchers() {
        let map = DiscoveryMap::default();
        map.find("com.example.".into(), unique(":1.2"));

        let events = map.advertise("com.example.foo".into(), unique(":1.1"));
        assert_eq!(
            events,
            vec![(
                unique(":1.2"),
                NameMapEvent::Found {
                    name: "com.example.foo".into(),
                    owner: unique(":1.1"),
                }
            )]
        );
    }

    #[test]
    fn cancel_advertise_requires_matching_owner() {
        let map = DiscoveryMap::default();
        map.advertise("com.example.foo".into(), unique(":1.1"));

        assert!(map
            .cancel_advertise("com.example.foo", &unique(":1.2"))
            .is_empty());
        assert!(!map
            .cancel_advertise("com.example.foo", &unique(":1.1"))
            .is_empty());
    }
}
