//! The name table: unique-name allocation and well-known-name ownership.
//!
//! Mirrors the ownership-queue semantics of the `org.freedesktop.DBus`
//! `RequestName`/`ReleaseName` methods, plus the unique-name bookkeeping
//! and listener-under-lock contract needed once a single daemon can have
//! virtual endpoints (names owned by a peer daemon) alongside local ones.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use enumflags2::BitFlags;
use parking_lot::RwLock;
use zbus::{
    fdo::{ReleaseNameReply, RequestNameFlags, RequestNameReply},
    names::{OwnedUniqueName, OwnedWellKnownName, UniqueName, WellKnownName},
};

/// One observed ownership transition, handed to every registered
/// listener in the order it occurred.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameOwnerChanged {
    pub name: NameChanged,
    pub old_owner: Option<OwnedUniqueName>,
    pub new_owner: Option<OwnedUniqueName>,
}

/// Which kind of name changed hands; kept distinct from `BusName` so
/// callers don't need to re-derive whether a name is unique or
/// well-known from its spelling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameChanged {
    Unique(OwnedUniqueName),
    WellKnown(OwnedWellKnownName),
}

type Listener = Box<dyn Fn(&NameOwnerChanged) + Send + Sync>;

#[derive(Clone)]
struct QueuedOwner {
    unique_name: OwnedUniqueName,
    allow_replacement: bool,
    do_not_queue: bool,
}

struct NameEntry {
    head: QueuedOwner,
    queue: VecDeque<QueuedOwner>,
}

struct Inner {
    unique_names: HashSet<OwnedUniqueName>,
    aliases: HashMap<OwnedWellKnownName, NameEntry>,
}

/// The name table.
///
/// A single `parking_lot::RwLock` guards both maps; listener callbacks
/// are invoked while that lock is held, so that any two listeners agree
/// on the order in which they observe ownership changes (§5's ordering
/// guarantee). Listener closures must not call back into a
/// name-table-mutating method — doing so deadlocks.
#[derive(Clone)]
pub struct NameRegistry {
    short_guid: Arc<String>,
    next_id: Arc<AtomicU64>,
    inner: Arc<RwLock<Inner>>,
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl NameRegistry {
    pub fn new(short_guid: String) -> Self {
        Self {
            short_guid: Arc::new(short_guid),
            next_id: Arc::new(AtomicU64::new(0)),
            inner: Arc::new(RwLock::new(Inner {
                unique_names: HashSet::new(),
                aliases: HashMap::new(),
            })),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn short_guid(&self) -> &str {
        &self.short_guid
    }

    /// Registers a listener invoked, in order, for every ownership
    /// change this table makes. See the struct docs for the locking
    /// contract.
    pub fn add_listener(&self, listener: Listener) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, change: NameOwnerChanged) -> NameOwnerChanged {
        for listener in self.listeners.read().iter() {
            listener(&change);
        }

        change
    }

    /// Allocates a fresh unique name of the form `:<short-guid>.<n>` and
    /// registers it. Emits `NameOwnerChanged(unique, None, unique)`.
    pub fn allocate_unique_name(&self) -> (OwnedUniqueName, NameOwnerChanged) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let unique_name = OwnedUniqueName::try_from(format!(":{}.{}", self.short_guid, id))
            .expect("generated unique name is always well-formed");

        let mut inner = self.inner.write();
        inner.unique_names.insert(unique_name.clone());
        let change = self.notify(NameOwnerChanged {
            name: NameChanged::Unique(unique_name.clone()),
            old_owner: None,
            new_owner: Some(unique_name.clone()),
        });
        drop(inner);

        (unique_name, change)
    }

    /// Registers a unique name allocated on a remote daemon, for a
    /// virtual endpoint. Does *not* emit a change: virtual-endpoint
    /// appearance is signaled by the federation layer through
    /// `ExchangeNames`/`NameChanged`, not `NameOwnerChanged`.
    pub fn insert_foreign_unique_name(&self, unique_name: OwnedUniqueName) -> bool {
        self.inner.write().unique_names.insert(unique_name)
    }

    pub fn contains_unique_name(&self, name: &UniqueName<'_>) -> bool {
        self.inner.read().unique_names.contains(name.as_str())
    }

    /// Removes a unique name, releasing every well-known name it headed
    /// (cascading to the next queued owner) and silently dropping it
    /// from any queue it merely sat in. Returns every emitted change,
    /// the unique-name removal itself last.
    pub fn remove_unique_name(&self, name: &UniqueName<'_>) -> Vec<NameOwnerChanged> {
        let mut changes = Vec::new();
        let mut inner = self.inner.write();

        let headed: Vec<OwnedWellKnownName> = inner
            .aliases
            .iter()
            .filter(|(_, entry)| entry.head.unique_name == *name)
            .map(|(alias, _)| alias.clone())
            .collect();

        for alias in headed {
            if let Some(change) = release_locked(&mut inner, alias.into(), name) {
                changes.push(self.notify(change));
            }
        }

        for entry in inner.aliases.values_mut() {
            entry.queue.retain(|q| q.unique_name != *name);
        }

        inner.unique_names.remove(name.as_str());
        changes.push(self.notify(NameOwnerChanged {
            name: NameChanged::Unique(name.to_owned().into()),
            old_owner: Some(name.to_owned().into()),
            new_owner: None,
        }));

        changes
    }

    /// `RequestName`.
    pub fn request_name(
        &self,
        name: OwnedWellKnownName,
        owner: OwnedUniqueName,
        flags: BitFlags<RequestNameFlags>,
    ) -> (RequestNameReply, Option<NameOwnerChanged>) {
        let allow_replacement = flags.contains(RequestNameFlags::AllowReplacement);
        let do_not_queue = flags.contains(RequestNameFlags::DoNotQueue);
        let candidate = QueuedOwner {
            unique_name: owner.clone(),
            allow_replacement,
            do_not_queue,
        };

        let mut inner = self.inner.write();
        let (reply, change) = match inner.aliases.get_mut(&name) {
            None => {
                inner.aliases.insert(
                    name.clone(),
                    NameEntry {
                        head: candidate,
                        queue: VecDeque::new(),
                    },
                );

                (
                    RequestNameReply::PrimaryOwner,
                    Some(NameOwnerChanged {
                        name: NameChanged::WellKnown(name),
                        old_owner: None,
                        new_owner: Some(owner),
                    }),
                )
            }
            Some(entry) => {
                if entry.head.unique_name == owner {
                    (RequestNameReply::AlreadyOwner, None)
                } else if flags.contains(RequestNameFlags::ReplaceExisting)
                    && entry.head.allow_replacement
                {
                    let old_head = std::mem::replace(&mut entry.head, candidate);
                    if !old_head.do_not_queue {
                        entry.queue.push_back(old_head.clone());
                    }

                    (
                        RequestNameReply::PrimaryOwner,
                        Some(NameOwnerChanged {
                            name: NameChanged::WellKnown(name),
                            old_owner: Some(old_head.unique_name),
                            new_owner: Some(owner),
                        }),
                    )
                } else if !do_not_queue {
                    entry.queue.push_back(candidate);

                    (RequestNameReply::InQueue, None)
                } else {
                    (RequestNameReply::Exists, None)
                }
            }
        };
        let change = change.map(|change| self.notify(change));
        drop(inner);

        (reply, change)
    }

    /// `ReleaseName`.
    pub fn release_name(
        &self,
        name: WellKnownName<'_>,
        owner: &UniqueName<'_>,
    ) -> (ReleaseNameReply, Option<NameOwnerChanged>) {
        let mut inner = self.inner.write();
        let change = release_locked(&mut inner, name.into(), owner);
        let reply = match &change {
            Some(_) => ReleaseNameReply::Released,
            None if inner.aliases.contains_key(name.as_str()) => ReleaseNameReply::NotOwner,
            None => ReleaseNameReply::NonExistent,
        };
        let change = change.map(|change| self.notify(change));
        drop(inner);

        (reply, change)
    }

    /// Releases every well-known name (owned or merely queued-on) held
    /// by `owner`, without removing its unique name. Used when an
    /// endpoint becomes a monitor (which implicitly may not keep
    /// well-known names) or similar bulk-release situations.
    pub fn release_all(&self, owner: &UniqueName<'_>) -> Vec<NameOwnerChanged> {
        let mut changes = Vec::new();
        let mut inner = self.inner.write();

        let headed: Vec<OwnedWellKnownName> = inner
            .aliases
            .iter()
            .filter(|(_, entry)| entry.head.unique_name == *owner)
            .map(|(alias, _)| alias.clone())
            .collect();

        for alias in headed {
            if let Some(change) = release_locked(&mut inner, alias.into(), owner) {
                changes.push(self.notify(change));
            }
        }
        for entry in inner.aliases.values_mut() {
            entry.queue.retain(|q| q.unique_name != *owner);
        }

        changes
    }

    /// Attributes ownership of `name` directly to `new_owner`, used by
    /// the federation layer when a peer daemon's `ExchangeNames`/
    /// `NameChanged` declares a well-known name owned by one of its
    /// virtual endpoints. Bypasses the local queueing rules: the remote
    /// daemon is authoritative for names it reports. Returns whether
    /// this changed the locally-visible owner.
    pub fn set_virtual_alias(
        &self,
        name: OwnedWellKnownName,
        new_owner: OwnedUniqueName,
    ) -> (bool, Option<NameOwnerChanged>) {
        let mut inner = self.inner.write();
        let old_owner = inner.aliases.get(&name).map(|e| e.head.unique_name.clone());
        if old_owner.as_ref() == Some(&new_owner) {
            return (false, None);
        }

        inner.aliases.insert(
            name.clone(),
            NameEntry {
                head: QueuedOwner {
                    unique_name: new_owner.clone(),
                    allow_replacement: true,
                    do_not_queue: false,
                },
                queue: VecDeque::new(),
            },
        );

        let change = self.notify(NameOwnerChanged {
            name: NameChanged::WellKnown(name),
            old_owner,
            new_owner: Some(new_owner),
        });
        drop(inner);

        (true, Some(change))
    }

    /// Resolves a well-known name to its current head owner.
    pub fn lookup(&self, name: WellKnownName<'_>) -> Option<OwnedUniqueName> {
        self.inner
            .read()
            .aliases
            .get(name.as_str())
            .map(|e| e.head.unique_name.clone())
    }

    pub fn waiting_list(&self, name: WellKnownName<'_>) -> Option<Vec<OwnedUniqueName>> {
        self.inner.read().aliases.get(name.as_str()).map(|entry| {
            entry
                .queue
                .iter()
                .map(|q| q.unique_name.clone())
                .collect()
        })
    }

    /// Snapshot of every currently-owned well-known name and its head
    /// owner, for `ListNames`.
    pub fn all_names(&self) -> HashMap<OwnedWellKnownName, OwnedUniqueName> {
        self.inner
            .read()
            .aliases
            .iter()
            .map(|(name, entry)| (name.clone(), entry.head.unique_name.clone()))
            .collect()
    }

    /// Snapshot grouped by unique name, for the `ExchangeNames` gossip
    /// protocol: every locally-known unique name paired with the
    /// well-known aliases it currently heads.
    pub fn bus_names_snapshot(&self) -> Vec<(OwnedUniqueName, Vec<OwnedWellKnownName>)> {
        let inner = self.inner.read();
        let mut by_owner: HashMap<OwnedUniqueName, Vec<OwnedWellKnownName>> = inner
            .unique_names
            .iter()
            .map(|name| (name.clone(), Vec::new()))
            .collect();

        for (alias, entry) in &inner.aliases {
            by_owner
                .entry(entry.head.unique_name.clone())
                .or_default()
                .push(alias.clone());
        }

        by_owner.into_iter().collect()
    }
}

fn release_locked(
    inner: &mut Inner,
    name: OwnedWellKnownName,
    owner: &UniqueName<'_>,
) -> Option<NameOwnerChanged> {
    let entry = inner.aliases.get_mut(&name)?;

    if entry.head.unique_name != *owner {
        // Removing a queued (non-head) candidate isn't an ownership
        // transfer, so no `NameOwnerChanged` is emitted either way.
        entry.queue.retain(|q| q.unique_name != *owner);

        return None;
    }

    let change = match entry.queue.pop_front() {
        Some(next) => {
            let old_owner = entry.head.unique_name.clone();
            entry.head = next;

            NameOwnerChanged {
                name: NameChanged::WellKnown(name),
                old_owner: Some(old_owner),
                new_owner: Some(entry.head.unique_name.clone()),
            }
        }
        None => {
            inner.aliases.remove(&name);

            NameOwnerChanged {
                name: NameChanged::WellKnown(name),
                old_owner: Some(owner.to_owned().into()),
                new_owner: None,
            }
        }
    };

    Some(change)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    fn unique(s: &str) -> OwnedUniqueName {
        OwnedUniqueName::try_from(s).unwrap()
    }

    fn well_known(s: &str) -> OwnedWellKnownName {
        OwnedWellKnownName::try_from(s).unwrap()
    }

    #[test]
    fn unique_name_allocation_is_monotonic_and_unique() {
        let table = NameRegistry::new("abcd1234".into());
        let (n1, _) = table.allocate_unique_name();
        let (n2, _) = table.allocate_unique_name();
        assert_ne!(n1, n2);
        assert!(table.contains_unique_name(&n1.into()));
    }

    #[test]
    fn queue_then_replace_scenario() {
        // Mirrors the distilled spec's "queue then replace" scenario.
        let table = NameRegistry::new("g".into());
        let e1 = unique(":g.1");
        let e2 = unique(":g.2");
        let e3 = unique(":g.3");
        let name = well_known("x.Y");

        let (r1, _) = table.request_name(name.clone(), e1.clone(), BitFlags::empty());
        assert_eq!(r1, RequestNameReply::PrimaryOwner);

        let (r2, c2) = table.request_name(
            name.clone(),
            e2.clone(),
            RequestNameFlags::AllowReplacement.into(),
        );
        assert_eq!(r2, RequestNameReply::InQueue);
        assert!(c2.is_none());

        let (r3, c3) = table.request_name(
            name.clone(),
            e3.clone(),
            RequestNameFlags::DoNotQueue | RequestNameFlags::ReplaceExisting,
        );
        assert_eq!(r3, RequestNameReply::PrimaryOwner);
        let c3 = c3.unwrap();
        assert_eq!(c3.old_owner, Some(e1.clone()));
        assert_eq!(c3.new_owner, Some(e3.clone()));

        // e1 requested no special flags, so it's requeued behind e2.
        let waiting = table.waiting_list(name.as_ref().into()).unwrap();
        assert_eq!(waiting, vec![e2.clone(), e1.clone()]);

        // e3 disconnects: next in queue (e2) becomes owner.
        let changes = table.remove_unique_name(&e3.as_ref());
        let alias_change = changes
            .iter()
            .find(|c| matches!(&c.name, NameChanged::WellKnown(n) if n == &name))
            .unwrap();
        assert_eq!(alias_change.old_owner, Some(e3.clone()));
        assert_eq!(alias_change.new_owner, Some(e2.clone()));
    }

    #[test]
    fn do_not_queue_loses_to_existing_owner() {
        let table = NameRegistry::new("g".into());
        let e1 = unique(":g.1");
        let e2 = unique(":g.2");
        let name = well_known("x.Y");

        table.request_name(name.clone(), e1, BitFlags::empty());
        let (reply, change) =
            table.request_name(name, e2, RequestNameFlags::DoNotQueue.into());
        assert_eq!(reply, RequestNameReply::Exists);
        assert!(change.is_none());
    }

    #[test]
    fn queue_never_contains_current_head() {
        let table = NameRegistry::new("g".into());
        let name = well_known("x.Y");
        let owners: Vec<_> = (0..4).map(|i| unique(&format!(":g.{i}"))).collect();
        for owner in &owners {
            table.request_name(name.clone(), owner.clone(), BitFlags::empty());
        }

        let waiting = table.waiting_list(name.as_ref().into()).unwrap();
        let head = table.lookup(name.as_ref().into()).unwrap();
        assert!(!waiting.contains(&head));
    }

    #[test]
    fn release_promotes_next_queued_owner() {
        let table = NameRegistry::new("g".into());
        let e1 = unique(":g.1");
        let e2 = unique(":g.2");
        let name = well_known("x.Y");

        table.request_name(name.clone(), e1.clone(), BitFlags::empty());
        table.request_name(name.clone(), e2.clone(), BitFlags::empty());

        let (reply, change) = table.release_name(name.as_ref().into(), &e1.as_ref());
        assert_eq!(reply, ReleaseNameReply::Released);
        let change = change.unwrap();
        assert_eq!(change.old_owner, Some(e1));
        assert_eq!(change.new_owner, Some(e2.clone()));
        assert_eq!(table.lookup(name.as_ref().into()), Some(e2));
    }

    #[test]
    fn listeners_observe_changes_in_order() {
        let table = NameRegistry::new("g".into());
        let seen = Arc::new(RwLock::new(Vec::new()));
        let seen_clone = seen.clone();
        table.add_listener(Box::new(move |change| {
            seen_clone.write().push(change.clone());
        }));

        let name = well_known("x.Y");
        table.request_name(name.clone(), unique(":g.1"), BitFlags::empty());
        table.request_name(name, unique(":g.2"), BitFlags::empty());

        assert_eq!(seen.read().len(), 1); // second request only joined the queue
    }
}
