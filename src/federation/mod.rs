//! Bus-to-bus federation: tracking the other daemons we're linked to
//! and the participants they vouch for (§4.4, §4.5).
//!
//! A [`VirtualEndpoint`] represents one unique name owned by a remote
//! daemon's local client. It holds no direct connection of its own —
//! only non-owning [`Weak`] references into the [`crate::remote`]
//! links that can reach it, since ownership of a bus-to-bus link
//! belongs to the router's endpoint table and to [`FederationTable`],
//! never to the virtual endpoints riding on top of it. When every
//! route a virtual endpoint held has died, the next push attempt
//! simply fails with "no route" and the router's caller is responsible
//! for tearing the virtual endpoint down (normally driven by the
//! `NameChanged` gossip that follows a link loss).
//!
//! Lock order when a single operation needs more than one of these
//! tables: `name_registry` before `virtual_endpoints` before
//! `bus2bus`, matching the documented order for the rest of the crate.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use anyhow::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};
use zbus::{
    names::{BusName, OwnedUniqueName, OwnedWellKnownName},
    zvariant::{Optional, Type},
    Connection, Message,
};

use crate::{
    endpoint::{no_route_error, Endpoint as RouterEndpoint},
    names::is_local_guid,
    remote::{self, handshake},
    router::Router,
};

/// One remote unique name, reachable through zero or more bus-to-bus
/// links (usually exactly one).
pub struct VirtualEndpoint {
    unique_name: OwnedUniqueName,
    routes: RwLock<Vec<Weak<remote::Endpoint>>>,
}

impl VirtualEndpoint {
    pub fn unique_name(&self) -> &OwnedUniqueName {
        &self.unique_name
    }

    /// Appends `route` if it isn't already present, also pruning any
    /// dead routes found along the way. Returns whether this actually
    /// added anything (§8 "Route idempotence": re-adding the same
    /// bus-to-bus link is a no-op).
    pub fn add_route(&self, route: Weak<remote::Endpoint>) -> bool {
        let mut routes = self.routes.write();
        let already_present = routes.iter().any(|r| Weak::ptr_eq(r, &route));
        routes.retain(|r| r.strong_count() > 0);
        if already_present {
            return false;
        }
        routes.push(route);
        true
    }

    pub fn is_routable(&self) -> bool {
        self.routes.read().iter().any(|r| Weak::strong_count(r) > 0)
    }

    pub async fn push(&self, msg: Arc<Message>) -> Result<()> {
        let routes: Vec<_> = self.routes.read().iter().filter_map(Weak::upgrade).collect();
        for route in &routes {
            if route.push(msg.clone()).await.is_ok() {
                return Ok(());
            }
        }
        Err(no_route_error())
    }
}

/// One entry of the `ExchangeNames`/`NameChanged` gossip wire format:
/// a unique name and the well-known names it currently heads.
#[derive(Clone, Debug, Deserialize, Serialize, Type)]
pub struct BusNameEntry {
    pub unique_name: OwnedUniqueName,
    pub well_known_names: Vec<OwnedWellKnownName>,
}

#[derive(Default)]
pub struct FederationTable {
    bus2bus: RwLock<HashMap<String, Arc<remote::Endpoint>>>,
    virtual_endpoints: RwLock<HashMap<OwnedUniqueName, Arc<VirtualEndpoint>>>,
    /// Connect specs we've dialed out to, keyed to the remote GUID the
    /// dial landed on (§4.4 Connect record), so a later `Disconnect` for
    /// the same spec can find the link to hang up without the control
    /// plane having to guess at a GUID.
    dialed_specs: RwLock<HashMap<String, String>>,
}

impl FederationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bus2bus_endpoint(&self, remote_guid: String, endpoint: Arc<remote::Endpoint>) {
        self.bus2bus.write().insert(remote_guid, endpoint);
    }

    pub fn remove_bus2bus_endpoint(&self, remote_guid: &str) -> Option<Arc<remote::Endpoint>> {
        self.bus2bus.write().remove(remote_guid)
    }

    /// Records that dialing `spec` landed a link to `remote_guid`, so a
    /// later `Disconnect(spec)` can find the link to hang up.
    pub fn record_dial(&self, spec: String, remote_guid: String) {
        self.dialed_specs.write().insert(spec, remote_guid);
    }

    /// The remote GUID a prior `Connect(spec)` dialed, if any.
    pub fn guid_for_spec(&self, spec: &str) -> Option<String> {
        self.dialed_specs.read().get(spec).cloned()
    }

    /// Full teardown of a dead bus-to-bus link (§4.3): drops the
    /// `bus2bus` entry, then walks every virtual endpoint dropping any
    /// route it held through this link. A virtual endpoint left with no
    /// routable link at all is removed from the router and the table,
    /// and its loss is gossiped to every other bus-to-bus link as a
    /// `NameChanged(alias, oldOwner, None)` for each well-known name it
    /// still headed — except links sharing `remote_guid` (a second link
    /// to the same daemon would just echo the loss right back).
    pub async fn remove_bus2bus_endpoint_cascade(&self, remote_guid: &str, router: &Router) {
        self.remove_bus2bus_endpoint(remote_guid);
        self.dialed_specs.write().retain(|_, guid| guid != remote_guid);

        let orphaned: Vec<Arc<VirtualEndpoint>> = {
            let virtual_endpoints = self.virtual_endpoints.read();
            virtual_endpoints
                .values()
                .filter(|ve| !ve.is_routable())
                .cloned()
                .collect()
        };

        for virt in orphaned {
            self.virtual_endpoints.write().remove(&virt.unique_name);
            let changes = router.unregister_endpoint(virt.unique_name.as_ref());
            for change in changes {
                router
                    .broadcast_name_change_excluding(change, Some(remote_guid))
                    .await;
            }
        }
    }

    pub fn bus2bus_endpoint(&self, remote_guid: &str) -> Option<Arc<remote::Endpoint>> {
        self.bus2bus.read().get(remote_guid).cloned()
    }

    pub fn virtual_endpoint(&self, unique_name: &OwnedUniqueName) -> Option<Arc<VirtualEndpoint>> {
        self.virtual_endpoints.read().get(unique_name).cloned()
    }

    /// Applies a freshly received `ExchangeNames` dump from `remote_guid`:
    /// every reported unique name that isn't already known locally (our
    /// own, or already routed through some other link) gets a
    /// [`VirtualEndpoint`] registered with the router and is inserted
    /// into the [`NameRegistry`] so it shows up in our own
    /// `ExchangeNames` payload to anyone who links to us later; its
    /// well-known names are attributed to it the same way.
    ///
    /// Entries that actually taught us something new are then relayed
    /// to every other bus-to-bus link, GUID-filtered so the gossip
    /// never bounces back to where it came from — this is what lets a
    /// name learned from a two-hop peer reach a third daemon without
    /// waiting for that daemon's own link to be (re-)established (§8
    /// scenario 2).
    ///
    /// A dump that mentions our own GUID's short form is our own
    /// names echoed back through a cycle in the federation graph and
    /// is ignored, per [`is_local_guid`].
    pub async fn apply_exchange_names(
        &self,
        remote_guid: &str,
        link: &Weak<remote::Endpoint>,
        entries: Vec<BusNameEntry>,
        router: &Router,
        local_short_guid: &str,
    ) {
        let mut to_relay = Vec::new();

        for entry in entries {
            if is_local_guid(entry.unique_name.as_ref(), local_short_guid) {
                trace!("ignoring self-loop entry for {}", entry.unique_name);
                continue;
            }

            let virt = self
                .virtual_endpoints
                .write()
                .entry(entry.unique_name.clone())
                .or_insert_with(|| {
                    Arc::new(VirtualEndpoint {
                        unique_name: entry.unique_name.clone(),
                        routes: RwLock::new(Vec::new()),
                    })
                })
                .clone();
            let route_added = virt.add_route(link.clone());
            router.register_endpoint(RouterEndpoint::Virtual(virt.clone()));

            let newly_known = router
                .name_registry()
                .insert_foreign_unique_name(entry.unique_name.clone());

            let mut alias_changed = false;
            for well_known in entry.well_known_names.clone() {
                let (changed, change) = router
                    .name_registry()
                    .set_virtual_alias(well_known, entry.unique_name.clone());
                alias_changed |= changed;
                if let Some(change) = change {
                    trace!("virtual alias from {}: {:?}", remote_guid, change);
                    router
                        .broadcast_name_change_excluding(change, Some(remote_guid))
                        .await;
                }
            }

            if route_added || newly_known || alias_changed {
                to_relay.push(entry);
            }
        }

        if !to_relay.is_empty() {
            self.relay_exchange_names(remote_guid, to_relay).await;
        }
    }

    /// Forwards bus-name entries just learned from `from_guid` to every
    /// other bus-to-bus link, so transitive federation doesn't have to
    /// wait on that other link's own next `ExchangeNames` round.
    async fn relay_exchange_names(&self, from_guid: &str, entries: Vec<BusNameEntry>) {
        for other_guid in self.known_remote_guids() {
            if other_guid == from_guid {
                continue;
            }
            let Some(endpoint) = self.bus2bus_endpoint(&other_guid) else {
                continue;
            };
            if let Err(e) = send_exchange_names(endpoint.conn(), entries.clone()).await {
                warn!("failed to relay exchange-names to {}: {}", other_guid, e);
            }
        }
    }

    /// Applies a single `NameChanged` gossip update and forwards it to
    /// every other bus-to-bus link, never back to `from_guid` — the
    /// self-loop guard that keeps the gossip from circulating forever.
    pub async fn apply_name_changed(
        &self,
        from_guid: &str,
        well_known: OwnedWellKnownName,
        new_owner: Option<OwnedUniqueName>,
        router: &Router,
    ) {
        let name_registry = router.name_registry();
        let change = match new_owner {
            Some(owner) => {
                let (_, change) = name_registry.set_virtual_alias(well_known, owner);
                change
            }
            None => {
                let Some(current_owner) = name_registry.lookup(well_known.as_ref().into()) else {
                    return;
                };
                let (_, change) = name_registry.release_name(well_known.as_ref().into(), current_owner.as_ref());
                change
            }
        };

        if let Some(change) = change {
            debug!("name changed via {}: {:?}", from_guid, change);
            router
                .broadcast_name_change_excluding(change, Some(from_guid))
                .await;
        }
    }

    pub fn known_remote_guids(&self) -> Vec<String> {
        self.bus2bus.read().keys().cloned().collect()
    }
}

pub fn warn_route_failure(unique_name: &OwnedUniqueName, err: &anyhow::Error) {
    warn!("virtual endpoint {} has no usable route: {}", unique_name, err);
}

/// Builds the `ExchangeNames` payload: every locally-owned unique name
/// (not already a virtual endpoint we're only relaying) paired with
/// its well-known aliases.
pub fn exchange_names_payload(router: &Router) -> Vec<BusNameEntry> {
    router
        .name_registry()
        .bus_names_snapshot()
        .into_iter()
        .map(|(unique_name, well_known_names)| BusNameEntry {
            unique_name,
            well_known_names,
        })
        .collect()
}

/// Sends our view of the bus's names to a newly established
/// bus-to-bus link, right after `BusHello` completes in both
/// directions.
pub async fn send_exchange_names(conn: &Connection, payload: Vec<BusNameEntry>) -> zbus::Result<()> {
    conn.call_method(
        None::<&str>,
        handshake::PATH,
        Some(handshake::INTERFACE),
        "ExchangeNames",
        &payload,
    )
    .await?;

    Ok(())
}

/// Forwards one local `NameOwnerChanged` to a single bus-to-bus link as
/// a `NameChanged` method call. Called once per link registered in
/// [`FederationTable`] whenever the [`NameRegistry`] notifies a
/// well-known-name change (unique-name changes aren't federated: a
/// peer's `ExchangeNames` dump and our `Hello`/`BusHello` handshake are
/// the only ways unique names ever become known across the link).
pub async fn send_name_changed(
    conn: &Connection,
    name: OwnedWellKnownName,
    new_owner: Option<OwnedUniqueName>,
) -> zbus::Result<()> {
    conn.call_method(
        None::<&str>,
        handshake::PATH,
        Some(handshake::INTERFACE),
        "NameChanged",
        &(name, Optional::from(new_owner.map(BusName::from))),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{name_registry::NameRegistry, policy::Policy, session::SessionCastMap};
    use std::convert::TryFrom;

    fn unique(s: &str) -> OwnedUniqueName {
        OwnedUniqueName::try_from(s).unwrap()
    }

    fn well_known(s: &str) -> OwnedWellKnownName {
        OwnedWellKnownName::try_from(s).unwrap()
    }

    fn test_router(local_short_guid: &str) -> Router {
        Router::new(
            NameRegistry::new(local_short_guid.to_string()),
            SessionCastMap::new(),
            Policy::default(),
        )
    }

    #[test]
    fn add_route_is_idempotent_for_the_same_link() {
        // §8 "Route idempotence": adding the same bus-to-bus link twice
        // reports "not added" the second time.
        let virt = VirtualEndpoint {
            unique_name: unique(":g.1"),
            routes: RwLock::new(Vec::new()),
        };
        let route: Weak<remote::Endpoint> = Weak::new();

        assert!(virt.add_route(route.clone()));
        assert!(!virt.add_route(route.clone()));
    }

    #[tokio::test]
    async fn exchange_names_skips_entries_claiming_the_local_guid() {
        // §8 scenario 6 "self-loop guard".
        let router = test_router("localg1");
        let table = FederationTable::new();
        let link: Weak<remote::Endpoint> = Weak::new();

        let entries = vec![BusNameEntry {
            unique_name: unique(":localg1.17"),
            well_known_names: vec![well_known("com.example.Self")],
        }];

        table
            .apply_exchange_names("remoteguid", &link, entries, &router, "localg1")
            .await;

        assert!(table.virtual_endpoint(&unique(":localg1.17")).is_none());
        assert!(router
            .name_registry()
            .lookup(well_known("com.example.Self").as_ref().into())
            .is_none());
    }

    #[tokio::test]
    async fn exchange_names_creates_virtual_endpoint_for_remote_names() {
        let router = test_router("localg1");
        let table = FederationTable::new();
        let link: Weak<remote::Endpoint> = Weak::new();

        let entries = vec![BusNameEntry {
            unique_name: unique(":remoteg.3"),
            well_known_names: vec![well_known("com.example.Remote")],
        }];

        table
            .apply_exchange_names("remoteguid", &link, entries, &router, "localg1")
            .await;

        assert!(table.virtual_endpoint(&unique(":remoteg.3")).is_some());
        assert_eq!(
            router
                .name_registry()
                .lookup(well_known("com.example.Remote").as_ref().into()),
            Some(unique(":remoteg.3"))
        );
    }

    #[tokio::test]
    async fn exchange_names_makes_remote_names_relayable_to_new_links() {
        // §8 scenario 2: a name learned over one link must show up in
        // our own snapshot so it reaches a daemon that links to us later.
        let router = test_router("localg1");
        let table = FederationTable::new();
        let link: Weak<remote::Endpoint> = Weak::new();

        let entries = vec![BusNameEntry {
            unique_name: unique(":remoteg.3"),
            well_known_names: vec![well_known("com.example.Remote")],
        }];

        table
            .apply_exchange_names("remoteguid", &link, entries, &router, "localg1")
            .await;

        let snapshot = router.name_registry().bus_names_snapshot();
        assert!(snapshot
            .iter()
            .any(|(name, aliases)| *name == unique(":remoteg.3")
                && aliases.contains(&well_known("com.example.Remote"))));
    }

    #[test]
    fn dialed_specs_round_trips_and_is_purged_on_teardown() {
        let table = FederationTable::new();
        table.record_dial("tcp:host=10.0.0.2,port=9955".to_string(), "remoteguid".to_string());

        assert_eq!(
            table.guid_for_spec("tcp:host=10.0.0.2,port=9955"),
            Some("remoteguid".to_string())
        );

        table.dialed_specs.write().retain(|_, guid| guid != "remoteguid");
        assert_eq!(table.guid_for_spec("tcp:host=10.0.0.2,port=9955"), None);
    }
}
