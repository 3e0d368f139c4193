//! The bus's control-plane object: advertise/discover and the
//! lightweight session layer built on top of [`crate::session`] (§4.6).
//!
//! This is the renamed, narrowed equivalent of the reference daemon's
//! `AllJoynObj` singleton: session *establishment* (`BindSessionPort`,
//! `JoinSession`, `LeaveSession`) is kept simple — a session here is
//! nothing more than a named group of unique names the router already
//! knows how to multicast through via [`crate::session::SessionCastMap`] —
//! while `GetSessionFd` and raw-socket session upgrades, which the
//! original used for high-throughput streaming, are out of scope (see
//! Non-goals) and return `NotSupported`.

use std::{
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;
use zbus::{
    fdo::{Error, Result},
    interface,
    names::{OwnedUniqueName, WellKnownName},
    object_server::SignalEmitter,
    Address,
};

use crate::{
    discovery::{DiscoveryMap, NameMapEvent},
    endpoint::Endpoint,
    federation::FederationTable,
    router::Router,
    session::SessionId,
};

pub const PATH: &str = "/org/meshbus/Bus";
pub const INTERFACE: &str = "org.meshbus.Bus";

#[derive(Default)]
struct Sessions {
    next_id: AtomicU32,
    /// Port a host endpoint bound, so `JoinSession` can find it.
    bound_ports: RwLock<HashMap<(OwnedUniqueName, u16), ()>>,
}

/// Ref-counted bus-to-bus connect records (§3, §4.4): a normalized
/// connect spec maps to every local unique name that's asked to be
/// connected to it. The first requester for a spec triggers a dial; the
/// last one leaving drops the link.
#[derive(Default)]
struct Connections {
    refs: RwLock<HashMap<String, HashSet<OwnedUniqueName>>>,
}

pub struct ControlPlane {
    router: Router,
    discovery: Arc<DiscoveryMap>,
    federation: Arc<FederationTable>,
    sessions: Sessions,
    connections: Connections,
    /// Outbound federation dial requests, drained by the bus's accept
    /// loop, which owns the actual socket connect + handshake (keeping
    /// this object free of any transport-level code).
    dial_tx: UnboundedSender<String>,
}

impl ControlPlane {
    pub fn new(
        router: Router,
        discovery: Arc<DiscoveryMap>,
        federation: Arc<FederationTable>,
        dial_tx: UnboundedSender<String>,
    ) -> Self {
        Self {
            router,
            discovery,
            federation,
            sessions: Sessions::default(),
            connections: Connections::default(),
            dial_tx,
        }
    }

    /// Tears the bus-to-bus link dialed for `spec` down, if one is still
    /// up. Closing the link's queue drives it through the same ordered
    /// shutdown `run`'s select loop already performs when a peer hangs
    /// up on its own, so there's no separate teardown path to keep in
    /// sync.
    fn hang_up(&self, spec: &str) {
        let Some(remote_guid) = self.federation.guid_for_spec(spec) else {
            warn!("disconnect for {} has no recorded bus-to-bus link", spec);
            return;
        };
        let Some(endpoint) = self.federation.bus2bus_endpoint(&remote_guid) else {
            return;
        };
        endpoint.close();
    }
}

/// Normalizes a connect spec the way `zbus::Address` does, so
/// `Connect("tcp:host=10.0.0.2,port=9955")` and a later `Disconnect`
/// call for the same address (possibly spelled slightly differently)
/// agree on the same map key.
fn normalize_spec(address: &str) -> Result<String> {
    Address::from_str(address)
        .map(|parsed| parsed.to_string())
        .map_err(|e| Error::InvalidArgs(format!("invalid connect spec `{address}`: {e}")))
}

#[interface(interface = "org.meshbus.Bus", introspection_docs = false)]
impl ControlPlane {
    /// Asks the bus to establish a bus-to-bus link to `address` (a
    /// `zbus`-style connection string, e.g. `tcp:host=10.0.0.2,port=9955`).
    ///
    /// Ref-counted per §4.4's Connect record: only the first caller to
    /// request a given spec actually triggers a dial, so N local peers
    /// all connecting to the same remote share one bus-to-bus link.
    async fn connect(
        &self,
        address: String,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
    ) -> Result<()> {
        let caller = msg_sender(&hdr);
        let spec = normalize_spec(&address)?;

        let first_reference = {
            let mut refs = self.connections.refs.write();
            let requesters = refs.entry(spec.clone()).or_default();
            let first = requesters.is_empty();
            requesters.insert(caller);
            first
        };

        if first_reference {
            self.dial_tx
                .send(spec)
                .map_err(|e| Error::Failed(format!("bus is shutting down: {e}")))?;
        }

        Ok(())
    }

    /// Drops `address` from the caller's connect records, tearing the
    /// underlying bus-to-bus link down once nobody else still wants it
    /// (§4.4's Disconnect, the mirror image of `connect`'s ref count).
    async fn disconnect(
        &self,
        address: String,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
    ) -> Result<()> {
        let caller = msg_sender(&hdr);
        let spec = normalize_spec(&address)?;

        let last_reference = {
            let mut refs = self.connections.refs.write();
            let Some(requesters) = refs.get_mut(&spec) else {
                return Err(Error::Failed(format!("not connected to {spec}")));
            };
            if !requesters.remove(&caller) {
                return Err(Error::Failed(format!(
                    "{caller} has no outstanding connect to {spec}"
                )));
            }
            let last = requesters.is_empty();
            if last {
                refs.remove(&spec);
            }
            last
        };

        if last_reference {
            self.hang_up(&spec);
        }

        Ok(())
    }

    async fn advertise_name(
        &self,
        name: String,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
    ) -> Result<()> {
        let owner = msg_sender(&hdr);
        for (watcher, event) in self.discovery.advertise(name, owner) {
            emit_to(&self.router, &watcher, event).await;
        }

        Ok(())
    }

    async fn cancel_advertise_name(
        &self,
        name: String,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
    ) -> Result<()> {
        let owner = msg_sender(&hdr);
        for (watcher, event) in self.discovery.cancel_advertise(&name, &owner) {
            emit_to(&self.router, &watcher, event).await;
        }

        Ok(())
    }

    async fn find_advertised_name(
        &self,
        prefix: String,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
        #[zbus(signal_emitter)] ctxt: SignalEmitter<'_>,
    ) -> Result<()> {
        let watcher = msg_sender(&hdr);
        let already = self.discovery.find(prefix.clone(), watcher);
        for (name, owner) in already {
            emit(&ctxt, NameMapEvent::Found { name, owner }).await?;
        }

        Ok(())
    }

    async fn cancel_find_advertised_name(
        &self,
        prefix: String,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
    ) -> Result<()> {
        let watcher = msg_sender(&hdr);
        self.discovery.cancel_find(&prefix, &watcher);

        Ok(())
    }

    async fn list_advertised_names(&self) -> Result<Vec<String>> {
        Ok(self.discovery.advertised_names())
    }

    /// Reserves `port` for the caller as a session-host port. Unlike
    /// the original, there's no session-options negotiation: any
    /// member who later joins is simply added to the session's
    /// multicast group.
    async fn bind_session_port(
        &self,
        port: u16,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
    ) -> Result<u16> {
        let owner = msg_sender(&hdr);
        self.sessions.bound_ports.write().insert((owner, port), ());

        Ok(port)
    }

    /// Joins the session hosted by `session_host` on `port`, returning
    /// the freshly allocated session id. Both sides are registered as
    /// each other's session-cast destination immediately.
    async fn join_session(
        &self,
        session_host: WellKnownName<'_>,
        port: u16,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
    ) -> Result<u32> {
        let joiner = msg_sender(&hdr);
        let host = self
            .router
            .name_registry()
            .lookup(session_host.clone())
            .ok_or_else(|| Error::NameHasNoOwner(format!("no such session host: {session_host}")))?;

        if !self.sessions.bound_ports.read().contains_key(&(host.clone(), port)) {
            return Err(Error::Failed(format!(
                "{session_host} has not bound session port {port}"
            )));
        }

        let session_id: SessionId = self.sessions.next_id.fetch_add(1, Ordering::Relaxed);
        self.router
            .session_cast()
            .add_session_members(session_id, &[host, joiner]);

        Ok(session_id)
    }

    async fn leave_session(
        &self,
        session_id: u32,
        #[zbus(header)] hdr: zbus::message::Header<'_>,
    ) -> Result<()> {
        let owner = msg_sender(&hdr);
        let _ = session_id;
        self.router.session_cast().remove_endpoint(owner.as_ref());

        Ok(())
    }

    async fn get_session_fd(&self, _session_id: u32) -> Result<zbus::zvariant::OwnedFd> {
        Err(Error::NotSupported(
            "raw-socket session upgrade is not supported".to_string(),
        ))
    }

    async fn set_link_timeout(&self, _session_id: u32, timeout: u32) -> Result<u32> {
        Ok(timeout)
    }

    #[zbus(signal)]
    pub async fn found_advertised_name(
        ctxt: &SignalEmitter<'_>,
        name: &str,
        owner: &OwnedUniqueName,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn lost_advertised_name(
        ctxt: &SignalEmitter<'_>,
        name: &str,
        owner: &OwnedUniqueName,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn session_lost(ctxt: &SignalEmitter<'_>, session_id: u32) -> zbus::Result<()>;
}

/// Emits a `FoundAdvertisedName`/`LostAdvertisedName` signal over
/// `ctxt` directly, for the `FindAdvertisedName` reply path where the
/// caller and the watcher are the same connection.
async fn emit(ctxt: &SignalEmitter<'_>, event: NameMapEvent) -> zbus::Result<()> {
    match event {
        NameMapEvent::Found { name, owner } => {
            ControlPlane::found_advertised_name(ctxt, &name, &owner).await
        }
        NameMapEvent::Lost { name, owner } => {
            ControlPlane::lost_advertised_name(ctxt, &name, &owner).await
        }
    }
}

/// Emits a `FoundAdvertisedName`/`LostAdvertisedName` signal to
/// `watcher`'s own connection, not the caller's: each local peer has
/// its own private connection (see [`Router::broadcast_name_change`]),
/// so a signal meant for a watcher other than whoever placed the
/// `AdvertiseName`/`CancelAdvertiseName` call has to be built against
/// that watcher's `SignalEmitter` specifically.
pub(crate) async fn emit_to(router: &Router, watcher: &OwnedUniqueName, event: NameMapEvent) {
    let Some(Endpoint::Local(peer)) = router.endpoint(watcher.as_ref()) else {
        return;
    };
    let ctxt = match SignalEmitter::new(peer.conn(), PATH) {
        Ok(ctxt) => ctxt,
        Err(e) => {
            warn!("failed to build signal emitter for {}: {}", watcher, e);
            return;
        }
    };

    let result = match event {
        NameMapEvent::Found { name, owner } => {
            ControlPlane::found_advertised_name(&ctxt, &name, &owner).await
        }
        NameMapEvent::Lost { name, owner } => {
            ControlPlane::lost_advertised_name(&ctxt, &name, &owner).await
        }
    };
    if let Err(e) = result {
        warn!("failed to notify {} of advertised-name change: {}", watcher, e);
    }
}

fn msg_sender(hdr: &zbus::message::Header<'_>) -> OwnedUniqueName {
    hdr.sender()
        .expect("missing `sender` header")
        .to_owned()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    fn unique(s: &str) -> OwnedUniqueName {
        OwnedUniqueName::try_from(s).unwrap()
    }

    #[test]
    fn connect_ref_count_dials_only_on_first_reference() {
        // §4.4 Connect record: a second requester for the same spec
        // shares the existing dial instead of triggering a new one.
        let connections = Connections::default();
        let spec = "tcp:host=10.0.0.2,port=9955".to_string();

        let mut refs = connections.refs.write();
        let first = refs.entry(spec.clone()).or_default();
        assert!(first.is_empty());
        first.insert(unique(":1.1"));
        drop(refs);

        let mut refs = connections.refs.write();
        let requesters = refs.entry(spec).or_default();
        let second_is_first_reference = requesters.is_empty();
        requesters.insert(unique(":1.2"));

        assert!(!second_is_first_reference);
        assert_eq!(requesters.len(), 2);
    }

    #[test]
    fn disconnect_hangs_up_only_once_every_requester_left() {
        let connections = Connections::default();
        let spec = "tcp:host=10.0.0.2,port=9955".to_string();

        connections
            .refs
            .write()
            .entry(spec.clone())
            .or_default()
            .extend([unique(":1.1"), unique(":1.2")]);

        let mut refs = connections.refs.write();
        let requesters = refs.get_mut(&spec).unwrap();
        requesters.remove(&unique(":1.1"));
        assert!(!requesters.is_empty(), "one requester still outstanding");

        requesters.remove(&unique(":1.2"));
        assert!(requesters.is_empty(), "last reference should hang up");
    }
}
