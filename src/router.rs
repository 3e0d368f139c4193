//! The heart of the bus: decides, for every message handed to it, which
//! endpoints should receive a copy (§4.1).
//!
//! Delivery order, per message:
//!
//! 1. **Authorize** the sender against the configured [`Policy`].
//! 2. **Direct delivery** if the message carries an explicit
//!    `DESTINATION` (resolved through the [`NameRegistry`] when it's a
//!    well-known name).
//! 3. **Rule-match fan-out**: broadcast and directed signals with no
//!    single destination are offered to every endpoint whose
//!    [`RuleTable`] entry matches, except the sender.
//! 4. **Bus-to-bus fan-out**: a message that originated locally is also
//!    forwarded to every federated daemon, so their local rule-match
//!    step can run in turn. A message that *arrived* from a bus-to-bus
//!    endpoint is never forwarded to another one — that's the
//!    self-loop guard the distilled spec calls for at the router layer
//!    (federation's own GUID-based guard covers the gossip channel
//!    itself).
//! 5. **Session multicast**: every other member of any session the
//!    sender belongs to also gets a copy (sender-keyed, since plain
//!    D-Bus carries no per-message session id for us to scope this to
//!    one session in particular — see [`SessionCastMap`]).
//!
//! A failed push to one endpoint never aborts the others; failures are
//! logged and, for `EndpointClosing`, ignored outright (§7).

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, warn};
use zbus::{
    names::{BusName, OwnedUniqueName, UniqueName},
    Connection, Message, MessageBuilder, MessageFlags, MessageType,
};

use crate::{
    endpoint::{Endpoint, EndpointKind},
    fdo::dbus as fdo_dbus,
    name_registry::{NameOwnerChanged, NameRegistry},
    peer::Monitor,
    policy::{Policy, Subject},
    rules::{MatchRules, RuleTable},
    session::SessionCastMap,
};

#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

struct Inner {
    endpoints: RwLock<HashMap<OwnedUniqueName, Endpoint>>,
    name_registry: NameRegistry,
    rule_table: RwLock<RuleTable>,
    session_cast: SessionCastMap,
    policy: Policy,
    federation: RwLock<Option<Arc<crate::federation::FederationTable>>>,
    monitors: RwLock<Vec<Monitor>>,
}

impl Router {
    pub fn new(name_registry: NameRegistry, session_cast: SessionCastMap, policy: Policy) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoints: RwLock::new(HashMap::new()),
                name_registry,
                rule_table: RwLock::new(RuleTable::new()),
                session_cast,
                policy,
                federation: RwLock::new(None),
                monitors: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Wires the federation table in once it's built; `bus` constructs
    /// the [`Router`] and the table together and links them right
    /// after, so every other use of the router sees it already set.
    pub fn set_federation(&self, table: Arc<crate::federation::FederationTable>) {
        *self.inner.federation.write() = Some(table);
    }

    pub fn federation(&self) -> Option<Arc<crate::federation::FederationTable>> {
        self.inner.federation.read().clone()
    }

    pub fn name_registry(&self) -> &NameRegistry {
        &self.inner.name_registry
    }

    pub fn session_cast(&self) -> &SessionCastMap {
        &self.inner.session_cast
    }

    pub fn add_match_rule(&self, owner: UniqueName<'static>, rule: zbus::OwnedMatchRule) {
        self.inner.rule_table.write().add(owner, rule);
    }

    pub fn remove_match_rule(
        &self,
        owner: &UniqueName<'_>,
        rule: zbus::OwnedMatchRule,
    ) -> zbus::fdo::Result<()> {
        self.inner.rule_table.write().remove(owner, rule)
    }

    pub fn register_endpoint(&self, endpoint: Endpoint) {
        let name = endpoint.unique_name().clone();
        debug!("registering endpoint {}", name);
        self.inner.endpoints.write().insert(name, endpoint);
    }

    /// Drops `unique_name` from every table the router maintains and
    /// releases any well-known names and the unique name itself,
    /// returning the resulting ownership changes so the caller can emit
    /// `NameOwnerChanged`/`NameLost` on its behalf.
    pub fn unregister_endpoint(
        &self,
        unique_name: &UniqueName<'_>,
    ) -> Vec<crate::name_registry::NameOwnerChanged> {
        debug!("unregistering endpoint {}", unique_name);
        self.inner.endpoints.write().remove(unique_name);
        self.inner.rule_table.write().remove_owner(unique_name);
        self.inner.session_cast.remove_endpoint(unique_name);

        let mut changes = self.inner.name_registry.release_all(unique_name);
        changes.extend(self.inner.name_registry.remove_unique_name(unique_name));

        changes
    }

    pub fn endpoint(&self, unique_name: &UniqueName<'_>) -> Option<Endpoint> {
        self.inner.endpoints.read().get(unique_name).cloned()
    }

    /// Converts a registered local endpoint into a monitor: it stops
    /// being an addressable delivery target and instead gets a copy of
    /// every message matching `match_rules` (or everything, if empty),
    /// per `org.freedesktop.DBus.Monitoring`'s `BecomeMonitor` (§6).
    ///
    /// Unlike `BecomeMonitor`'s effect on well-known names, the
    /// monitor's own unique name is left owning whatever it already
    /// owned; only the reference daemon's quirk of also unregistering
    /// it entirely is intentionally not replicated here.
    pub fn become_monitor(&self, unique_name: &UniqueName<'_>, match_rules: MatchRules) -> Option<()> {
        let removed = self.inner.endpoints.write().remove(unique_name);
        let peer = match removed {
            Some(Endpoint::Local(peer)) => (*peer).clone(),
            Some(other) => {
                self.register_endpoint(other);
                return None;
            }
            None => return None,
        };
        self.inner.rule_table.write().remove_owner(unique_name);
        self.inner.session_cast.remove_endpoint(unique_name);

        let monitor = Monitor::new(peer, match_rules);
        self.inner.monitors.write().push(monitor);
        Some(())
    }

    fn monitors_interested(&self, msg: &Message) -> Vec<Connection> {
        self.inner
            .monitors
            .read()
            .iter()
            .filter(|m| m.interested(msg, &self.inner.name_registry))
            .map(|m| m.conn().clone())
            .collect()
    }

    /// Echoes `msg` to every interested monitor, independent of `push`.
    ///
    /// A local peer's own `Hello`/`RequestName`-style calls to
    /// `org.freedesktop.DBus` never reach `push` (the `ObjectServer`
    /// handles them directly), but a monitor still needs to see them —
    /// so the per-peer read loop taps every raw message here before
    /// filtering any of it out. `push` itself only tags along for
    /// messages that arrive from somewhere other than a local peer
    /// (bus-to-bus traffic), since those never pass through this tap.
    pub async fn tap_monitors(&self, msg: &Message) {
        for conn in self.monitors_interested(msg) {
            if let Err(e) = conn.send(msg).await {
                warn!("failed to push message to a monitor: {}", e);
            }
        }
    }

    /// Notifies every locally connected peer of a name ownership change
    /// and forwards well-known-name changes to every federated daemon.
    ///
    /// Each local peer has its own private connection, so there's no
    /// shared broadcast domain: `NameOwnerChanged` is emitted once per
    /// peer over that peer's own connection, while `NameLost`/
    /// `NameAcquired` are only sent to the one peer whose unique name
    /// matches the change's old/new owner (§4.2, §4.3).
    pub async fn broadcast_name_change(&self, changed: NameOwnerChanged) {
        self.broadcast_name_change_excluding(changed, None).await;
    }

    /// Same as [`Self::broadcast_name_change`], except the federation
    /// fan-out skips `exclude_guid` — the daemon that just told us
    /// about this change via `ExchangeNames`/`NameChanged`, so the
    /// gossip doesn't bounce straight back to where it came from.
    pub async fn broadcast_name_change_excluding(
        &self,
        changed: NameOwnerChanged,
        exclude_guid: Option<&str>,
    ) {
        let locals: Vec<Arc<crate::peer::Peer>> = self
            .inner
            .endpoints
            .read()
            .values()
            .filter_map(|ep| match ep {
                Endpoint::Local(peer) => Some(peer.clone()),
                _ => None,
            })
            .collect();

        let name = fdo_dbus::changed_bus_name(&changed);
        for peer in &locals {
            let ctxt = match zbus::object_server::SignalEmitter::new(
                peer.conn(),
                crate::fdo::DBus::PATH,
            ) {
                Ok(ctxt) => ctxt,
                Err(e) => {
                    warn!("failed to build signal emitter for {}: {}", peer.unique_name(), e);
                    continue;
                }
            };

            fdo_dbus::emit_name_owner_changed(&ctxt, &changed).await;

            if changed.old_owner.as_ref() == Some(peer.unique_name()) {
                let ctxt = ctxt.clone().set_destination(peer.unique_name().clone().into());
                fdo_dbus::emit_name_lost(&ctxt, name.clone()).await;
            }
            if changed.new_owner.as_ref() == Some(peer.unique_name()) {
                let ctxt = ctxt.set_destination(peer.unique_name().clone().into());
                fdo_dbus::emit_name_acquired(&ctxt, name.clone()).await;
            }
        }

        self.forward_to_federation(&changed, exclude_guid).await;
    }

    async fn forward_to_federation(&self, changed: &NameOwnerChanged, exclude_guid: Option<&str>) {
        let crate::name_registry::NameChanged::WellKnown(ref well_known) = changed.name else {
            return;
        };
        let Some(federation) = self.inner.federation.read().clone() else {
            return;
        };

        for remote_guid in federation.known_remote_guids() {
            if exclude_guid == Some(remote_guid.as_str()) {
                continue;
            }
            let Some(endpoint) = federation.bus2bus_endpoint(&remote_guid) else {
                continue;
            };
            if let Err(e) = crate::federation::send_name_changed(
                endpoint.conn(),
                well_known.clone(),
                changed.new_owner.clone(),
            )
            .await
            {
                warn!("failed to gossip name change to {}: {}", remote_guid, e);
            }
        }
    }

    /// Routes `msg`, sent by `sender`, to every endpoint the algorithm
    /// above says should see it.
    pub async fn push(&self, sender: &Endpoint, msg: Arc<Message>) -> Result<()> {
        let hdr = msg.header();
        let sender_name = sender.unique_name().clone();

        let subject = Subject {
            uid: sender.uid(),
            gid: sender.gid(),
        };
        let destination = hdr.destination().map(|d| d.to_string());
        let interface = hdr.interface().map(|i| i.to_string());
        if !self
            .inner
            .policy
            .is_allowed(&subject, destination.as_deref(), interface.as_deref())
        {
            warn!("message from {} denied by policy", sender_name);
            return Ok(());
        }

        if let Some(dest_name) = hdr.destination() {
            let target = self.resolve(dest_name);
            if let Some(target) = target {
                let receiver_subject = Subject {
                    uid: target.uid(),
                    gid: target.gid(),
                };
                if !self.inner.policy.is_allowed(
                    &receiver_subject,
                    destination.as_deref(),
                    interface.as_deref(),
                ) {
                    warn!("message from {} to {} denied by policy", sender_name, target.unique_name());
                    return Ok(());
                }

                if sender.kind() == EndpointKind::Bus2Bus && !target.allow_remote() {
                    warn!(
                        "dropping bus-to-bus message from {} to {}, which doesn't accept remote messages",
                        sender_name,
                        target.unique_name()
                    );
                    return Ok(());
                }

                return self.push_to(&target, msg).await;
            }
            // Nobody owns `dest_name`: a waiting method call would hang
            // forever without this, so synthesize the reply ourselves.
            self.reply_service_unknown(sender, &msg, dest_name).await;
            return Ok(());
        }

        let interested = {
            let rule_table = self.inner.rule_table.read();
            rule_table.interested_endpoints(&msg, sender.unique_name().as_ref(), &self.inner.name_registry)
        };
        for name in interested {
            if let Some(endpoint) = self.endpoint(&name) {
                let receiver_subject = Subject {
                    uid: endpoint.uid(),
                    gid: endpoint.gid(),
                };
                if !self.inner.policy.is_allowed(
                    &receiver_subject,
                    destination.as_deref(),
                    interface.as_deref(),
                ) {
                    warn!(
                        "broadcast from {} to {} denied by policy",
                        sender_name,
                        endpoint.unique_name()
                    );
                    continue;
                }

                self.push_to(&endpoint, msg.clone()).await;
            }
        }

        if sender.kind() != EndpointKind::Bus2Bus && is_global_broadcast(&msg) {
            for endpoint in self.bus2bus_endpoints() {
                self.push_to(&endpoint, msg.clone()).await;
            }
        }

        for name in self
            .inner
            .session_cast
            .destinations_for_sender(sender_name.as_ref())
        {
            if let Some(endpoint) = self.endpoint(&name) {
                self.push_to(&endpoint, msg.clone()).await;
            }
        }

        if sender.kind() != EndpointKind::Local {
            self.tap_monitors(&msg).await;
        }

        Ok(())
    }

    fn resolve(&self, name: &BusName<'_>) -> Option<Endpoint> {
        match name {
            BusName::Unique(unique) => self.endpoint(unique),
            BusName::WellKnown(wk) => {
                let owner = self.inner.name_registry.lookup(wk.clone())?;
                self.endpoint(owner.as_ref())
            }
        }
    }

    fn bus2bus_endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .endpoints
            .read()
            .values()
            .filter(|ep| ep.kind() == EndpointKind::Bus2Bus)
            .cloned()
            .collect()
    }

    async fn push_to(&self, endpoint: &Endpoint, msg: Arc<Message>) {
        if let Err(e) = endpoint.push(msg).await {
            warn!("failed to push message to {}: {}", endpoint.unique_name(), e);
        }
    }

    /// Synthesizes and delivers a `ServiceUnknown` error reply to
    /// `sender` for a method call whose destination resolved to nobody.
    /// A call with `NO_REPLY_EXPECTED` set, or any other message type
    /// (a signal or reply with a stale destination), is simply dropped,
    /// same as before.
    async fn reply_service_unknown(&self, sender: &Endpoint, msg: &Message, dest: &BusName<'_>) {
        if msg.message_type() != MessageType::MethodCall {
            return;
        }
        let hdr = msg.header();
        if hdr.primary().flags().contains(MessageFlags::NoReplyExpected) {
            return;
        }

        let description = format!("The name {dest} was not provided by any .service files");
        let built = MessageBuilder::error(&hdr, "org.freedesktop.DBus.Error.ServiceUnknown")
            .and_then(|builder| builder.build(&description));
        let error_msg = match built {
            Ok(msg) => Arc::new(msg),
            Err(e) => {
                warn!("failed to build ServiceUnknown reply for {}: {}", dest, e);
                return;
            }
        };

        self.push_to(sender, error_msg).await;
    }
}

/// `ALLJOYN_FLAG_GLOBAL_BROADCAST`: a broadcast signal with no destination
/// only crosses bus-to-bus links when its sender asked for that explicitly.
/// Not one of [`MessageFlags`]'s own variants, so it's read as a raw bit.
const GLOBAL_BROADCAST_FLAG: u8 = 0x20;

fn is_global_broadcast(msg: &Message) -> bool {
    msg.message_type() == MessageType::Signal
        && msg.header().primary().flags().bits() & GLOBAL_BROADCAST_FLAG != 0
}
