//! The bus-to-bus hello exchange that runs once a raw connection to
//! another daemon has completed SASL auth, capturing the remote's GUID
//! and protocol version before the link is handed to [`super::spawn`].
//!
//! This mirrors the ordinary client `Hello` call, except it carries
//! the extra fields two daemons need to agree on before gossiping
//! names: each side's bus GUID (for [`crate::names::is_local_guid`]
//! self-loop detection) and a protocol version, so a future wire
//! change can be introduced without breaking old peers outright.

use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use event_listener::Event;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use zbus::{
    interface,
    names::{OwnedUniqueName, OwnedWellKnownName},
    zvariant::{Optional, Type},
    Connection,
};

use crate::{federation::BusNameEntry, remote, router::Router};

pub const PATH: &str = "/org/meshbus/Federation";
pub const INTERFACE: &str = "org.meshbus.Federation";
pub const METHOD: &str = "BusHello";

/// The current bus-to-bus wire protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, Debug, Deserialize, Serialize, Type)]
pub struct BusHelloArgs {
    pub guid: String,
    pub protocol_version: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize, Type)]
pub struct BusHelloReply {
    pub unique_name: OwnedUniqueName,
    pub guid: String,
    pub protocol_version: u32,
}

/// Dialer side: call `BusHello` on a freshly authenticated connection
/// and return what the remote end told us about itself.
pub async fn dial(conn: &Connection, local_guid: &str) -> Result<BusHelloReply> {
    let reply = conn
        .call_method(
            None::<&str>,
            PATH,
            Some(INTERFACE),
            METHOD,
            &BusHelloArgs {
                guid: local_guid.to_string(),
                protocol_version: PROTOCOL_VERSION,
            },
        )
        .await
        .context("bus-to-bus `BusHello` call failed")?;

    reply
        .body()
        .deserialize()
        .context("malformed `BusHello` reply")
}

/// Acceptor side: served on every freshly authenticated connection right
/// alongside the ordinary `org.freedesktop.DBus` interface, so whichever
/// of `Hello`/`BusHello` the peer calls first tells the bus whether it
/// just accepted an application or another daemon (§4.6).
///
/// `unique_name` is the name already allocated for this connection (see
/// [`crate::peer::Peer::new`]): unlike the plain client `Hello`, there's
/// no separate allocation step here, just announcing it.
pub struct Acceptor {
    unique_name: OwnedUniqueName,
    local_guid: String,
    router: Router,
    received: Arc<Mutex<Option<BusHelloArgs>>>,
    notify: Arc<Event>,
    /// Set once the link is promoted to bus-to-bus, so a later
    /// `ExchangeNames`/`NameChanged` call on this same connection (the
    /// connection survives the promotion, see [`crate::remote::spawn`])
    /// knows which [`crate::federation::FederationTable`] entry it's
    /// updating.
    link: Mutex<Option<RemoteLink>>,
}

#[derive(Clone)]
struct RemoteLink {
    remote_guid: String,
    handle: Weak<remote::Endpoint>,
}

impl Acceptor {
    pub fn new(unique_name: OwnedUniqueName, local_guid: String, router: Router) -> Self {
        Self {
            unique_name,
            local_guid,
            router,
            received: Arc::new(Mutex::new(None)),
            notify: Arc::new(Event::new()),
            link: Mutex::new(None),
        }
    }

    /// A handle the connection-setup task can poll/wait on to find out
    /// whether this link turned out to be a bus-to-bus one.
    pub fn watch(&self) -> BusHelloWatch {
        BusHelloWatch {
            received: self.received.clone(),
            notify: self.notify.clone(),
        }
    }

    /// Called by the accept loop right after promoting this connection
    /// to a bus-to-bus link, so the gossip methods below know where to
    /// record what they're told.
    pub fn set_link(&mut self, remote_guid: String, handle: Weak<remote::Endpoint>) {
        *self.link.lock() = Some(RemoteLink { remote_guid, handle });
    }
}

#[interface(interface = "org.meshbus.Federation", introspection_docs = false)]
impl Acceptor {
    #[zbus(name = "BusHello")]
    async fn bus_hello(&self, guid: String, protocol_version: u32) -> BusHelloReply {
        *self.received.lock() = Some(BusHelloArgs {
            guid,
            protocol_version,
        });
        self.notify.notify(usize::MAX);

        BusHelloReply {
            unique_name: self.unique_name.clone(),
            guid: self.local_guid.clone(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// A remote daemon's dump of the unique names it hosts, sent once
    /// right after `BusHello` succeeds in both directions and again
    /// whenever its own name table changes in bulk.
    #[zbus(name = "ExchangeNames")]
    async fn exchange_names(&self, entries: Vec<BusNameEntry>) {
        let Some(link) = self.link.lock().clone() else {
            return;
        };
        let Some(federation) = self.router.federation() else {
            return;
        };

        federation
            .apply_exchange_names(
                &link.remote_guid,
                &link.handle,
                entries,
                &self.router,
                &self.local_guid,
            )
            .await;
    }

    /// One well-known name's ownership changed on a remote daemon.
    #[zbus(name = "NameChanged")]
    async fn name_changed(&self, name: OwnedWellKnownName, new_owner: Optional<OwnedUniqueName>) {
        let Some(link) = self.link.lock().clone() else {
            return;
        };
        let Some(federation) = self.router.federation() else {
            return;
        };

        let new_owner: Option<OwnedUniqueName> = new_owner.into();
        federation
            .apply_name_changed(&link.remote_guid, name, new_owner, &self.router)
            .await;
    }
}

/// Lets the connection-setup code learn, without blocking the interface
/// dispatch itself, whether `BusHello` has been called yet.
#[derive(Clone)]
pub struct BusHelloWatch {
    received: Arc<Mutex<Option<BusHelloArgs>>>,
    notify: Arc<Event>,
}

impl BusHelloWatch {
    /// Returns the peer's `BusHello` args as soon as they arrive.
    pub async fn wait(&self) -> BusHelloArgs {
        loop {
            let listener = self.notify.listen();
            if let Some(args) = self.received.lock().clone() {
                return args;
            }
            listener.await;
        }
    }

    pub fn received(&self) -> Option<BusHelloArgs> {
        self.received.lock().clone()
    }
}
