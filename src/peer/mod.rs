mod monitor;
mod stream;

pub use monitor::Monitor;
pub use stream::Stream;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;
use zbus::{connection, names::OwnedUniqueName, AuthMechanism, Connection, Guid, Message, Socket};

use crate::{
    control::ControlPlane,
    discovery::DiscoveryMap,
    federation::FederationTable,
    fdo::{DBus, Monitoring},
    remote::handshake::{Acceptor, BusHelloWatch},
    router::Router,
};

/// A directly-connected local client, speaking plain D-Bus over a socket
/// the daemon accepted itself (as opposed to a [`crate::remote::Endpoint`],
/// whose peer is another daemon).
///
/// Every freshly accepted connection looks like this at first, whether
/// it turns out to be an application or another daemon: the bus always
/// serves both the ordinary `org.freedesktop.DBus` `Hello` and the
/// federation `BusHello` on it, and `bus_hello_watch` lets the accept
/// loop tell which one the peer actually called (§4.6).
#[derive(Clone, Debug)]
pub struct Peer {
    conn: Connection,
    unique_name: OwnedUniqueName,
    uid: Option<u32>,
    gid: Option<u32>,
    allow_remote: bool,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        guid: Arc<Guid>,
        local_guid: String,
        unique_name: OwnedUniqueName,
        socket: Box<dyn Socket + 'static>,
        router: Router,
        discovery: Arc<DiscoveryMap>,
        federation: Arc<FederationTable>,
        dial_tx: UnboundedSender<String>,
        auth_mechanisms: &[AuthMechanism],
        allow_remote: bool,
    ) -> Result<(Self, BusHelloWatch)> {
        let acceptor = Acceptor::new(unique_name.clone(), local_guid, router.clone());
        let bus_hello_watch = acceptor.watch();

        let conn = connection::Builder::socket(socket)
            .server(&guid)?
            .p2p()
            .name("org.freedesktop.DBus")?
            .unique_name("org.freedesktop.DBus")?
            .auth_mechanisms(auth_mechanisms)
            .serve_at(
                DBus::PATH,
                DBus::new(unique_name.clone(), guid.clone(), router.clone()),
            )?
            .serve_at(Monitoring::PATH, Monitoring::new(router.clone()))?
            .serve_at(
                crate::control::PATH,
                ControlPlane::new(router, discovery, federation, dial_tx),
            )?
            .serve_at(crate::remote::handshake::PATH, acceptor)?
            .build()
            .await?;
        trace!("peer connection established: {:?}", conn);

        let credentials = conn.peer_credentials().await.ok();
        let uid = credentials.as_ref().and_then(|c| c.unix_user_id());
        let gid = credentials
            .as_ref()
            .and_then(|c| c.unix_group_ids())
            .and_then(|ids| ids.first().copied());

        Ok((
            Self {
                conn,
                unique_name,
                uid,
                gid,
                allow_remote,
            },
            bus_hello_watch,
        ))
    }

    pub fn unique_name(&self) -> &OwnedUniqueName {
        &self.unique_name
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn uid(&self) -> Option<u32> {
        self.uid
    }

    pub fn gid(&self) -> Option<u32> {
        self.gid
    }

    pub fn allow_remote(&self) -> bool {
        self.allow_remote
    }

    pub async fn push(&self, msg: Arc<Message>) -> Result<()> {
        self.conn.send(&msg).await.map_err(Into::into)
    }
}
