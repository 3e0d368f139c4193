//! Process-level glue: the listening socket, the accept loop, and the
//! bus-to-bus dial-out path that [`crate::control::ControlPlane::connect`]
//! feeds into. Everything downstream of "a raw socket got accepted or
//! dialed" belongs to [`crate::router::Router`] and its satellite tables;
//! this module's only job is turning sockets into registered endpoints.

mod cookies;

use anyhow::{anyhow, Context, Result};
#[cfg(unix)]
use std::{
    env,
    path::{Path, PathBuf},
};
use std::{str::FromStr, sync::Arc};

use futures_util::TryStreamExt;
use tokio::{
    fs::remove_file,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, info, warn};
use zbus::{
    connection,
    names::{OwnedUniqueName, UniqueName},
    Address, AuthMechanism, Connection, Guid, Socket, TcpAddress,
};

use crate::{
    config::{Config, PipelineConfig},
    discovery::{self, DiscoveryMap},
    endpoint::Endpoint,
    federation::{self, FederationTable},
    name_registry::NameRegistry,
    names,
    peer::{Peer, Stream as PeerStream},
    remote::{
        self,
        handshake::{self, Acceptor},
    },
    router::Router,
    session::SessionCastMap,
};

/// The bus: owns the listening socket and every table a freshly accepted
/// or dialed connection needs wired in.
pub struct Bus {
    router: Router,
    federation: Arc<FederationTable>,
    discovery: Arc<DiscoveryMap>,
    listener: Listener,
    guid: Arc<Guid>,
    local_guid: String,
    auth_mechanisms: Vec<AuthMechanism>,
    pipeline: PipelineConfig,
    dial_tx: UnboundedSender<String>,
    dial_rx: UnboundedReceiver<String>,
    address: String,
}

enum Listener {
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        socket_path: PathBuf,
    },
    Tcp {
        listener: tokio::net::TcpListener,
    },
}

impl Bus {
    /// Builds a bus listening on `config.listen`, or the platform default
    /// if unset.
    pub async fn new(config: Config) -> Result<Self> {
        let address = config.listen.clone().unwrap_or_else(default_address);
        Self::for_address(&address, config).await
    }

    /// Builds a bus listening on `address`, overriding anything
    /// `config.listen` says (the CLI's `--address` flag takes precedence
    /// over the config file, and tests want to pick an address without
    /// round-tripping it through a `Config`).
    pub async fn for_address(address: &str, config: Config) -> Result<Self> {
        let parsed = Address::from_str(address)?;
        let listener = match &parsed {
            #[cfg(unix)]
            Address::Unix(path) => {
                let path = Path::new(path).to_path_buf();
                info!("listening on {}", path.display());
                Listener::Unix {
                    listener: tokio::net::UnixListener::bind(&path)?,
                    socket_path: path,
                }
            }
            #[cfg(not(unix))]
            Address::Unix(_) => {
                return Err(anyhow!("`unix` transport on non-UNIX OS is not supported"))
            }
            Address::Tcp(tcp) => {
                info!("listening on `{}:{}`", tcp.host(), tcp.port());
                Listener::Tcp {
                    listener: tokio::net::TcpListener::bind((tcp.host(), tcp.port())).await?,
                }
            }
            Address::NonceTcp { .. } => {
                return Err(anyhow!("`nonce-tcp` transport is not supported (yet)"))
            }
            Address::Autolaunch(_) => {
                return Err(anyhow!("`autolaunch` transport is not supported (yet)"))
            }
            _ => return Err(anyhow!("unsupported address `{}`", parsed)),
        };

        let guid = Arc::new(Guid::generate());
        let local_guid = names::daemon_short_guid(&guid);

        let name_registry = NameRegistry::new(local_guid.clone());
        let router = Router::new(name_registry, SessionCastMap::new(), config.policy.clone());
        let federation = Arc::new(FederationTable::new());
        router.set_federation(federation.clone());

        let ttl_floor = std::time::Duration::from_millis(config.observed_name_ttl_floor_ms);
        let discovery = Arc::new(DiscoveryMap::new(discovery::DEFAULT_ADVERTISE_TTL.max(ttl_floor)));
        spawn_reaper(discovery.clone(), router.clone());

        let (dial_tx, dial_rx) = mpsc::unbounded_channel();

        Ok(Self {
            router,
            federation,
            discovery,
            listener,
            guid,
            local_guid,
            auth_mechanisms: config.auth.to_vec(),
            pipeline: config.pipeline,
            dial_tx,
            dial_rx,
            address: address.to_string(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn guid(&self) -> &Arc<Guid> {
        &self.guid
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Runs the accept loop and the bus-to-bus dial-out loop until one of
    /// them errors out. Each accepted or dialed connection is handled on
    /// its own task; a single connection failing never brings the bus
    /// down.
    pub async fn run(&mut self) -> Result<()> {
        let router = self.router.clone();
        let federation = self.federation.clone();
        let discovery = self.discovery.clone();
        let guid = self.guid.clone();
        let local_guid = self.local_guid.clone();
        let auth_mechanisms = self.auth_mechanisms.clone();
        let pipeline = self.pipeline;
        let dial_tx = self.dial_tx.clone();

        loop {
            tokio::select! {
                biased;

                dialed = self.dial_rx.recv() => {
                    let Some(address) = dialed else {
                        unreachable!("`Bus` holds its own `dial_tx`, so this channel never closes");
                    };
                    tokio::spawn(dial(
                        address,
                        local_guid.clone(),
                        router.clone(),
                        federation.clone(),
                        pipeline,
                    ));
                }

                accepted = accept(&mut self.listener) => {
                    match accepted {
                        Ok(socket) => {
                            tokio::spawn(accept_connection(
                                socket,
                                guid.clone(),
                                local_guid.clone(),
                                router.clone(),
                                federation.clone(),
                                discovery.clone(),
                                dial_tx.clone(),
                                auth_mechanisms.clone(),
                                pipeline,
                            ));
                        }
                        Err(e) => warn!("failed to accept connection: {}", e),
                    }
                }
            }
        }
    }

    // AsyncDrop would have been nice!
    pub async fn cleanup(self) -> Result<()> {
        match self.listener {
            #[cfg(unix)]
            Listener::Unix { socket_path, .. } => {
                remove_file(socket_path).await.map_err(Into::into)
            }
            Listener::Tcp { .. } => Ok(()),
        }
    }
}

async fn accept(listener: &mut Listener) -> Result<Box<dyn Socket + 'static>> {
    match listener {
        #[cfg(unix)]
        Listener::Unix {
            listener,
            socket_path: _,
        } => {
            let (stream, addr) = listener.accept().await?;
            debug!("accepted connection from {:?}", addr);
            Ok(Box::new(stream))
        }
        Listener::Tcp { listener } => {
            let (stream, addr) = listener.accept().await?;
            debug!("accepted connection from {:?}", addr);
            Ok(Box::new(stream))
        }
    }
}

fn spawn_reaper(discovery: Arc<DiscoveryMap>, router: Router) {
    tokio::spawn(discovery::run_reaper(discovery, move |watcher, event| {
        let router = router.clone();
        tokio::spawn(async move {
            crate::control::emit_to(&router, &watcher, event).await;
        });
    }));
}

/// Handles one freshly accepted socket end to end: builds the per-peer
/// connection, registers it as an ordinary local endpoint, then races
/// ordinary client traffic against a `BusHello` call to find out whether
/// it's an application or another daemon (§4.6). Promotion, if it
/// happens, hands the connection off to [`crate::remote::spawn`] and
/// leaves this task to die quietly.
#[allow(clippy::too_many_arguments)]
async fn accept_connection(
    socket: Box<dyn Socket + 'static>,
    guid: Arc<Guid>,
    local_guid: String,
    router: Router,
    federation: Arc<FederationTable>,
    discovery: Arc<DiscoveryMap>,
    dial_tx: UnboundedSender<String>,
    auth_mechanisms: Vec<AuthMechanism>,
    pipeline: PipelineConfig,
) {
    if auth_mechanisms.contains(&AuthMechanism::Cookie) {
        if let Err(e) = cookies::sync().await {
            warn!("failed to sync SASL cookies, rejecting connection: {}", e);
            return;
        }
    }

    let (unique_name, allocated) = router.name_registry().allocate_unique_name();

    let (peer, bus_hello_watch) = match Peer::new(
        guid,
        local_guid.clone(),
        unique_name.clone(),
        socket,
        router.clone(),
        discovery,
        federation.clone(),
        dial_tx,
        &auth_mechanisms,
        true,
    )
    .await
    {
        Ok(built) => built,
        Err(e) => {
            warn!("failed to establish peer connection: {}", e);
            return;
        }
    };
    let peer = Arc::new(peer);
    let conn = peer.conn().clone();
    router.register_endpoint(Endpoint::Local(peer.clone()));
    router.broadcast_name_change(allocated).await;

    let sender = Endpoint::Local(peer.clone());
    let mut stream = PeerStream::for_peer(&peer, router.clone());
    let hello_wait = bus_hello_watch.wait();
    tokio::pin!(hello_wait);

    let bus_hello = loop {
        tokio::select! {
            biased;

            args = &mut hello_wait => break Some(args),

            next = stream.try_next() => {
                match next {
                    Ok(Some(msg)) => {
                        if let Err(e) = router.push(&sender, msg).await {
                            warn!("routing message from {} failed: {}", unique_name, e);
                        }
                    }
                    Ok(None) => break None,
                    Err(e) => {
                        warn!("peer {} stream errored: {}", unique_name, e);
                        break None;
                    }
                }
            }
        }
    };

    let Some(args) = bus_hello else {
        teardown_local(&router, &unique_name).await;
        return;
    };

    if args.guid == local_guid {
        warn!("rejecting bus-to-bus link that claims our own GUID");
        teardown_local(&router, &unique_name).await;
        return;
    }

    // Promotion: drop the local-endpoint registration (and broadcast
    // whatever that releases) before handing the same unique name to
    // `remote::spawn` as the bus-to-bus link's identity.
    for change in router.unregister_endpoint(unique_name.as_ref()) {
        router.broadcast_name_change(change).await;
    }

    let remote_guid = args.guid;
    let (endpoint, _task) = remote::spawn(
        conn.clone(),
        unique_name,
        remote_guid.clone(),
        router.clone(),
        pipeline,
    );
    federation.add_bus2bus_endpoint(remote_guid.clone(), endpoint.clone());

    if let Err(e) = set_acceptor_link(&conn, remote_guid.clone(), Arc::downgrade(&endpoint)).await {
        warn!("failed to wire bus-to-bus link for {}: {}", remote_guid, e);
    }

    let payload = federation::exchange_names_payload(&router);
    if let Err(e) = federation::send_exchange_names(&conn, payload).await {
        warn!("failed to exchange names with {}: {}", remote_guid, e);
    }
}

/// Actively establishes a bus-to-bus link to `address`, on a request
/// relayed from [`crate::control::ControlPlane::connect`]. Unlike the
/// accept side there's no race: a dial is always a bus-to-bus link by
/// construction, so this goes straight to `BusHello` and promotion.
async fn dial(
    address: String,
    local_guid: String,
    router: Router,
    federation: Arc<FederationTable>,
    pipeline: PipelineConfig,
) {
    if let Err(e) = dial_inner(&address, local_guid, router, federation, pipeline).await {
        warn!("failed to establish bus-to-bus link to {}: {}", address, e);
    }
}

async fn dial_inner(
    address: &str,
    local_guid: String,
    router: Router,
    federation: Arc<FederationTable>,
    pipeline: PipelineConfig,
) -> Result<()> {
    // This placeholder is only ever read back if the remote calls
    // `BusHello` on us, which never happens on the dial side: we're the
    // one who calls it, below. It exists purely so `Acceptor` can be
    // constructed with the same shape the accept side uses.
    let placeholder = OwnedUniqueName::try_from(format!(":{local_guid}.federation"))
        .context("building placeholder unique name for outbound bus-to-bus link")?;
    let acceptor = Acceptor::new(placeholder, local_guid.clone(), router.clone());

    let conn = connection::Builder::address(address)
        .context("invalid bus-to-bus dial address")?
        .p2p()
        .auth_mechanisms(&[AuthMechanism::External, AuthMechanism::Anonymous])
        .serve_at(handshake::PATH, acceptor)?
        .build()
        .await
        .context("failed to connect to remote bus")?;

    let reply = handshake::dial(&conn, &local_guid).await?;
    if reply.guid == local_guid {
        return Err(anyhow!("refusing to link to our own daemon"));
    }
    if federation.bus2bus_endpoint(&reply.guid).is_some() {
        debug!("already linked to {}, skipping duplicate dial", reply.guid);
        federation.record_dial(address.to_string(), reply.guid);
        return Ok(());
    }

    let remote_guid = reply.guid;
    let (endpoint, _task) = remote::spawn(
        conn.clone(),
        reply.unique_name,
        remote_guid.clone(),
        router.clone(),
        pipeline,
    );
    federation.add_bus2bus_endpoint(remote_guid.clone(), endpoint.clone());
    federation.record_dial(address.to_string(), remote_guid.clone());

    set_acceptor_link(&conn, remote_guid.clone(), Arc::downgrade(&endpoint)).await?;

    let payload = federation::exchange_names_payload(&router);
    federation::send_exchange_names(&conn, payload).await?;

    Ok(())
}

async fn teardown_local(router: &Router, unique_name: &OwnedUniqueName) {
    let name: &UniqueName<'_> = unique_name.as_ref();
    for change in router.unregister_endpoint(name) {
        router.broadcast_name_change(change).await;
    }
}

/// Tells the `Acceptor` already served on `conn` which federation link it
/// now belongs to, so its `ExchangeNames`/`NameChanged` handlers know
/// where to apply gossip. `Acceptor::set_link` takes `&mut self`, so this
/// goes through zbus's live-interface-mutation API rather than a plain
/// method call.
async fn set_acceptor_link(
    conn: &Connection,
    remote_guid: String,
    handle: std::sync::Weak<remote::Endpoint>,
) -> zbus::Result<()> {
    let iface_ref = conn
        .object_server()
        .interface::<_, Acceptor>(handshake::PATH)
        .await?;
    iface_ref.get_mut().await.set_link(remote_guid, handle);
    Ok(())
}

#[cfg(unix)]
fn default_address() -> String {
    let runtime_dir = env::var("XDG_RUNTIME_DIR")
        .as_ref()
        .map(|s| Path::new(s).to_path_buf())
        .ok()
        .unwrap_or_else(|| {
            Path::new("/run")
                .join("user")
                .join(format!("{}", nix::unistd::Uid::current()))
        });
    let path = runtime_dir.join("meshbus-session");

    format!("unix:path={}", path.display())
}

#[cfg(not(unix))]
fn default_address() -> String {
    "tcp:host=127.0.0.1,port=4242".to_string()
}
