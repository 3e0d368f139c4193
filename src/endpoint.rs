//! The closed, small set of endpoint kinds a message can be routed to.
//!
//! The distilled spec's design notes call for a tagged variant with an
//! inherent `push` over a vtable, since the set of kinds is closed and
//! small — `Local`, `Bus2Bus`, and `Virtual` (there is no separate
//! `Remote` kind here: a non-federation remote client is just `Local`,
//! since from the router's point of view the only thing that matters is
//! whether the underlying link is another daemon).

use std::sync::Arc;

use anyhow::{anyhow, Result};
use zbus::names::OwnedUniqueName;

use crate::{federation::VirtualEndpoint, peer::Peer, remote};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Local,
    Bus2Bus,
    Virtual,
}

#[derive(Clone)]
pub enum Endpoint {
    Local(Arc<Peer>),
    Bus2Bus(Arc<remote::Endpoint>),
    Virtual(Arc<VirtualEndpoint>),
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Local(_) => EndpointKind::Local,
            Endpoint::Bus2Bus(_) => EndpointKind::Bus2Bus,
            Endpoint::Virtual(_) => EndpointKind::Virtual,
        }
    }

    pub fn unique_name(&self) -> &OwnedUniqueName {
        match self {
            Endpoint::Local(peer) => peer.unique_name(),
            Endpoint::Bus2Bus(ep) => ep.unique_name(),
            Endpoint::Virtual(ep) => ep.unique_name(),
        }
    }

    /// Whether this endpoint accepts messages that arrived from a
    /// bus-to-bus (i.e. remote-daemon) sender. Local endpoints opt in
    /// explicitly (the teacher daemon and the distilled spec both key
    /// this off an `allow_remote` flag); bus-to-bus and virtual
    /// endpoints always do, since remote delivery is their entire
    /// purpose.
    pub fn allow_remote(&self) -> bool {
        match self {
            Endpoint::Local(peer) => peer.allow_remote(),
            Endpoint::Bus2Bus(_) | Endpoint::Virtual(_) => true,
        }
    }

    pub fn uid(&self) -> Option<u32> {
        match self {
            Endpoint::Local(peer) => peer.uid(),
            Endpoint::Bus2Bus(_) | Endpoint::Virtual(_) => None,
        }
    }

    pub fn gid(&self) -> Option<u32> {
        match self {
            Endpoint::Local(peer) => peer.gid(),
            Endpoint::Bus2Bus(_) | Endpoint::Virtual(_) => None,
        }
    }

    /// Hands `msg` to this endpoint. For a `Virtual` endpoint this tries
    /// each bus-to-bus route in order and stops at the first success
    /// (§4.3).
    pub async fn push(&self, msg: Arc<zbus::Message>) -> Result<()> {
        match self {
            Endpoint::Local(peer) => peer.push(msg).await,
            Endpoint::Bus2Bus(ep) => ep.push(msg).await.map_err(Into::into),
            Endpoint::Virtual(ep) => ep.push(msg).await,
        }
    }
}

/// Error returned by a failed push; `EndpointClosing` is tolerated
/// silently by the router's fan-out loops (§4.1, §7).
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("endpoint is closing")]
    EndpointClosing,
    #[error("push timed out")]
    Timeout,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PushError {
    pub fn is_endpoint_closing(&self) -> bool {
        matches!(self, PushError::EndpointClosing)
    }
}

pub fn no_route_error() -> anyhow::Error {
    anyhow!("virtual endpoint has no remaining bus-to-bus route")
}
