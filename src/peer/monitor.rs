use std::future::Future;

use futures_util::StreamExt;
use tracing::warn;
use zbus::{
    names::{BusName, OwnedUniqueName},
    Connection, MessageStream,
};

use crate::{name_registry::NameRegistry, rules::MatchRules};

use super::Peer;

/// A peer that called `BecomeMonitor`.
///
/// Per the `org.freedesktop.DBus.Monitoring` contract, a monitor must not
/// send any further messages; [`Monitor::monitor`] watches for a
/// contract violation and reports it.
#[derive(Debug)]
pub struct Monitor {
    conn: Connection,
    unique_name: OwnedUniqueName,
    match_rules: MatchRules,
}

impl Monitor {
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn unique_name(&self) -> &OwnedUniqueName {
        &self.unique_name
    }

    /// Whether this monitor wants a copy of `msg`: an empty rule set
    /// means "everything", matching the reference daemon's behavior for
    /// `BecomeMonitor` called with no rules.
    pub fn interested(&self, msg: &zbus::Message, name_registry: &NameRegistry) -> bool {
        let hdr = msg.header();
        if self.match_rules.is_empty()
            || hdr.destination() == Some(&BusName::from(self.unique_name.clone()))
        {
            return true;
        }
        self.match_rules.matches(msg, name_registry)
    }

    pub fn monitor(&self) -> impl Future<Output = ()> + 'static {
        let mut stream = MessageStream::from(&self.conn);
        let unique_name = self.unique_name.clone();
        async move {
            if let Some(Ok(_)) = stream.next().await {
                warn!(
                    "monitor {} sent a message, which is against the rules",
                    unique_name
                );
            }
        }
    }

    pub(super) fn new(peer: Peer, match_rules: MatchRules) -> Self {
        Self {
            conn: peer.conn().clone(),
            unique_name: peer.unique_name().clone(),
            match_rules,
        }
    }
}
