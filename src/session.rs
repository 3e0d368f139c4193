//! Session multicast bookkeeping (§3 "session-cast entry", §4.1.5).
//!
//! A session is a small multiplexing id scoping broadcast delivery to a
//! subset of endpoints; the full session-establishment handshake
//! (`BindSessionPort`/`JoinSession`) lives in [`crate::control`], which is
//! the only thing that mutates a [`SessionCastMap`]. The router only ever
//! reads it.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use zbus::names::{OwnedUniqueName, UniqueName};

pub type SessionId = u32;

#[derive(Clone, Debug, Default)]
pub struct SessionCastMap {
    // (session id, sender's unique name) -> destination endpoints.
    inner: std::sync::Arc<RwLock<HashMap<(SessionId, OwnedUniqueName), HashSet<OwnedUniqueName>>>>,
}

impl SessionCastMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `destination` as a recipient of broadcasts sent by `sender`
    /// within `session`. A no-op if already present.
    pub fn add(&self, session: SessionId, sender: OwnedUniqueName, destination: OwnedUniqueName) {
        self.inner
            .write()
            .entry((session, sender))
            .or_default()
            .insert(destination);
    }

    /// Adds every member of a session as each other's session-cast
    /// destination (self excluded), used once a session's membership is
    /// known after a successful join.
    pub fn add_session_members(&self, session: SessionId, members: &[OwnedUniqueName]) {
        for sender in members {
            for destination in members {
                if sender != destination {
                    self.add(session, sender.clone(), destination.clone());
                }
            }
        }
    }

    pub fn destinations(&self, session: SessionId, sender: &UniqueName<'_>) -> Vec<OwnedUniqueName> {
        self.inner
            .read()
            .get(&(session, sender.to_owned().into()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every destination registered across *any* session `sender` is a
    /// member of.
    ///
    /// Plain D-Bus messages carry no per-message session id (that's an
    /// AllJoyn transport-header extension this crate doesn't reimplement,
    /// see the session module's Non-goals), so the router can't pick out
    /// which one session a given message belongs to the way the original
    /// daemon's `GetSessionId()` does. Keying this off the sender alone
    /// instead still gets every session peer a copy of that sender's
    /// broadcasts, which is what the multicast is for.
    pub fn destinations_for_sender(&self, sender: &UniqueName<'_>) -> Vec<OwnedUniqueName> {
        let sender = sender.to_owned().into();
        self.inner
            .read()
            .iter()
            .filter(|((_, s), _)| *s == sender)
            .flat_map(|(_, destinations)| destinations.iter().cloned())
            .collect()
    }

    /// Removes every entry mentioning `endpoint`, either as sender or
    /// destination, e.g. when it leaves a session or disconnects.
    pub fn remove_endpoint(&self, endpoint: &UniqueName<'_>) {
        let mut inner = self.inner.write();
        inner.retain(|(_, sender), _| sender != endpoint);
        for destinations in inner.values_mut() {
            destinations.remove(endpoint.as_str());
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
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
    fn session_member_count_minus_one_invariant() {
        let map = SessionCastMap::new();
        let members = vec![unique(":g.1"), unique(":g.2"), unique(":g.3")];
        map.add_session_members(1, &members);

        // size == sum over sessions of member count minus one (self excluded).
        assert_eq!(map.len(), members.len() * (members.len() - 1));
    }

    #[test]
    fn remove_endpoint_drops_both_roles() {
        let map = SessionCastMap::new();
        let members = vec![unique(":g.1"), unique(":g.2")];
        map.add_session_members(1, &members);

        map.remove_endpoint(&members[0].as_ref());
        assert!(map.is_empty());
    }

    #[test]
    fn destinations_for_sender_spans_every_session_joined() {
        let map = SessionCastMap::new();
        let a = unique(":g.1");
        let b = unique(":g.2");
        let c = unique(":g.3");
        map.add_session_members(1, &[a.clone(), b.clone()]);
        map.add_session_members(2, &[a.clone(), c.clone()]);

        let mut dests = map.destinations_for_sender(&a.as_ref());
        dests.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(dests, expected);
    }
}
