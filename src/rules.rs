//! Per-endpoint match rules used for broadcast fan-out (the router's
//! rule-table step, §4.1.3).

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use zbus::{
    message::Header,
    names::{BusName, UniqueName},
    zvariant::Type,
    OwnedMatchRule,
};

use crate::name_registry::NameRegistry;

/// One endpoint's set of match rules.
#[derive(Debug, Default, Deserialize, Type)]
pub struct MatchRules(HashSet<OwnedMatchRule>);

impl MatchRules {
    pub fn add(&mut self, rule: OwnedMatchRule) {
        self.0.insert(rule);
    }

    /// Removes the first rule that matches; `Err` if none did.
    pub fn remove(&mut self, rule: OwnedMatchRule) -> zbus::fdo::Result<()> {
        if !self.0.remove(&rule) {
            return Err(zbus::fdo::Error::MatchRuleNotFound(
                "No such match rule".to_string(),
            ));
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether any rule in this set matches `msg`, resolving well-known
    /// sender/destination names against `name_registry` since
    /// `zbus::MatchRule::matches` only compares the literal header
    /// fields.
    ///
    /// # Panics
    ///
    /// If `msg`'s header is missing the SENDER or DESTINATION field it
    /// claims to have. The bus is responsible for ensuring every message
    /// it routes has a valid sender.
    pub fn matches(&self, msg: &zbus::Message, name_registry: &NameRegistry) -> bool {
        let hdr = msg.header();

        self.0.iter().any(|rule| match rule.matches(msg) {
            Ok(false) => false,
            Ok(true) => sender_and_destination_match(rule, &hdr, name_registry),
            Err(e) => {
                tracing::warn!("error matching rule: {}", e);

                false
            }
        })
    }
}

fn sender_and_destination_match(
    rule: &OwnedMatchRule,
    hdr: &Header<'_>,
    name_registry: &NameRegistry,
) -> bool {
    if let Some(BusName::WellKnown(name)) = rule.sender().cloned() {
        let Some(owner) = name_registry.lookup(name.as_ref()) else {
            return false;
        };
        let Some(sender) = hdr.sender() else {
            return false;
        };
        if *sender != UniqueName::from(owner.as_ref()) {
            return false;
        }
    }

    if let Some(destination) = rule.destination() {
        match hdr.destination() {
            Some(BusName::WellKnown(name)) => match name_registry.lookup(name.as_ref()) {
                Some(owner) if UniqueName::from(owner.as_ref()) == *destination => (),
                _ => return false,
            },
            // Unique destinations are already handled by `zbus`'s own match.
            _ => (),
        }
    }

    true
}

/// The router's view over every registered endpoint's match rules: which
/// endpoints, if any, asked to see a given broadcast message.
///
/// The distilled spec calls for "a per-endpoint helper... to skip
/// remaining rules belonging to an endpoint once one rule has fired" —
/// since `interested_endpoints` only needs to know *whether* an endpoint
/// matched, not *which* rule, iterating `MatchRules::matches` (which
/// already short-circuits on the first hit) gives this for free.
#[derive(Debug, Default)]
pub struct RuleTable {
    rules: HashMap<UniqueName<'static>, MatchRules>,
}

impl RuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, owner: UniqueName<'static>, rule: OwnedMatchRule) {
        self.rules.entry(owner).or_default().add(rule);
    }

    pub fn remove(&mut self, owner: &UniqueName<'_>, rule: OwnedMatchRule) -> zbus::fdo::Result<()> {
        match self.rules.get_mut(owner) {
            Some(rules) => rules.remove(rule),
            None => Err(zbus::fdo::Error::MatchRuleNotFound(
                "No such match rule".to_string(),
            )),
        }
    }

    /// Drops every rule owned by `owner` (endpoint unregistration).
    pub fn remove_owner(&mut self, owner: &UniqueName<'_>) {
        self.rules.remove(owner);
    }

    /// Every endpoint whose rules match `msg`, excluding `exclude` (the
    /// sender, which never receives its own broadcast back via rule
    /// match).
    pub fn interested_endpoints(
        &self,
        msg: &zbus::Message,
        exclude: &UniqueName<'_>,
        name_registry: &NameRegistry,
    ) -> Vec<UniqueName<'static>> {
        self.rules
            .iter()
            .filter(|(owner, _)| *owner != exclude)
            .filter(|(_, rules)| rules.matches(msg, name_registry))
            .map(|(owner, _)| owner.clone())
            .collect()
    }
}
