//! A narrow, declarative policy predicate.
//!
//! This is intentionally *not* the full `dbus-daemon` XML policy grammar
//! (parsing that format is out of scope). It models exactly the
//! `(message, sender_uid, sender_gid, receiver_uid?, receiver_gid?) ->
//! bool` predicate the router consults on every directed and
//! eavesdropped delivery, parsed once from `Config` into an immutable
//! table.

use serde::Deserialize;

/// One rule in the policy table.
///
/// A rule matches a message if every `Some` field matches, and `None`
/// fields are wildcards. The first matching rule in declaration order
/// decides the message's fate; if no rule matches, the default decision
/// is [`Decision::Allow`], mirroring `dbus-daemon`'s permissive default.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Rule {
    pub decision: Decision,
    /// Restrict this rule to a sending user id.
    pub uid: Option<u32>,
    /// Restrict this rule to a sending group id.
    pub gid: Option<u32>,
    /// Restrict this rule to messages destined for this well-known name.
    pub destination: Option<String>,
    /// Restrict this rule to messages on this interface.
    pub interface: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Allow,
    Deny,
}

/// A fact sheet about one side of a delivery, handed to the policy table.
#[derive(Clone, Copy, Debug, Default)]
pub struct Subject {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// An immutable, parsed policy table.
///
/// `#[serde(transparent)]` so `Config`'s `policy` field is a plain TOML
/// array of rules (`policy = [ { decision = "deny", ... } ]`) rather than
/// a nested `{ rules = [...] }` table, matching how the distilled spec
/// describes it (§3: "a list of policy rules").
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Policy {
    rules: Vec<Rule>,
}

impl Policy {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Evaluates the policy for a send from `subject` to an optional
    /// `destination` well-known name, on an optional `interface`.
    ///
    /// Returns `true` if the delivery is allowed.
    pub fn is_allowed(
        &self,
        subject: &Subject,
        destination: Option<&str>,
        interface: Option<&str>,
    ) -> bool {
        for rule in &self.rules {
            if let Some(uid) = rule.uid {
                if subject.uid != Some(uid) {
                    continue;
                }
            }
            if let Some(gid) = rule.gid {
                if subject.gid != Some(gid) {
                    continue;
                }
            }
            if let Some(dest) = &rule.destination {
                if destination != Some(dest.as_str()) {
                    continue;
                }
            }
            if let Some(iface) = &rule.interface {
                if interface != Some(iface.as_str()) {
                    continue;
                }
            }

            return rule.decision == Decision::Allow;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_everything() {
        let policy = Policy::default();
        assert!(policy.is_allowed(&Subject::default(), Some("com.example.Foo"), None));
    }

    #[test]
    fn uid_scoped_deny_rule() {
        let policy = Policy::new(vec![Rule {
            decision: Decision::Deny,
            uid: Some(1000),
            ..Default::default()
        }]);

        assert!(!policy.is_allowed(
            &Subject {
                uid: Some(1000),
                gid: None
            },
            None,
            None
        ));
        assert!(policy.is_allowed(
            &Subject {
                uid: Some(1001),
                gid: None
            },
            None,
            None
        ));
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = Policy::new(vec![
            Rule {
                decision: Decision::Allow,
                uid: Some(1000),
                ..Default::default()
            },
            Rule {
                decision: Decision::Deny,
                ..Default::default()
            },
        ]);

        assert!(policy.is_allowed(
            &Subject {
                uid: Some(1000),
                gid: None
            },
            None,
            None
        ));
        assert!(!policy.is_allowed(
            &Subject {
                uid: Some(2000),
                gid: None
            },
            None,
            None
        ));
    }
}
