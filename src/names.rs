//! Helpers around the unique-name grammar: `:<short-guid>.<N>`.

use zbus::names::UniqueName;

/// Extracts the short-GUID segment (the first dotted label after the
/// leading `:`) from a unique name.
///
/// Returns `None` if the name doesn't contain at least one `.`-separated
/// label after the colon, which should never happen for names we
/// allocated ourselves or accepted from a peer's `ExchangeNames`.
pub fn short_guid(unique_name: &UniqueName<'_>) -> Option<&str> {
    let rest = unique_name.as_str().strip_prefix(':')?;
    rest.split('.').next().filter(|s| !s.is_empty())
}

/// Whether `unique_name`'s short-GUID segment matches `local_short_guid`.
///
/// Used to reject a peer daemon trying to introduce (via `ExchangeNames`
/// or `NameChanged`) a unique name that claims to be ours, and to filter
/// `ExchangeNames` entries that are just the recipient's own names
/// reflected back.
pub fn is_local_guid(unique_name: &UniqueName<'_>, local_short_guid: &str) -> bool {
    short_guid(unique_name) == Some(local_short_guid)
}

/// Derives the short-GUID we use in our own allocated unique names from a
/// full `zbus::Guid`. We use the first 8 hex characters: `zbus`'s own
/// `:1.N` unique-name scheme isn't applicable here since we need a value
/// that's stable for the life of the daemon and distinguishes us from
/// peers.
pub fn daemon_short_guid(guid: &zbus::Guid) -> String {
    let full = guid.to_string();
    full.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn extracts_short_guid() {
        let name = UniqueName::try_from(":abcd1234.17").unwrap();
        assert_eq!(short_guid(&name), Some("abcd1234"));
    }

    #[test]
    fn detects_local_guid() {
        let name = UniqueName::try_from(":abcd1234.17").unwrap();
        assert!(is_local_guid(&name, "abcd1234"));
        assert!(!is_local_guid(&name, "other"));
    }

    #[test]
    fn rejects_malformed_name() {
        let name = UniqueName::try_from(":nolabel").unwrap();
        assert_eq!(short_guid(&name), Some("nolabel"));
    }
}
