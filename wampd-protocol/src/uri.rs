//! URI and ID validation.
//!
//! URIs are dot-separated segments. On the wire a segment may be empty (that
//! is how wildcard patterns are spelled), but it may never contain
//! whitespace, control characters or `#`. Whether empty segments are
//! acceptable for a particular procedure depends on its match policy.

use crate::options::MatchPolicy;

/// Largest valid session, request or registration ID.
pub const MAX_ID: u64 = (1 << 56) - 1;

/// URI prefix reserved for router-provided procedures and topics.
pub const RESERVED_PREFIX: &str = "wamp.";

/// Returns whether `id` lies in `[1, MAX_ID]`.
pub fn is_valid_id(id: u64) -> bool {
    (1..=MAX_ID).contains(&id)
}

fn is_valid_segment(segment: &str) -> bool {
    !segment
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || c == '#')
}

/// Wire-level URI check used by the message codec.
pub fn is_valid_uri(uri: &str) -> bool {
    !uri.is_empty() && uri.split('.').all(is_valid_segment)
}

/// Checks a procedure URI against the rules of its match policy.
///
/// - `Exact`: every segment non-empty.
/// - `Prefix`: every segment non-empty, except that a trailing dot is allowed.
/// - `Wildcard`: empty segments allowed anywhere.
pub fn is_valid_procedure(uri: &str, policy: MatchPolicy) -> bool {
    if !is_valid_uri(uri) {
        return false;
    }
    let segments: Vec<&str> = uri.split('.').collect();
    match policy {
        MatchPolicy::Exact => segments.iter().all(|s| !s.is_empty()),
        MatchPolicy::Prefix => {
            let last = segments.len() - 1;
            segments
                .iter()
                .enumerate()
                .all(|(i, s)| !s.is_empty() || (i == last && i > 0))
        }
        MatchPolicy::Wildcard => true,
    }
}

/// Returns whether `uri` lives in the router-reserved namespace.
pub fn is_reserved(uri: &str) -> bool {
    uri.starts_with(RESERVED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_id_bounds() {
        assert!(!is_valid_id(0));
        assert!(is_valid_id(1));
        assert!(is_valid_id(MAX_ID));
        assert!(!is_valid_id(MAX_ID + 1));
        assert!(!is_valid_id(u64::MAX));
    }

    #[test]
    fn test_wire_uri() {
        assert!(is_valid_uri("com.example.echo"));
        assert!(is_valid_uri("com..echo"));
        assert!(is_valid_uri("echo"));

        assert!(!is_valid_uri(""));
        assert!(!is_valid_uri("com.exa mple"));
        assert!(!is_valid_uri("com.\texample"));
        assert!(!is_valid_uri("com.ex#ample"));
        assert!(!is_valid_uri("com.\u{7}bell"));
    }

    #[test]
    fn test_procedure_uri_by_policy() {
        assert!(is_valid_procedure("com.app.add", MatchPolicy::Exact));
        assert!(!is_valid_procedure("com..add", MatchPolicy::Exact));
        assert!(!is_valid_procedure("com.app.", MatchPolicy::Exact));

        assert!(is_valid_procedure("com.app", MatchPolicy::Prefix));
        assert!(is_valid_procedure("com.app.", MatchPolicy::Prefix));
        assert!(!is_valid_procedure("com..app", MatchPolicy::Prefix));
        assert!(!is_valid_procedure(".", MatchPolicy::Prefix));

        assert!(is_valid_procedure("com..add", MatchPolicy::Wildcard));
        assert!(is_valid_procedure(".app.", MatchPolicy::Wildcard));
        assert!(!is_valid_procedure("com. .add", MatchPolicy::Wildcard));
    }

    #[test]
    fn test_reserved_namespace() {
        assert!(is_reserved("wamp.registration.list"));
        assert!(!is_reserved("com.wamp.thing"));
        assert!(!is_reserved("wampish"));
    }

    proptest! {
        #[test]
        fn prop_ids_in_range_are_valid(id in 1u64..=MAX_ID) {
            prop_assert!(is_valid_id(id));
        }

        #[test]
        fn prop_ids_above_range_are_invalid(id in (MAX_ID + 1)..=u64::MAX) {
            prop_assert!(!is_valid_id(id));
        }

        #[test]
        fn prop_whitespace_poisons_any_uri(
            head in "[a-z]{1,8}",
            tail in "[a-z]{1,8}",
            ws in prop::sample::select(vec![' ', '\t', '\n', '\r']),
        ) {
            let uri = format!("{head}.{ws}{tail}");
            prop_assert!(!is_valid_uri(&uri));
            prop_assert!(!is_valid_procedure(&uri, MatchPolicy::Wildcard));
        }

        #[test]
        fn prop_dotted_identifiers_are_exact_procedures(
            segments in prop::collection::vec("[a-z_][a-z0-9_]{0,7}", 1..6)
        ) {
            let uri = segments.join(".");
            prop_assert!(is_valid_procedure(&uri, MatchPolicy::Exact));
            prop_assert!(is_valid_procedure(&uri, MatchPolicy::Prefix));
            prop_assert!(is_valid_procedure(&uri, MatchPolicy::Wildcard));
        }
    }
}
