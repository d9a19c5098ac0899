#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The router (C4, §4.4): a pure function from a source's routing
//! configuration to a destination id. Same input always yields the same
//! output.

/// The outcome of routing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The record was routed to this destination id.
    Routed(String),
    /// Neither a `routing_hint` nor a default destination was available.
    Unroutable,
}

/// Computes the destination id for `record`, given the owning source's
/// `routing_hint` (if any) and the bridge-wide default destination (if any).
/// Absent both, the record is `Unroutable` and the caller is responsible for
/// incrementing the `unroutable` counter (§4.4).
pub fn route(routing_hint: Option<&str>, default_destination: Option<&str>) -> RouteOutcome {
    routing_hint
        .or(default_destination)
        .map(|id| RouteOutcome::Routed(id.to_string()))
        .unwrap_or(RouteOutcome::Unroutable)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn routing_hint_wins_over_default() {
        assert_eq!(route(Some("hint-dest"), Some("default-dest")), RouteOutcome::Routed("hint-dest".to_string()));
    }

    #[test]
    fn falls_back_to_default_destination() {
        assert_eq!(route(None, Some("default-dest")), RouteOutcome::Routed("default-dest".to_string()));
    }

    #[test]
    fn unroutable_without_either() {
        assert_eq!(route(None, None), RouteOutcome::Unroutable);
    }

    #[test]
    fn routing_is_pure() {
        assert_eq!(route(Some("a"), Some("b")), route(Some("a"), Some("b")));
    }
}
