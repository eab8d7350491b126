//! Shared validation predicates for domain types.
//!
//! This module contains validation functions used by nutype-based domain types
//! across the eventlog crates.

/// Validation predicate: reject control characters.
///
/// Names end up in bounded `VARCHAR` columns and in log lines; control
/// characters in either place are never intended.
pub(crate) fn no_control_characters(s: &str) -> bool {
    !s.chars().any(char::is_control)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_names_pass_validation() {
        assert!(no_control_characters("orders:42"));
        assert!(no_control_characters("tenant/account/456"));
        assert!(no_control_characters("Billing.Invoice:InvoiceIssued"));
    }

    #[test]
    fn names_with_control_characters_fail_validation() {
        assert!(!no_control_characters("orders\n42"));
        assert!(!no_control_characters("orders\t42"));
        assert!(!no_control_characters("orders\u{0}42"));
    }
}
