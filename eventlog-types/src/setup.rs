use std::fmt;

/// Human-readable outcome of an idempotent `setup()` call.
///
/// Lists every schema change that was applied. An empty report means the
/// live schema already matched and nothing was touched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetupReport {
    changes: Vec<String>,
}

impl SetupReport {
    /// Report of a setup that found nothing to do.
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Append the description of an applied change.
    pub fn record(&mut self, change: impl Into<String>) {
        self.changes.push(change.into());
    }

    /// Append every change of `other`.
    pub fn extend(&mut self, other: Self) {
        self.changes.extend(other.changes);
    }

    /// Whether nothing was applied.
    pub fn is_unchanged(&self) -> bool {
        self.changes.is_empty()
    }

    /// Applied changes in the order they were made.
    pub fn changes(&self) -> &[String] {
        &self.changes
    }
}

impl fmt::Display for SetupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.changes.is_empty() {
            return write!(f, "no changes");
        }
        write!(f, "{}", self.changes.join("; "))
    }
}

/// Read-only health report of a store, as returned by `status()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    /// Reachable and the schema is complete.
    Ok { details: String },
    /// Reachable, but `setup()` has pending changes.
    SetupRequired { details: String },
    /// The store could not be inspected.
    Error { details: String },
}

impl StoreStatus {
    /// Whether the store is ready for use.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    /// Human-readable explanation of the status.
    pub fn details(&self) -> &str {
        match self {
            Self::Ok { details } | Self::SetupRequired { details } | Self::Error { details } => {
                details
            }
        }
    }
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok { details } => write!(f, "ok: {details}"),
            Self::SetupRequired { details } => write!(f, "setup required: {details}"),
            Self::Error { details } => write!(f, "error: {details}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_describes_no_changes() {
        assert_eq!(SetupReport::unchanged().to_string(), "no changes");
    }

    #[test]
    fn report_lists_changes_in_order() {
        let mut report = SetupReport::unchanged();
        report.record("created table events");
        report.record("created index events_id_key");

        assert!(!report.is_unchanged());
        assert_eq!(
            report.to_string(),
            "created table events; created index events_id_key"
        );
    }
}
