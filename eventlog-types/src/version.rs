use nutype::nutype;
use std::fmt;

/// Per-stream version of an event.
///
/// Versions are stream-local: the first event of every stream has
/// [`Version::first`] and each following event of the same stream has the
/// next version, without gaps. The pair (stream, version) is unique across
/// the event log.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct Version(u64);

impl Version {
    /// Version assigned to the first event of a stream.
    pub fn first() -> Self {
        Self::new(0)
    }

    /// The version directly following this one.
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }
}

/// Current version of a stream, or the fact that the stream has no events.
///
/// Kept as a sum type so that "stream at version 0" and "no stream yet"
/// can never be confused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaybeVersion {
    /// The stream does not contain any events.
    NoStream,
    /// The stream exists and its latest event has this version.
    Exists(Version),
}

impl MaybeVersion {
    /// Version the next appended event of the stream receives.
    pub fn next_version(self) -> Version {
        match self {
            Self::NoStream => Version::first(),
            Self::Exists(version) => version.next(),
        }
    }

    /// Whether the stream holds at least one event.
    pub fn stream_exists(self) -> bool {
        matches!(self, Self::Exists(_))
    }
}

impl From<Option<Version>> for MaybeVersion {
    fn from(version: Option<Version>) -> Self {
        version.map_or(Self::NoStream, Self::Exists)
    }
}

impl fmt::Display for MaybeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoStream => write!(f, "no stream"),
            Self::Exists(version) => write!(f, "{version}"),
        }
    }
}

/// Assertion a committer makes about the current version of the target stream.
///
/// Evaluated against the stream's [`MaybeVersion`] before anything is
/// written. A failed assertion is a logical conflict reported to the caller,
/// never retried by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpectedVersion {
    /// Any current state is acceptable, including a missing stream.
    Any,
    /// The stream must not contain any events yet.
    NoStream,
    /// The stream must contain at least one event.
    StreamExists,
    /// The stream's latest event must have exactly this version.
    Exactly(Version),
}

impl ExpectedVersion {
    /// Whether a stream currently at `actual` meets this expectation.
    pub fn is_satisfied_by(self, actual: MaybeVersion) -> bool {
        match (self, actual) {
            (Self::Any, _)
            | (Self::NoStream, MaybeVersion::NoStream)
            | (Self::StreamExists, MaybeVersion::Exists(_)) => true,
            (Self::Exactly(expected), MaybeVersion::Exists(current)) => expected == current,
            _ => false,
        }
    }
}

impl From<Version> for ExpectedVersion {
    fn from(version: Version) -> Self {
        Self::Exactly(version)
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::NoStream => write!(f, "no stream"),
            Self::StreamExists => write!(f, "stream exists"),
            Self::Exactly(version) => write!(f, "{version}"),
        }
    }
}

/// Global position of an event in the log.
///
/// Assigned by storage at insert time, strictly increasing across all
/// streams and never reused. Events start at 1; [`SequenceNumber::none`]
/// (0) is the position of a consumer that has not applied anything yet.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// Position before the first event.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// The position directly after this one.
    pub fn next(self) -> Self {
        Self::new(self.into_inner() + 1)
    }

    /// The position directly before this one, saturating at [`SequenceNumber::none`].
    pub fn previous(self) -> Self {
        Self::new(self.into_inner().saturating_sub(1))
    }
}

/// What a successful commit durably wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    /// Version assigned to the last event of the batch.
    pub version: Version,
    /// Global position of the last event of the batch.
    pub sequence_number: SequenceNumber,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_stream_starts_at_first_version() {
        assert_eq!(MaybeVersion::NoStream.next_version(), Version::first());
    }

    #[test]
    fn existing_stream_continues_after_current_version() {
        let current = MaybeVersion::Exists(Version::new(4));

        assert_eq!(current.next_version(), Version::new(5));
    }

    #[test]
    fn version_zero_is_not_a_missing_stream() {
        assert_ne!(
            MaybeVersion::from(Some(Version::first())),
            MaybeVersion::NoStream
        );
        assert_eq!(MaybeVersion::from(None), MaybeVersion::NoStream);
    }

    #[test]
    fn no_stream_expectation_rejects_existing_stream() {
        let expected = ExpectedVersion::NoStream;

        assert!(expected.is_satisfied_by(MaybeVersion::NoStream));
        assert!(!expected.is_satisfied_by(MaybeVersion::Exists(Version::first())));
    }

    #[test]
    fn stream_exists_expectation_rejects_missing_stream() {
        let expected = ExpectedVersion::StreamExists;

        assert!(!expected.is_satisfied_by(MaybeVersion::NoStream));
        assert!(expected.is_satisfied_by(MaybeVersion::Exists(Version::new(9))));
    }

    #[test]
    fn exact_expectation_requires_matching_version() {
        let expected = ExpectedVersion::Exactly(Version::new(2));

        assert!(expected.is_satisfied_by(MaybeVersion::Exists(Version::new(2))));
        assert!(!expected.is_satisfied_by(MaybeVersion::Exists(Version::new(3))));
        assert!(!expected.is_satisfied_by(MaybeVersion::NoStream));
    }

    #[test]
    fn exact_version_zero_does_not_match_missing_stream() {
        let expected = ExpectedVersion::Exactly(Version::first());

        assert!(!expected.is_satisfied_by(MaybeVersion::NoStream));
    }

    #[test]
    fn previous_sequence_number_saturates_at_none() {
        assert_eq!(SequenceNumber::none().previous(), SequenceNumber::none());
        assert_eq!(SequenceNumber::new(7).previous(), SequenceNumber::new(6));
    }

    #[test]
    fn maybe_version_display_distinguishes_missing_stream() {
        assert_eq!(MaybeVersion::NoStream.to_string(), "no stream");
        assert_eq!(MaybeVersion::Exists(Version::new(3)).to_string(), "3");
    }

    proptest! {
        #[test]
        fn any_expectation_accepts_every_state(version in proptest::option::of(0u64..10_000)) {
            let actual = MaybeVersion::from(version.map(Version::new));

            prop_assert!(ExpectedVersion::Any.is_satisfied_by(actual));
        }

        #[test]
        fn next_version_is_strictly_greater(version in 0u64..u64::MAX) {
            let current = Version::new(version);

            prop_assert!(MaybeVersion::Exists(current).next_version() > current);
        }
    }
}
