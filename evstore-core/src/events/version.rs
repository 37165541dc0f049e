//! Optimistic concurrency guard for appends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What the writer believes the stream looks like before its append.
///
/// Versions are zero-based, so a stream holding `n` events has versions
/// `0..n` and its next append starts at version `n`. `Exact(n)` therefore
/// asserts that the stream currently holds exactly `n` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedVersion {
    /// Append regardless of the current stream length.
    #[default]
    Any,
    /// The stream must not exist yet. Equivalent to `Exact(0)`.
    NoStream,
    /// The stream must hold exactly this many events.
    Exact(u64),
}

impl ExpectedVersion {
    /// Check the guard against the number of events currently in the stream.
    pub fn matches(&self, current_len: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current_len == 0,
            ExpectedVersion::Exact(n) => current_len == *n,
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::NoStream => write!(f, "no stream"),
            ExpectedVersion::Exact(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for ExpectedVersion {
    type Err = String;

    /// Parses `any`, `no-stream` (or `no_stream`) or a non-negative integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" => Ok(ExpectedVersion::Any),
            "no-stream" | "no_stream" | "nostream" => Ok(ExpectedVersion::NoStream),
            other => other
                .parse::<u64>()
                .map(ExpectedVersion::Exact)
                .map_err(|_| format!("invalid expected version: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_stream_only_matches_empty() {
        assert!(ExpectedVersion::NoStream.matches(0));
        assert!(!ExpectedVersion::NoStream.matches(1));
    }

    #[test]
    fn exact_matches_current_length() {
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(2));
        assert!(!ExpectedVersion::Exact(3).matches(4));
    }

    #[test]
    fn any_always_matches() {
        assert!(ExpectedVersion::Any.matches(0));
        assert!(ExpectedVersion::Any.matches(u64::MAX));
    }

    #[test]
    fn parses_cli_forms() {
        assert_eq!("any".parse::<ExpectedVersion>(), Ok(ExpectedVersion::Any));
        assert_eq!(
            "no-stream".parse::<ExpectedVersion>(),
            Ok(ExpectedVersion::NoStream)
        );
        assert_eq!("12".parse::<ExpectedVersion>(), Ok(ExpectedVersion::Exact(12)));
        assert!("-1".parse::<ExpectedVersion>().is_err());
    }

    #[test]
    fn serde_form() {
        assert_eq!(
            serde_json::to_string(&ExpectedVersion::NoStream).unwrap(),
            "\"no_stream\""
        );
        assert_eq!(
            serde_json::to_string(&ExpectedVersion::Exact(4)).unwrap(),
            "{\"exact\":4}"
        );
        let parsed: ExpectedVersion = serde_json::from_str("\"any\"").unwrap();
        assert_eq!(parsed, ExpectedVersion::Any);
    }
}
