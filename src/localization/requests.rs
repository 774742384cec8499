//! Per-input transfer decisions: the override vocabulary users write, and
//! the typed request tree the engine resolves each input into.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use super::paths::PathReservation;

/// Per-variable localization override. Tokens are exact and case-sensitive;
/// an unset variable gets the default eager behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverrideMode {
    /// Stream the object into a named pipe at job start.
    Stream,
    /// Download the object at job start instead of up front.
    Delayed,
    /// Download the object onto provisioned node-local storage at job start.
    Local,
    /// Treat every occurrence as a common input.
    Common,
    /// Default eager localization, stated explicitly.
    Localize,
    /// Default eager localization; shared-filesystem engines may link.
    Symlink,
    /// Pass the value through untouched, no localization at all.
    Null,
}

impl FromStr for OverrideMode {
    type Err = ();

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        match token {
            "stream" => Ok(OverrideMode::Stream),
            "delayed" => Ok(OverrideMode::Delayed),
            "local" => Ok(OverrideMode::Local),
            "common" => Ok(OverrideMode::Common),
            "localize" => Ok(OverrideMode::Localize),
            "symlink" => Ok(OverrideMode::Symlink),
            "null" => Ok(OverrideMode::Null),
            _ => Err(()),
        }
    }
}

impl fmt::Display for OverrideMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = match self {
            OverrideMode::Stream => "stream",
            OverrideMode::Delayed => "delayed",
            OverrideMode::Local => "local",
            OverrideMode::Common => "common",
            OverrideMode::Localize => "localize",
            OverrideMode::Symlink => "symlink",
            OverrideMode::Null => "null",
        };
        f.write_str(token)
    }
}

pub type Overrides = BTreeMap<String, OverrideMode>;

/// Parse a raw override table, dropping unknown tokens with a warning.
pub fn parse_overrides<'a, I>(raw: I) -> Overrides
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut overrides = Overrides::new();
    for (variable, token) in raw {
        match token.parse() {
            Ok(mode) => {
                overrides.insert(variable.to_string(), mode);
            }
            Err(()) => {
                warn!(variable, token, "unknown localization override, using default");
            }
        }
    }
    overrides
}

/// What must happen to one input value before (or when) its job runs.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalizationRequest {
    /// Plain argument value, exported untouched.
    Literal { value: String },
    /// Already localized to a job-private reservation.
    Reserved { reservation: PathReservation },
    /// Already localized once into the shared common subtree.
    Common { reservation: PathReservation },
    /// Stream into a named pipe when the job starts.
    Stream {
        url: String,
        user_project: Option<String>,
    },
    /// Download at job start, guarded by an idempotency marker.
    Delayed {
        url: String,
        user_project: Option<String>,
    },
    /// Download onto provisioned node-local storage at job start.
    LocalDisk {
        url: String,
        user_project: Option<String>,
    },
    /// Element-wise requests for a literal array input, order preserved.
    Array(Vec<LocalizationRequest>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vocabulary_is_exact_and_case_sensitive() {
        assert_eq!("stream".parse(), Ok(OverrideMode::Stream));
        assert_eq!("null".parse(), Ok(OverrideMode::Null));
        assert_eq!("Stream".parse::<OverrideMode>(), Err(()));
        assert_eq!("eager".parse::<OverrideMode>(), Err(()));
    }

    #[test]
    fn unknown_tokens_are_dropped() {
        let overrides = parse_overrides([("a", "delayed"), ("b", "bogus")]);
        assert_eq!(overrides.get("a"), Some(&OverrideMode::Delayed));
        assert!(!overrides.contains_key("b"));
    }
}
