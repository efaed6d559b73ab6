//! Option vocabulary carried in the open Options/Details dictionaries.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Option keys understood by the dealer.
pub mod keys {
    pub const MATCH: &str = "match";
    pub const INVOKE: &str = "invoke";
    pub const RECEIVE_PROGRESS: &str = "receive_progress";
    pub const PROGRESS: &str = "progress";
    pub const TIMEOUT: &str = "timeout";
    pub const MODE: &str = "mode";
    pub const REASON: &str = "reason";
    pub const DISCLOSE_ME: &str = "disclose_me";
    pub const CALLER: &str = "caller";
    pub const PROCEDURE: &str = "procedure";
    pub const MESSAGE: &str = "message";
}

/// How a called URI is matched against registered procedure names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    #[default]
    Exact,
    Prefix,
    Wildcard,
}

impl MatchPolicy {
    /// Lookup order, narrowest first.
    pub const PRIORITY: [MatchPolicy; 3] =
        [MatchPolicy::Exact, MatchPolicy::Prefix, MatchPolicy::Wildcard];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::Exact => "exact",
            MatchPolicy::Prefix => "prefix",
            MatchPolicy::Wildcard => "wildcard",
        }
    }
}

/// How one target is picked among the registrations of a shared procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationPolicy {
    #[default]
    Single,
    RoundRobin,
    Random,
    First,
    Last,
}

impl InvocationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationPolicy::Single => "single",
            InvocationPolicy::RoundRobin => "roundrobin",
            InvocationPolicy::Random => "random",
            InvocationPolicy::First => "first",
            InvocationPolicy::Last => "last",
        }
    }

    /// Returns whether more than one registration may share the name.
    pub fn is_shared(&self) -> bool {
        !matches!(self, InvocationPolicy::Single)
    }
}

/// Cancellation mode requested in CANCEL options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelMode {
    Skip,
    Kill,
    #[default]
    KillNoWait,
}

impl CancelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelMode::Skip => "skip",
            CancelMode::Kill => "kill",
            CancelMode::KillNoWait => "killnowait",
        }
    }

    /// Reason string attached to errors and interrupts caused by this mode.
    pub fn reason(&self) -> &'static str {
        match self {
            CancelMode::Skip => "call.canceled.skip",
            CancelMode::Kill => "call.canceled.kill",
            CancelMode::KillNoWait => "call.canceled.killnowait",
        }
    }
}

/// Error returned when an option value is not one of the known spellings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOption(pub String);

impl fmt::Display for UnknownOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown option value '{}'", self.0)
    }
}

impl std::error::Error for UnknownOption {}

macro_rules! impl_from_str {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = UnknownOption;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| UnknownOption(s.to_string()))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_from_str!(
    MatchPolicy,
    [MatchPolicy::Exact, MatchPolicy::Prefix, MatchPolicy::Wildcard]
);
impl_from_str!(
    InvocationPolicy,
    [
        InvocationPolicy::Single,
        InvocationPolicy::RoundRobin,
        InvocationPolicy::Random,
        InvocationPolicy::First,
        InvocationPolicy::Last,
    ]
);
impl_from_str!(
    CancelMode,
    [CancelMode::Skip, CancelMode::Kill, CancelMode::KillNoWait]
);

/// Reads an optional enum-valued option; absent keys yield `None`.
pub fn parse_option<T: FromStr<Err = UnknownOption>>(
    options: &Map<String, Value>,
    key: &str,
) -> Result<Option<T>, UnknownOption> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => s.parse().map(Some),
        Some(other) => Err(UnknownOption(other.to_string())),
    }
}

/// Reads a boolean flag; anything but `true` is false.
pub fn flag(options: &Map<String, Value>, key: &str) -> bool {
    matches!(options.get(key), Some(Value::Bool(true)))
}
