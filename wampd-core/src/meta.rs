//! Registration meta-procedures answered by the dealer itself.
//!
//! Each procedure declares one or more overloads. Call arguments are scored
//! against every overload: a negative score means required arguments are
//! missing or mistyped, a positive score grows with the number of matched
//! arguments and shrinks with surplus ones. The best positive overload wins.

use crate::error::CoreError;
use crate::table::RegistrationTable;
use serde_json::{json, Value};
use wampd_protocol::options::{keys, parse_option};
use wampd_protocol::uri::{is_valid_id, is_valid_uri};
use wampd_protocol::{MatchPolicy, Payload};

/// Parameter kinds of meta-procedure overloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    Uri,
    Id,
    Options,
}

impl Param {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Param::Uri => value.as_str().is_some_and(is_valid_uri),
            Param::Id => value.as_u64().is_some_and(is_valid_id),
            Param::Options => value.is_object(),
        }
    }
}

/// Scores `args` against one overload.
pub fn score(params: &[Param], args: &[Value]) -> i32 {
    let mut missing = 0i32;
    let mut matched = 0i32;
    for (i, param) in params.iter().enumerate() {
        match args.get(i) {
            Some(value) if param.accepts(value) => matched += 1,
            _ => missing += 1,
        }
    }
    if missing > 0 {
        return -missing;
    }
    let extras = (args.len() - params.len()) as i32;
    (1 + 2 * matched - extras).max(1)
}

/// The `wamp.registration.*` procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaProcedure {
    List,
    Lookup,
    Match,
    Get,
    ListCallees,
    CountCallees,
}

impl MetaProcedure {
    pub const ALL: [MetaProcedure; 6] = [
        MetaProcedure::List,
        MetaProcedure::Lookup,
        MetaProcedure::Match,
        MetaProcedure::Get,
        MetaProcedure::ListCallees,
        MetaProcedure::CountCallees,
    ];

    pub fn uri(&self) -> &'static str {
        match self {
            MetaProcedure::List => "wamp.registration.list",
            MetaProcedure::Lookup => "wamp.registration.lookup",
            MetaProcedure::Match => "wamp.registration.match",
            MetaProcedure::Get => "wamp.registration.get",
            MetaProcedure::ListCallees => "wamp.registration.list_callees",
            MetaProcedure::CountCallees => "wamp.registration.count_callees",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.uri() == uri)
    }

    pub fn overloads(&self) -> &'static [&'static [Param]] {
        match self {
            MetaProcedure::List => &[&[]],
            MetaProcedure::Lookup | MetaProcedure::Match => {
                &[&[Param::Uri], &[Param::Uri, Param::Options]]
            }
            MetaProcedure::Get | MetaProcedure::ListCallees | MetaProcedure::CountCallees => {
                &[&[Param::Id]]
            }
        }
    }

    /// Returns the best-fitting overload for `args`, if any is valid.
    pub fn resolve(&self, args: &[Value]) -> Option<&'static [Param]> {
        self.overloads()
            .iter()
            .map(|params| (score(params, args), *params))
            .filter(|(score, _)| *score > 0)
            .max_by_key(|(score, _)| *score)
            .map(|(_, params)| params)
    }

    /// Runs the procedure against `table`.
    pub fn invoke(&self, table: &RegistrationTable, args: &[Value]) -> Result<Payload, CoreError> {
        let params = self.resolve(args).ok_or_else(|| CoreError::InvalidArgument {
            reason: format!("{} does not accept these arguments", self.uri()),
        })?;

        let uri = || args.first().and_then(Value::as_str).unwrap_or_default();
        let id = || args.first().and_then(Value::as_u64).unwrap_or_default();

        let result = match self {
            MetaProcedure::List => json!({
                "exact": table.entry_ids(MatchPolicy::Exact),
                "prefix": table.entry_ids(MatchPolicy::Prefix),
                "wildcard": table.entry_ids(MatchPolicy::Wildcard),
            }),
            MetaProcedure::Lookup => {
                let policy: MatchPolicy = match params.len() {
                    2 => args
                        .get(1)
                        .and_then(Value::as_object)
                        .map(|options| parse_option(options, keys::MATCH))
                        .transpose()?
                        .flatten()
                        .unwrap_or_default(),
                    _ => MatchPolicy::Exact,
                };
                json!(table.lookup_exact(uri(), policy).map(|e| e.id))
            }
            MetaProcedure::Match => json!(table.lookup(uri()).map(|e| e.id)),
            MetaProcedure::Get => {
                let entry = table
                    .entry(id())
                    .ok_or(CoreError::NoSuchRegistration { registration: id() })?;
                json!(entry.details())
            }
            MetaProcedure::ListCallees => {
                let entry = table
                    .entry(id())
                    .ok_or(CoreError::NoSuchRegistration { registration: id() })?;
                let sessions: Vec<u64> =
                    table.members(&entry).iter().map(|p| p.session_id()).collect();
                json!(sessions)
            }
            MetaProcedure::CountCallees => {
                let entry = table
                    .entry(id())
                    .ok_or(CoreError::NoSuchRegistration { registration: id() })?;
                json!(entry.len())
            }
        };
        Ok(Payload::args(vec![result]))
    }
}
