//! Procedure registration directory.
//!
//! Names are kept in one map per match policy. Each name maps to a
//! [`RegistrationEntry`] holding the ordered registration ids of its callees
//! and the round-robin cursor. Locking:
//!
//! - structural changes (adding/removing entries) take the table `RwLock`
//!   for writing; lookups take it for reading
//! - the id list and cursor of one entry are guarded by the entry's mutex
//! - procedures are indexed by registration id in a `DashMap`
//!
//! Locks are always taken in that order.

use crate::error::CoreError;
use crate::meta::MetaProcedure;
use crate::peer::{MetaEventSink, Peer, RegistrationDetails, RegistrationEvent, RegistrationEventKind};
use crate::stats::{CallStats, DealerStats};
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wampd_protocol::uri::MAX_ID;
use wampd_protocol::{Dict, InvocationPolicy, MatchPolicy};

/// Allocates ids in `[1, MAX_ID]`, wrapping around and skipping live ids.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self, in_use: impl Fn(u64) -> bool) -> u64 {
        loop {
            let id = self
                .next
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    Some(if n >= MAX_ID { 1 } else { n + 1 })
                })
                .unwrap_or_else(|n| n);
            if !in_use(id) {
                return id;
            }
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// One callee's registration.
pub struct Procedure {
    pub id: u64,
    pub session: Arc<dyn Peer>,
    pub options: Dict,
    pub stats: Option<Arc<CallStats>>,
    entry: Arc<RegistrationEntry>,
}

impl Procedure {
    pub fn entry(&self) -> &Arc<RegistrationEntry> {
        &self.entry
    }

    pub fn uri(&self) -> &str {
        &self.entry.uri
    }

    pub fn session_id(&self) -> u64 {
        self.session.session_id()
    }
}

impl std::fmt::Debug for Procedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Procedure")
            .field("id", &self.id)
            .field("session", &self.session.session_id())
            .field("uri", &self.entry.uri)
            .finish()
    }
}

#[derive(Debug, Default)]
struct Members {
    ids: Vec<u64>,
    cursor: usize,
}

/// A procedure name under one match policy, shared by its registrations.
#[derive(Debug)]
pub struct RegistrationEntry {
    pub id: u64,
    pub uri: String,
    pub match_policy: MatchPolicy,
    pub invoke: InvocationPolicy,
    pub created: DateTime<Utc>,
    members: Mutex<Members>,
}

impl RegistrationEntry {
    /// Registration ids in registration order.
    pub fn ids(&self) -> Vec<u64> {
        self.members.lock().ids.clone()
    }

    pub fn len(&self) -> usize {
        self.members.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the registration id to invoke according to the entry's policy.
    pub fn pick(&self) -> Option<u64> {
        let mut members = self.members.lock();
        let len = members.ids.len();
        if len == 0 {
            return None;
        }
        let index = match self.invoke {
            InvocationPolicy::Single | InvocationPolicy::First => 0,
            InvocationPolicy::Last => len - 1,
            InvocationPolicy::Random => rand::thread_rng().gen_range(0..len),
            InvocationPolicy::RoundRobin => {
                let index = members.cursor % len;
                members.cursor = (index + 1) % len;
                index
            }
        };
        Some(members.ids[index])
    }

    pub fn details(&self) -> RegistrationDetails {
        RegistrationDetails {
            id: self.id,
            created: self.created.to_rfc3339_opts(SecondsFormat::Millis, true),
            uri: self.uri.clone(),
            match_policy: self.match_policy.to_string(),
            invoke: self.invoke.to_string(),
        }
    }

    fn push(&self, id: u64) {
        self.members.lock().ids.push(id);
    }

    /// Removes `id`, keeping the cursor on the same next member. Returns
    /// the number of members left.
    fn remove(&self, id: u64) -> usize {
        let mut members = self.members.lock();
        if let Some(pos) = members.ids.iter().position(|&m| m == id) {
            members.ids.remove(pos);
            if pos < members.cursor {
                members.cursor -= 1;
            }
        }
        members.ids.len()
    }

    fn matches(&self, uri: &str) -> bool {
        match self.match_policy {
            MatchPolicy::Exact => self.uri == uri,
            MatchPolicy::Prefix => uri.starts_with(&self.uri),
            MatchPolicy::Wildcard => wildcard_matches(&self.uri, uri),
        }
    }

    fn concrete_segments(&self) -> usize {
        self.uri.split('.').filter(|s| !s.is_empty()).count()
    }
}

fn wildcard_matches(pattern: &str, uri: &str) -> bool {
    let pattern = pattern.split('.');
    let uri = uri.split('.');
    pattern.clone().count() == uri.clone().count()
        && pattern.zip(uri).all(|(p, u)| p.is_empty() || p == u)
}

/// Where a called URI is dispatched.
#[derive(Debug, Clone)]
pub enum Target {
    /// Registered by a callee session.
    Remote(Arc<RegistrationEntry>),
    /// Answered by the dealer itself.
    Local(MetaProcedure),
}

#[derive(Default)]
struct Entries {
    exact: HashMap<String, Arc<RegistrationEntry>>,
    prefix: HashMap<String, Arc<RegistrationEntry>>,
    wildcard: HashMap<String, Arc<RegistrationEntry>>,
}

impl Entries {
    fn by_policy(&self, policy: MatchPolicy) -> &HashMap<String, Arc<RegistrationEntry>> {
        match policy {
            MatchPolicy::Exact => &self.exact,
            MatchPolicy::Prefix => &self.prefix,
            MatchPolicy::Wildcard => &self.wildcard,
        }
    }

    fn by_policy_mut(&mut self, policy: MatchPolicy) -> &mut HashMap<String, Arc<RegistrationEntry>> {
        match policy {
            MatchPolicy::Exact => &mut self.exact,
            MatchPolicy::Prefix => &mut self.prefix,
            MatchPolicy::Wildcard => &mut self.wildcard,
        }
    }

    fn best_match(&self, policy: MatchPolicy, uri: &str) -> Option<&Arc<RegistrationEntry>> {
        match policy {
            MatchPolicy::Exact => self.exact.get(uri),
            MatchPolicy::Prefix => self
                .prefix
                .values()
                .filter(|e| e.matches(uri))
                .max_by_key(|e| e.uri.len()),
            MatchPolicy::Wildcard => self
                .wildcard
                .values()
                .filter(|e| e.matches(uri))
                .min_by(|a, b| {
                    b.concrete_segments()
                        .cmp(&a.concrete_segments())
                        .then_with(|| a.uri.cmp(&b.uri))
                }),
        }
    }
}

/// The registration directory.
pub struct RegistrationTable {
    entries: RwLock<Entries>,
    entries_by_id: DashMap<u64, Arc<RegistrationEntry>>,
    procedures: DashMap<u64, Arc<Procedure>>,
    ids: IdAllocator,
    events: Arc<dyn MetaEventSink>,
    stats: Option<Arc<DealerStats>>,
}

impl RegistrationTable {
    pub fn new(events: Arc<dyn MetaEventSink>) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            entries_by_id: DashMap::new(),
            procedures: DashMap::new(),
            ids: IdAllocator::new(),
            events,
            stats: None,
        }
    }

    /// Attaches per-procedure statistics to new registrations.
    pub fn with_stats(mut self, stats: Arc<DealerStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn allocate_id(&self) -> u64 {
        self.ids.allocate(|id| {
            self.procedures.contains_key(&id) || self.entries_by_id.contains_key(&id)
        })
    }

    /// Registers `session` as a callee of `uri`.
    ///
    /// Fails with `ProcedureAlreadyExists` when an entry for `uri` under the
    /// same match policy exists and either does not share or shares under a
    /// different invocation policy.
    pub fn register(
        &self,
        session: Arc<dyn Peer>,
        uri: &str,
        match_policy: MatchPolicy,
        invoke: InvocationPolicy,
        options: Dict,
    ) -> Result<Arc<Procedure>, CoreError> {
        let session_id = session.session_id();
        let (procedure, created) = {
            let mut entries = self.entries.write();
            let (entry, created) = match entries.by_policy(match_policy).get(uri) {
                Some(entry) => {
                    if !entry.invoke.is_shared() || entry.invoke != invoke {
                        return Err(CoreError::ProcedureAlreadyExists {
                            uri: uri.to_string(),
                        });
                    }
                    (Arc::clone(entry), false)
                }
                None => {
                    let entry = Arc::new(RegistrationEntry {
                        id: self.allocate_id(),
                        uri: uri.to_string(),
                        match_policy,
                        invoke,
                        created: Utc::now(),
                        members: Mutex::new(Members::default()),
                    });
                    entries
                        .by_policy_mut(match_policy)
                        .insert(uri.to_string(), Arc::clone(&entry));
                    self.entries_by_id.insert(entry.id, Arc::clone(&entry));
                    (entry, true)
                }
            };

            let procedure = Arc::new(Procedure {
                id: self.allocate_id(),
                session,
                options,
                stats: self.stats.as_ref().map(|s| s.procedure(uri)),
                entry: Arc::clone(&entry),
            });
            self.procedures.insert(procedure.id, Arc::clone(&procedure));
            entry.push(procedure.id);
            (procedure, created)
        };

        tracing::debug!(
            "Registered {} ({}, {}) as {} for session {}",
            uri,
            match_policy,
            invoke,
            procedure.id,
            session_id
        );

        let entry = procedure.entry();
        if created {
            self.publish(RegistrationEventKind::Create, session_id, entry, true);
        }
        self.publish(RegistrationEventKind::Register, session_id, entry, false);
        Ok(procedure)
    }

    /// Removes one registration; drops its entry when no member is left.
    pub fn unregister(&self, registration: u64) -> Result<Arc<Procedure>, CoreError> {
        let (_, procedure) = self
            .procedures
            .remove(&registration)
            .ok_or(CoreError::NoSuchRegistration { registration })?;

        let entry = procedure.entry();
        let deleted = {
            let mut entries = self.entries.write();
            if entry.remove(registration) == 0 {
                let map = entries.by_policy_mut(entry.match_policy);
                if map.get(&entry.uri).is_some_and(|e| Arc::ptr_eq(e, entry)) {
                    map.remove(&entry.uri);
                }
                self.entries_by_id.remove(&entry.id);
                true
            } else {
                false
            }
        };

        tracing::debug!(
            "Unregistered {} from {} (entry {})",
            registration,
            entry.uri,
            if deleted { "deleted" } else { "kept" }
        );

        let session_id = procedure.session_id();
        self.publish(RegistrationEventKind::Unregister, session_id, entry, false);
        if deleted {
            self.publish(RegistrationEventKind::Delete, session_id, entry, false);
        }
        Ok(procedure)
    }

    /// Unregisters everything `session_id` owns. Returns the removed ids.
    pub fn close_session(&self, session_id: u64) -> Vec<u64> {
        let owned: Vec<u64> = self
            .procedures
            .iter()
            .filter(|p| p.session_id() == session_id)
            .map(|p| p.id)
            .collect();
        owned
            .into_iter()
            .filter(|&id| self.unregister(id).is_ok())
            .collect()
    }

    /// Finds the entry serving `uri`, trying exact, then prefix, then
    /// wildcard entries.
    pub fn lookup(&self, uri: &str) -> Option<Arc<RegistrationEntry>> {
        let entries = self.entries.read();
        MatchPolicy::PRIORITY
            .iter()
            .find_map(|&policy| entries.best_match(policy, uri))
            .cloned()
    }

    /// Finds the entry registered under exactly `uri` and `policy`.
    pub fn lookup_exact(&self, uri: &str, policy: MatchPolicy) -> Option<Arc<RegistrationEntry>> {
        self.entries.read().by_policy(policy).get(uri).cloned()
    }

    /// Resolves a called URI to a local meta-procedure or a remote entry.
    pub fn resolve(&self, uri: &str, meta_api: bool) -> Option<Target> {
        if meta_api {
            if let Some(meta) = MetaProcedure::from_uri(uri) {
                return Some(Target::Local(meta));
            }
        }
        self.lookup(uri).map(Target::Remote)
    }

    /// Picks one procedure of `entry` per its invocation policy.
    pub fn select(&self, entry: &RegistrationEntry) -> Option<Arc<Procedure>> {
        entry.pick().and_then(|id| self.procedure(id))
    }

    /// All live procedures of `entry`, in registration order.
    pub fn members(&self, entry: &RegistrationEntry) -> Vec<Arc<Procedure>> {
        entry
            .ids()
            .into_iter()
            .filter_map(|id| self.procedure(id))
            .collect()
    }

    pub fn procedure(&self, registration: u64) -> Option<Arc<Procedure>> {
        self.procedures.get(&registration).map(|p| Arc::clone(&p))
    }

    pub fn entry(&self, id: u64) -> Option<Arc<RegistrationEntry>> {
        self.entries_by_id.get(&id).map(|e| Arc::clone(&e))
    }

    /// Entry ids grouped by match policy.
    pub fn entry_ids(&self, policy: MatchPolicy) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .entries
            .read()
            .by_policy(policy)
            .values()
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.procedures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procedures.is_empty()
    }

    fn publish(
        &self,
        kind: RegistrationEventKind,
        session: u64,
        entry: &RegistrationEntry,
        with_details: bool,
    ) {
        self.events.publish(RegistrationEvent {
            kind,
            session,
            registration: entry.id,
            details: with_details.then(|| entry.details()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::NullSink;
    use proptest::prelude::*;
    use wampd_protocol::{Message, Role};

    struct StubPeer(u64);

    impl Peer for StubPeer {
        fn session_id(&self) -> u64 {
            self.0
        }
        fn has_role(&self, _role: Role) -> bool {
            true
        }
        fn supports(&self, _role: Role, _feature: &str) -> bool {
            true
        }
        fn send(&self, _message: Message) {}
        fn next_request_id(&self) -> u64 {
            1
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<RegistrationEvent>>);

    impl MetaEventSink for RecordingSink {
        fn publish(&self, event: RegistrationEvent) {
            self.0.lock().push(event);
        }
    }

    fn peer(id: u64) -> Arc<dyn Peer> {
        Arc::new(StubPeer(id))
    }

    fn table() -> RegistrationTable {
        RegistrationTable::new(Arc::new(NullSink))
    }

    fn register(
        table: &RegistrationTable,
        session: u64,
        uri: &str,
        policy: MatchPolicy,
        invoke: InvocationPolicy,
    ) -> Result<Arc<Procedure>, CoreError> {
        table.register(peer(session), uri, policy, invoke, Dict::new())
    }

    #[test]
    fn test_single_rejects_second_registrant() {
        let table = table();
        register(&table, 1, "com.echo", MatchPolicy::Exact, InvocationPolicy::Single).unwrap();
        let err =
            register(&table, 2, "com.echo", MatchPolicy::Exact, InvocationPolicy::Single).unwrap_err();
        assert!(matches!(err, CoreError::ProcedureAlreadyExists { .. }));

        // Same name under another match policy is a different entry.
        register(&table, 2, "com.echo", MatchPolicy::Prefix, InvocationPolicy::Single).unwrap();
    }

    #[test]
    fn test_shared_requires_same_policy() {
        let table = table();
        register(&table, 1, "com.work", MatchPolicy::Exact, InvocationPolicy::RoundRobin).unwrap();
        register(&table, 2, "com.work", MatchPolicy::Exact, InvocationPolicy::RoundRobin).unwrap();
        let err =
            register(&table, 3, "com.work", MatchPolicy::Exact, InvocationPolicy::Random).unwrap_err();
        assert!(matches!(err, CoreError::ProcedureAlreadyExists { .. }));
        let err =
            register(&table, 3, "com.work", MatchPolicy::Exact, InvocationPolicy::Single).unwrap_err();
        assert!(matches!(err, CoreError::ProcedureAlreadyExists { .. }));
        assert_eq!(table.lookup("com.work").unwrap().len(), 2);
    }

    #[test]
    fn test_round_robin_visits_each_in_order() {
        let table = table();
        let ids: Vec<u64> = (1..=3)
            .map(|s| {
                register(&table, s, "com.rr", MatchPolicy::Exact, InvocationPolicy::RoundRobin)
                    .unwrap()
                    .id
            })
            .collect();
        let entry = table.lookup("com.rr").unwrap();
        let picked: Vec<u64> = (0..6).map(|_| table.select(&entry).unwrap().id).collect();
        assert_eq!(&picked[..3], &ids[..]);
        assert_eq!(&picked[3..], &ids[..]);
    }

    #[test]
    fn test_round_robin_cursor_survives_removal() {
        let table = table();
        let ids: Vec<u64> = (1..=3)
            .map(|s| {
                register(&table, s, "com.rr", MatchPolicy::Exact, InvocationPolicy::RoundRobin)
                    .unwrap()
                    .id
            })
            .collect();
        let entry = table.lookup("com.rr").unwrap();
        assert_eq!(table.select(&entry).unwrap().id, ids[0]);
        assert_eq!(table.select(&entry).unwrap().id, ids[1]);
        table.unregister(ids[0]).unwrap();
        assert_eq!(table.select(&entry).unwrap().id, ids[2]);
        assert_eq!(table.select(&entry).unwrap().id, ids[1]);
    }

    #[test]
    fn test_first_last_random() {
        let table = table();
        for policy in [InvocationPolicy::First, InvocationPolicy::Last, InvocationPolicy::Random] {
            let uri = format!("com.{policy}");
            let a = register(&table, 1, &uri, MatchPolicy::Exact, policy).unwrap().id;
            let b = register(&table, 2, &uri, MatchPolicy::Exact, policy).unwrap().id;
            let entry = table.lookup(&uri).unwrap();
            let picked = table.select(&entry).unwrap().id;
            match policy {
                InvocationPolicy::First => assert_eq!(picked, a),
                InvocationPolicy::Last => assert_eq!(picked, b),
                _ => assert!(picked == a || picked == b),
            }
        }
    }

    #[test]
    fn test_lookup_priority_and_narrowest_match() {
        let table = table();
        register(&table, 1, "com.app.", MatchPolicy::Prefix, InvocationPolicy::Single).unwrap();
        register(&table, 1, "com.app.user.", MatchPolicy::Prefix, InvocationPolicy::Single).unwrap();
        register(&table, 1, "com..get", MatchPolicy::Wildcard, InvocationPolicy::Single).unwrap();
        register(&table, 1, "..get", MatchPolicy::Wildcard, InvocationPolicy::Single).unwrap();
        register(&table, 1, "com.app.user.get", MatchPolicy::Exact, InvocationPolicy::Single).unwrap();

        let hit = table.lookup("com.app.user.get").unwrap();
        assert_eq!(hit.match_policy, MatchPolicy::Exact);

        let hit = table.lookup("com.app.user.put").unwrap();
        assert_eq!(hit.uri, "com.app.user.");

        let hit = table.lookup("com.app.ping").unwrap();
        assert_eq!(hit.uri, "com.app.");

        let hit = table.lookup("com.other.get").unwrap();
        assert_eq!(hit.uri, "com..get");

        let hit = table.lookup("org.other.get").unwrap();
        assert_eq!(hit.uri, "..get");

        assert!(table.lookup("org.other.put").is_none());
    }

    #[test]
    fn test_unregister_last_removes_entry() {
        let table = table();
        let p = register(&table, 1, "com.echo", MatchPolicy::Exact, InvocationPolicy::Single).unwrap();
        let entry_id = p.entry().id;
        assert!(table.entry(entry_id).is_some());

        table.unregister(p.id).unwrap();
        assert!(table.lookup("com.echo").is_none());
        assert!(table.entry(entry_id).is_none());
        assert!(matches!(
            table.unregister(p.id),
            Err(CoreError::NoSuchRegistration { .. })
        ));

        // Name is free again.
        register(&table, 2, "com.echo", MatchPolicy::Exact, InvocationPolicy::Single).unwrap();
    }

    #[test]
    fn test_close_session() {
        let table = table();
        register(&table, 1, "com.a", MatchPolicy::Exact, InvocationPolicy::Single).unwrap();
        register(&table, 1, "com.b", MatchPolicy::Exact, InvocationPolicy::First).unwrap();
        register(&table, 2, "com.b", MatchPolicy::Exact, InvocationPolicy::First).unwrap();

        assert_eq!(table.close_session(1).len(), 2);
        assert!(table.lookup("com.a").is_none());
        let b = table.lookup("com.b").unwrap();
        assert_eq!(table.members(&b).len(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_events() {
        let sink = Arc::new(RecordingSink::default());
        let table = RegistrationTable::new(sink.clone());

        let a = register(&table, 1, "com.x", MatchPolicy::Exact, InvocationPolicy::Last).unwrap();
        let b = register(&table, 2, "com.x", MatchPolicy::Exact, InvocationPolicy::Last).unwrap();
        table.unregister(a.id).unwrap();
        table.unregister(b.id).unwrap();

        let kinds: Vec<RegistrationEventKind> = sink.0.lock().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RegistrationEventKind::Create,
                RegistrationEventKind::Register,
                RegistrationEventKind::Register,
                RegistrationEventKind::Unregister,
                RegistrationEventKind::Unregister,
                RegistrationEventKind::Delete,
            ]
        );
        let events = sink.0.lock();
        assert_eq!(events[0].details.as_ref().unwrap().uri, "com.x");
        assert!(events.iter().all(|e| e.registration == a.entry().id));
    }

    #[test]
    fn test_resolve_meta() {
        let table = table();
        assert!(matches!(
            table.resolve("wamp.registration.list", true),
            Some(Target::Local(MetaProcedure::List))
        ));
        assert!(table.resolve("wamp.registration.list", false).is_none());
    }

    #[test]
    fn test_id_allocator_skips_live_and_wraps() {
        let ids = IdAllocator::new();
        assert_eq!(ids.allocate(|id| id == 1), 2);

        ids.next.store(MAX_ID, Ordering::Relaxed);
        assert_eq!(ids.allocate(|_| false), MAX_ID);
        assert_eq!(ids.allocate(|_| false), 1);
    }

    #[test]
    fn test_stats_handle_attached() {
        let stats = Arc::new(DealerStats::new());
        let table = RegistrationTable::new(Arc::new(NullSink)).with_stats(stats.clone());
        let p = register(&table, 1, "com.s", MatchPolicy::Exact, InvocationPolicy::Single).unwrap();
        p.stats.as_ref().unwrap().record_attempt();
        assert_eq!(stats.snapshot("com.s").unwrap().attempted, 1);
    }

    proptest! {
        #[test]
        fn prop_round_robin_visits_each_once_per_cycle(members in 1u64..8, cycles in 1usize..4) {
            let table = table();
            let ids: Vec<u64> = (0..members)
                .map(|s| {
                    register(&table, s + 1, "com.rr", MatchPolicy::Exact, InvocationPolicy::RoundRobin)
                        .unwrap()
                        .id
                })
                .collect();
            let entry = table.lookup("com.rr").unwrap();
            for _ in 0..cycles {
                let picked: Vec<u64> = ids.iter().map(|_| table.select(&entry).unwrap().id).collect();
                prop_assert_eq!(&picked, &ids);
            }
        }
    }
}
