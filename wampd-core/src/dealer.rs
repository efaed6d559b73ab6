//! The RPC dealer.
//!
//! Consumes REGISTER, UNREGISTER, CALL, CANCEL, YIELD and ERROR from
//! sessions, drives the [`RegistrationTable`] and [`Call`] state, and sends
//! replies through each session's [`Peer`] handle. Every operation runs to
//! completion on the calling thread; nothing here blocks or waits.
//!
//! In-flight calls are indexed twice:
//! - by callee session and invocation id, for YIELD/ERROR/timeouts
//! - by caller session and request id, for CANCEL, when the caller
//!   announced `call_canceling`

use crate::call::{
    Call, CallOptions, Invocation, TargetState, CALLEE_LOST_REASON, CALLER_LOST_REASON,
    TIMEOUT_REASON,
};
use crate::error::CoreError;
use crate::peer::{features, MetaEventSink, Peer};
use crate::stats::{CallStats, DealerStats};
use crate::table::{Procedure, RegistrationTable, Target};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use wampd_protocol::options::{flag, keys, parse_option};
use wampd_protocol::uri::{is_reserved, is_valid_procedure};
use wampd_protocol::{
    CancelMode, Dict, ErrorUri, InvocationPolicy, MatchPolicy, Message, MessageRegistry,
    MessageType, Payload, Role, RpcMessage,
};

/// Dealer behavior switches.
#[derive(Debug, Clone)]
pub struct DealerOptions {
    /// Mode used when CANCEL carries no `mode` option.
    pub default_cancel_mode: CancelMode,
    /// Fan a progressive call out to every callee of a shared registration.
    pub fan_out: bool,
    /// Honor `disclose_me` by passing the caller's session id to callees.
    pub disclose_caller: bool,
    /// Answer `wamp.registration.*` locally.
    pub meta_api: bool,
}

impl Default for DealerOptions {
    fn default() -> Self {
        Self {
            default_cancel_mode: CancelMode::KillNoWait,
            fan_out: true,
            disclose_caller: true,
            meta_api: true,
        }
    }
}

type Tracked = (Arc<Call>, usize);

/// The dealer.
pub struct Dealer {
    registry: Arc<MessageRegistry>,
    table: RegistrationTable,
    stats: Arc<DealerStats>,
    options: DealerOptions,
    /// Callee session -> invocation id -> (call, target index).
    invocations: DashMap<u64, Mutex<HashMap<u64, Tracked>>>,
    /// Caller session -> request id -> call.
    calls: DashMap<u64, Mutex<HashMap<u64, Arc<Call>>>>,
}

fn reason(reason: &str) -> Dict {
    let mut details = Dict::new();
    details.insert(keys::REASON.to_string(), reason.into());
    details
}

impl Dealer {
    pub fn new(registry: Arc<MessageRegistry>, events: Arc<dyn MetaEventSink>) -> Self {
        let stats = Arc::new(DealerStats::new());
        Self {
            registry,
            table: RegistrationTable::new(events).with_stats(Arc::clone(&stats)),
            stats,
            options: DealerOptions::default(),
            invocations: DashMap::new(),
            calls: DashMap::new(),
        }
    }

    pub fn with_options(mut self, options: DealerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &Arc<MessageRegistry> {
        &self.registry
    }

    pub fn table(&self) -> &RegistrationTable {
        &self.table
    }

    pub fn stats(&self) -> &Arc<DealerStats> {
        &self.stats
    }

    pub fn options(&self) -> &DealerOptions {
        &self.options
    }

    /// Features announced under the `dealer` role in WELCOME.
    pub fn features(&self) -> Dict {
        features::DEALER
            .into_iter()
            .filter(|f| self.options.meta_api || *f != features::REGISTRATION_META_API)
            .map(|f| (f.to_string(), Value::Bool(true)))
            .collect()
    }

    /// Number of invocations awaiting a reply from a callee.
    pub fn pending_invocations(&self) -> usize {
        self.invocations.iter().map(|m| m.lock().len()).sum()
    }

    /// Handles one validated message from `session`.
    ///
    /// Application failures are answered with ERROR messages and do not
    /// surface here. An `Err` means the peer sent something a client must
    /// never send.
    pub fn handle(&self, session: &Arc<dyn Peer>, message: Message) -> Result<(), CoreError> {
        match RpcMessage::try_from(message)? {
            RpcMessage::Register {
                request,
                options,
                procedure,
            } => self.register(session, request, options, &procedure),
            RpcMessage::Unregister {
                request,
                registration,
            } => self.unregister(session.as_ref(), request, registration),
            RpcMessage::Call {
                request,
                options,
                procedure,
                payload,
            } => self.call(session, request, &options, &procedure, payload),
            RpcMessage::Cancel { request, options } => {
                self.cancel(session.as_ref(), request, &options)
            }
            RpcMessage::Yield {
                request,
                options,
                payload,
            } => self.yield_result(session.session_id(), request, &options, payload),
            RpcMessage::Error {
                request_type: MessageType::Invocation,
                request,
                details,
                error,
                payload,
            } => self.invocation_error(session.session_id(), request, details, error, payload),
            RpcMessage::Error { request_type, .. } => {
                tracing::warn!(
                    "Ignoring ERROR for {} from session {}",
                    request_type,
                    session.session_id()
                );
            }
            other => {
                return Err(CoreError::UnexpectedMessage { kind: other.kind() });
            }
        }
        Ok(())
    }

    fn send(&self, peer: &dyn Peer, rpc: RpcMessage) {
        let kind = rpc.kind();
        match rpc.into_message(&self.registry) {
            Ok(message) => peer.send(message),
            Err(e) => tracing::error!(
                "Dropping malformed {} to session {}: {}",
                kind,
                peer.session_id(),
                e
            ),
        }
    }

    fn send_error(
        &self,
        peer: &dyn Peer,
        request_type: MessageType,
        request: u64,
        details: Dict,
        error: impl Into<String>,
        payload: Payload,
    ) {
        self.send(
            peer,
            RpcMessage::Error {
                request_type,
                request,
                details,
                error: error.into(),
                payload,
            },
        );
    }

    fn reply_error(&self, peer: &dyn Peer, request_type: MessageType, request: u64, err: &CoreError) {
        tracing::debug!(
            "{} {} from session {} failed: {}",
            request_type,
            request,
            peer.session_id(),
            err
        );
        self.send_error(
            peer,
            request_type,
            request,
            Dict::new(),
            err.error_uri().as_str(),
            Payload::args(vec![Value::String(err.to_string())]),
        );
    }

    // --- registration ---

    fn register(&self, session: &Arc<dyn Peer>, request: u64, options: Dict, uri: &str) {
        match self.try_register(session, options, uri) {
            Ok(procedure) => self.send(
                session.as_ref(),
                RpcMessage::Registered {
                    request,
                    registration: procedure.id,
                },
            ),
            Err(e) => self.reply_error(session.as_ref(), MessageType::Register, request, &e),
        }
    }

    fn try_register(
        &self,
        session: &Arc<dyn Peer>,
        options: Dict,
        uri: &str,
    ) -> Result<Arc<Procedure>, CoreError> {
        let match_policy: MatchPolicy = parse_option(&options, keys::MATCH)?.unwrap_or_default();
        let invoke: InvocationPolicy = parse_option(&options, keys::INVOKE)?.unwrap_or_default();
        if !is_valid_procedure(uri, match_policy) || is_reserved(uri) {
            return Err(CoreError::InvalidUri {
                uri: uri.to_string(),
            });
        }
        self.table
            .register(Arc::clone(session), uri, match_policy, invoke, options)
    }

    fn unregister(&self, session: &dyn Peer, request: u64, registration: u64) {
        let owned = self
            .table
            .procedure(registration)
            .is_some_and(|p| p.session_id() == session.session_id());
        let result = if owned {
            self.table.unregister(registration).map(|_| ())
        } else {
            Err(CoreError::NoSuchRegistration { registration })
        };
        match result {
            Ok(()) => self.send(
                session,
                RpcMessage::Unregistered {
                    request,
                    details: None,
                },
            ),
            Err(e) => self.reply_error(session, MessageType::Unregister, request, &e),
        }
    }

    // --- calls ---

    fn call(&self, caller: &Arc<dyn Peer>, request: u64, options: &Dict, uri: &str, payload: Payload) {
        if let Err(e) = self.try_call(caller, request, options, uri, payload) {
            if matches!(e, CoreError::NoSuchProcedure { .. }) {
                self.stats.record_not_found(uri);
            }
            self.reply_error(caller.as_ref(), MessageType::Call, request, &e);
        }
    }

    fn call_options(&self, caller: &dyn Peer, options: &Dict) -> Result<CallOptions, CoreError> {
        let timeout = match options.get(keys::TIMEOUT) {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(0) => None,
                Some(ms) => Some(Duration::from_millis(ms)),
                None => {
                    return Err(CoreError::InvalidArgument {
                        reason: format!("timeout must be a non-negative integer, got {value}"),
                    })
                }
            },
        };
        Ok(CallOptions {
            receive_progress: flag(options, keys::RECEIVE_PROGRESS)
                && caller.supports(Role::Caller, features::PROGRESSIVE_CALL_RESULTS),
            timeout,
            disclose_me: flag(options, keys::DISCLOSE_ME),
        })
    }

    fn try_call(
        &self,
        caller: &Arc<dyn Peer>,
        request: u64,
        options: &Dict,
        uri: &str,
        payload: Payload,
    ) -> Result<(), CoreError> {
        if !is_valid_procedure(uri, MatchPolicy::Exact) {
            return Err(CoreError::InvalidUri {
                uri: uri.to_string(),
            });
        }
        let call_options = self.call_options(caller.as_ref(), options)?;

        match self.table.resolve(uri, self.options.meta_api) {
            None => Err(CoreError::NoSuchProcedure {
                uri: uri.to_string(),
            }),
            Some(Target::Local(meta)) => {
                let args = payload.args.as_deref().unwrap_or_default();
                let result = meta.invoke(&self.table, args)?;
                self.send(
                    caller.as_ref(),
                    RpcMessage::Result {
                        request,
                        details: Dict::new(),
                        payload: result,
                    },
                );
                Ok(())
            }
            Some(Target::Remote(entry)) => {
                let procedures = if self.options.fan_out
                    && entry.invoke.is_shared()
                    && call_options.receive_progress
                {
                    self.table.members(&entry)
                } else {
                    self.table.select(&entry).into_iter().collect()
                };
                if procedures.is_empty() {
                    return Err(CoreError::NoSuchProcedure {
                        uri: uri.to_string(),
                    });
                }
                self.invoke(caller, request, uri, call_options, procedures, payload);
                Ok(())
            }
        }
    }

    fn invoke(
        &self,
        caller: &Arc<dyn Peer>,
        request: u64,
        uri: &str,
        options: CallOptions,
        procedures: Vec<Arc<Procedure>>,
        payload: Payload,
    ) {
        let receive_progress = options.receive_progress;
        let targets = procedures
            .into_iter()
            .map(|procedure| {
                let progressive = receive_progress
                    && procedure
                        .session
                        .supports(Role::Callee, features::PROGRESSIVE_CALL_RESULTS);
                let id = procedure.session.next_request_id();
                Invocation::new(procedure, id, progressive)
            })
            .collect();
        let call = Arc::new(Call::new(Arc::clone(caller), request, uri, options, targets));

        // Track before sending so that a fast reply always finds the call.
        if caller.supports(Role::Caller, features::CALL_CANCELING) {
            self.calls
                .entry(caller.session_id())
                .or_default()
                .lock()
                .insert(request, Arc::clone(&call));
        }
        for (index, target) in call.targets().iter().enumerate() {
            self.invocations
                .entry(target.callee())
                .or_default()
                .lock()
                .insert(target.id, (Arc::clone(&call), index));
        }

        if let Some(stats) = stats_of(&call) {
            stats.record_attempt();
        }
        for target in call.targets() {
            tracing::debug!(
                "CALL {} {} from session {} -> INVOCATION {} on session {}",
                uri,
                request,
                caller.session_id(),
                target.id,
                target.callee()
            );
            if let Some(stats) = &target.procedure.stats {
                stats.record_invoked();
            }
            self.send(
                target.procedure.session.as_ref(),
                RpcMessage::Invocation {
                    request: target.id,
                    registration: target.procedure.id,
                    details: self.invocation_details(&call, target),
                    payload: payload.clone(),
                },
            );
        }
    }

    fn invocation_details(&self, call: &Call, target: &Invocation) -> Dict {
        let mut details = Dict::new();
        if target.procedure.entry().match_policy != MatchPolicy::Exact {
            details.insert(keys::PROCEDURE.to_string(), call.procedure.clone().into());
        }
        if target.progressive {
            details.insert(keys::RECEIVE_PROGRESS.to_string(), true.into());
        }
        if let Some(timeout) = call.options.timeout {
            if target
                .procedure
                .session
                .supports(Role::Callee, features::CALL_TIMEOUT)
            {
                details.insert(keys::TIMEOUT.to_string(), (timeout.as_millis() as u64).into());
            }
        }
        if call.options.disclose_me && self.options.disclose_caller {
            details.insert(keys::CALLER.to_string(), call.caller_id().into());
        }
        details
    }

    // --- replies from callees ---

    fn tracked(&self, callee: u64, invocation: u64) -> Option<Tracked> {
        self.invocations
            .get(&callee)
            .and_then(|m| m.lock().get(&invocation).cloned())
    }

    fn untrack(&self, callee: u64, invocation: u64) -> Option<Tracked> {
        self.invocations
            .get(&callee)
            .and_then(|m| m.lock().remove(&invocation))
    }

    fn forget_call(&self, call: &Call) {
        if let Some(calls) = self.calls.get(&call.caller_id()) {
            let mut calls = calls.lock();
            if calls
                .get(&call.request)
                .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), call))
            {
                calls.remove(&call.request);
            }
        }
    }

    fn yield_result(&self, callee: u64, invocation: u64, options: &Dict, payload: Payload) {
        let progress = flag(options, keys::PROGRESS);
        let tracked = if progress {
            self.tracked(callee, invocation)
        } else {
            self.untrack(callee, invocation)
        };
        let Some((call, index)) = tracked else {
            tracing::debug!(
                "Ignoring YIELD for unknown invocation {} from session {}",
                invocation,
                callee
            );
            return;
        };
        let Some(target) = call.target(index) else {
            return;
        };

        if progress {
            if !target.progressive
                || target.state().is_finished()
                || !call.forward_progress(|| self.send_progress(&call, payload))
            {
                tracing::debug!("Dropping progress YIELD {} from session {}", invocation, callee);
            }
            return;
        }

        let Some(remaining) = call.finish_target(index, TargetState::Resulted) else {
            return;
        };
        if let Some(stats) = &target.procedure.stats {
            stats.record_completed(call.elapsed());
        }

        if remaining > 0 {
            // Fanned-out call: intermediate final results stream as progress.
            call.forward_progress(|| self.send_progress(&call, payload));
            return;
        }

        let answered = call.complete_with(|| {
            self.send(
                call.caller.as_ref(),
                RpcMessage::Result {
                    request: call.request,
                    details: Dict::new(),
                    payload,
                },
            )
        });
        if answered {
            self.forget_call(&call);
        }
    }

    fn send_progress(&self, call: &Call, payload: Payload) {
        let mut details = Dict::new();
        details.insert(keys::PROGRESS.to_string(), true.into());
        self.send(
            call.caller.as_ref(),
            RpcMessage::Result {
                request: call.request,
                details,
                payload,
            },
        );
    }

    fn invocation_error(
        &self,
        callee: u64,
        invocation: u64,
        details: Dict,
        error: String,
        payload: Payload,
    ) {
        let Some((call, index)) = self.untrack(callee, invocation) else {
            tracing::debug!(
                "Ignoring ERROR for unknown invocation {} from session {}",
                invocation,
                callee
            );
            return;
        };
        if call.finish_target(index, TargetState::Errored).is_none() {
            return;
        }
        if let Some(stats) = call.target(index).and_then(|t| t.procedure.stats.as_ref()) {
            stats.record_errored();
        }

        let answered = call.complete_with(|| {
            self.send_error(
                call.caller.as_ref(),
                MessageType::Call,
                call.request,
                details,
                error,
                payload,
            )
        });
        if !answered {
            return;
        }
        self.forget_call(&call);
        if call.cancel_mode() != Some(CancelMode::Kill) {
            self.interrupt(&call, CancelMode::KillNoWait, CancelMode::KillNoWait.reason(), true);
        }
    }

    /// Sends INTERRUPT to every still-active target of `call`. With
    /// `release`, their tracking is dropped and late replies are ignored.
    fn interrupt(&self, call: &Call, mode: CancelMode, reason: &str, release: bool) {
        for (index, target) in call.targets().iter().enumerate() {
            if !call.interrupt_target(index) {
                continue;
            }
            if release {
                self.untrack(target.callee(), target.id);
            }
            let mut options = Dict::new();
            options.insert(keys::MODE.to_string(), mode.as_str().into());
            options.insert(keys::REASON.to_string(), reason.into());
            self.send(
                target.procedure.session.as_ref(),
                RpcMessage::Interrupt {
                    request: target.id,
                    options,
                },
            );
        }
    }

    // --- cancellation ---

    fn cancel(&self, caller: &dyn Peer, request: u64, options: &Dict) {
        let mode = match parse_option::<CancelMode>(options, keys::MODE) {
            Ok(mode) => mode.unwrap_or(self.options.default_cancel_mode),
            Err(e) => {
                self.reply_error(caller, MessageType::Cancel, request, &CoreError::from(e));
                return;
            }
        };
        let call = self
            .calls
            .get(&caller.session_id())
            .and_then(|m| m.lock().get(&request).cloned())
            .filter(|c| !c.is_completed());
        let Some(call) = call else {
            self.reply_error(
                caller,
                MessageType::Cancel,
                request,
                &CoreError::NoSuchCall { request },
            );
            return;
        };

        tracing::debug!(
            "CANCEL {} ({}) from session {}",
            request,
            mode,
            caller.session_id()
        );
        let canceled = match mode {
            CancelMode::Kill => {
                let won = call.begin_cancel(mode);
                if won {
                    self.interrupt(&call, mode, mode.reason(), false);
                }
                won
            }
            CancelMode::Skip | CancelMode::KillNoWait => {
                let won = call.complete_with(|| {
                    call.set_cancel_mode(mode);
                    self.send_error(
                        caller,
                        MessageType::Call,
                        request,
                        reason(mode.reason()),
                        ErrorUri::Canceled.as_str(),
                        Payload::empty(),
                    )
                });
                if won {
                    self.forget_call(&call);
                    if mode == CancelMode::KillNoWait {
                        self.interrupt(&call, mode, mode.reason(), true);
                    }
                }
                won
            }
        };
        if canceled {
            if let Some(stats) = stats_of(&call) {
                stats.record_canceled();
            }
        }
    }

    // --- timeouts ---

    /// Applies the dealer-side timeout to overdue calls invoked on `session_id`.
    pub fn check_timeout(&self, session_id: u64) -> usize {
        self.check_timeout_at(session_id, Instant::now())
    }

    /// Like [`check_timeout`](Self::check_timeout) with an explicit clock.
    pub fn check_timeout_at(&self, session_id: u64, now: Instant) -> usize {
        let overdue: Vec<Arc<Call>> = match self.invocations.get(&session_id) {
            Some(tracked) => tracked
                .lock()
                .values()
                .filter(|(call, _)| !call.is_completed() && call.is_overdue(now))
                .map(|(call, _)| Arc::clone(call))
                .collect(),
            None => return 0,
        };
        overdue.iter().filter(|call| self.expire(call)).count()
    }

    /// Sweeps every session. Returns the number of calls timed out.
    pub fn check_timeouts(&self) -> usize {
        let now = Instant::now();
        let sessions: Vec<u64> = self.invocations.iter().map(|e| *e.key()).collect();
        sessions
            .into_iter()
            .map(|session| self.check_timeout_at(session, now))
            .sum()
    }

    fn expire(&self, call: &Call) -> bool {
        // Callees that enforce timeouts themselves are left to do so.
        let mut active = call.active_targets().peekable();
        if active.peek().is_none()
            || active.all(|t| t.procedure.session.supports(Role::Callee, features::CALL_TIMEOUT))
        {
            return false;
        }
        let answered = call.complete_with(|| {
            self.send_error(
                call.caller.as_ref(),
                MessageType::Call,
                call.request,
                reason(TIMEOUT_REASON),
                ErrorUri::Timeout.as_str(),
                Payload::empty(),
            )
        });
        if !answered {
            return false;
        }

        tracing::debug!(
            "CALL {} from session {} timed out after {:?}",
            call.request,
            call.caller_id(),
            call.elapsed()
        );
        if let Some(stats) = stats_of(call) {
            stats.record_canceled();
        }
        self.forget_call(call);
        self.interrupt(call, CancelMode::KillNoWait, TIMEOUT_REASON, true);
        true
    }

    // --- session teardown ---

    /// Removes every registration and call of a closing session.
    pub fn close_session(&self, session_id: u64) {
        let registrations = self.table.close_session(session_id);

        // Calls this session was serving.
        let mut lost = 0;
        if let Some((_, tracked)) = self.invocations.remove(&session_id) {
            for (_, (call, index)) in tracked.into_inner() {
                lost += 1;
                if call.finish_target(index, TargetState::Errored) != Some(0) {
                    continue;
                }
                let answered = call.complete_with(|| {
                    self.send_error(
                        call.caller.as_ref(),
                        MessageType::Call,
                        call.request,
                        reason(CALLEE_LOST_REASON),
                        ErrorUri::Canceled.as_str(),
                        Payload::empty(),
                    )
                });
                if answered {
                    self.forget_call(&call);
                }
            }
        }

        // Calls this session made.
        self.calls.remove(&session_id);
        let orphaned: Vec<Arc<Call>> = self
            .invocations
            .iter()
            .flat_map(|tracked| {
                tracked
                    .lock()
                    .values()
                    .filter(|(call, _)| call.caller_id() == session_id)
                    .map(|(call, _)| Arc::clone(call))
                    .collect::<Vec<_>>()
            })
            .collect();
        for call in &orphaned {
            if call.complete() {
                self.interrupt(call, CancelMode::KillNoWait, CALLER_LOST_REASON, true);
            }
        }

        tracing::debug!(
            "Session {} cleaned up: {} registrations, {} invocations, {} orphaned calls",
            session_id,
            registrations.len(),
            lost,
            orphaned.len()
        );
    }
}

fn stats_of(call: &Call) -> Option<&Arc<CallStats>> {
    call.targets()
        .first()
        .and_then(|t| t.procedure.stats.as_ref())
}
