//! In-flight call bookkeeping.
//!
//! A [`Call`] is one CALL from a caller, fanned out to one or more target
//! procedures. Both the call and each target carry an atomic state that is
//! only advanced by compare-and-swap, so concurrent YIELD, ERROR, CANCEL and
//! timeout handling agree on a single winner without holding a lock.
//!
//! ```text
//! call:    Pending ──cancel(kill)──▶ Canceling
//!             │                          │
//!             └────────▶ Completed ◀─────┘
//!
//! target:  Active ──▶ Interrupted
//!            │             │
//!            └──▶ Resulted / Errored ◀──┘
//! ```

use crate::peer::Peer;
use crate::table::Procedure;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use wampd_protocol::CancelMode;

/// INTERRUPT reason when the dealer gives up on an overdue call.
pub const TIMEOUT_REASON: &str = "call.timeout";

/// ERROR reason when every callee of a call disconnected.
pub const CALLEE_LOST_REASON: &str = "callee.lost";

/// INTERRUPT reason when the caller disconnected.
pub const CALLER_LOST_REASON: &str = "caller.lost";

/// Overall call state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallState {
    Pending = 0,
    Canceling = 1,
    Completed = 2,
}

impl CallState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CallState::Pending,
            1 => CallState::Canceling,
            _ => CallState::Completed,
        }
    }
}

/// Per-target state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TargetState {
    Active = 0,
    Interrupted = 1,
    Resulted = 2,
    Errored = 3,
}

impl TargetState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TargetState::Active,
            1 => TargetState::Interrupted,
            2 => TargetState::Resulted,
            _ => TargetState::Errored,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TargetState::Resulted | TargetState::Errored)
    }
}

/// One target of a call.
#[derive(Debug)]
pub struct Invocation {
    pub procedure: Arc<Procedure>,
    /// Request id of the INVOCATION, unique within the callee session.
    pub id: u64,
    /// Whether progress YIELDs from this target are forwarded.
    pub progressive: bool,
    state: AtomicU8,
}

impl Invocation {
    pub fn new(procedure: Arc<Procedure>, id: u64, progressive: bool) -> Self {
        Self {
            procedure,
            id,
            progressive,
            state: AtomicU8::new(TargetState::Active as u8),
        }
    }

    pub fn state(&self) -> TargetState {
        TargetState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn callee(&self) -> u64 {
        self.procedure.session_id()
    }
}

/// Options of a call fixed at CALL time.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub receive_progress: bool,
    pub timeout: Option<Duration>,
    pub disclose_me: bool,
}

const NO_CANCEL: u8 = u8::MAX;

/// One in-flight call.
pub struct Call {
    pub caller: Arc<dyn Peer>,
    pub request: u64,
    pub procedure: String,
    pub options: CallOptions,
    pub started: Instant,
    pub deadline: Option<Instant>,
    targets: Vec<Invocation>,
    state: AtomicU8,
    cancel_mode: AtomicU8,
    remaining: AtomicUsize,
    // Held while anything is sent to the caller.
    reply: Mutex<()>,
}

impl Call {
    pub fn new(
        caller: Arc<dyn Peer>,
        request: u64,
        procedure: impl Into<String>,
        options: CallOptions,
        targets: Vec<Invocation>,
    ) -> Self {
        let started = Instant::now();
        Self {
            caller,
            request,
            procedure: procedure.into(),
            deadline: options.timeout.map(|t| started + t),
            options,
            started,
            remaining: AtomicUsize::new(targets.len()),
            targets,
            state: AtomicU8::new(CallState::Pending as u8),
            cancel_mode: AtomicU8::new(NO_CANCEL),
            reply: Mutex::new(()),
        }
    }

    pub fn caller_id(&self) -> u64 {
        self.caller.session_id()
    }

    pub fn state(&self) -> CallState {
        CallState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_completed(&self) -> bool {
        self.state() == CallState::Completed
    }

    pub fn targets(&self) -> &[Invocation] {
        &self.targets
    }

    pub fn target(&self, index: usize) -> Option<&Invocation> {
        self.targets.get(index)
    }

    /// Targets that have not replied and were not interrupted.
    pub fn active_targets(&self) -> impl Iterator<Item = &Invocation> {
        self.targets
            .iter()
            .filter(|t| t.state() == TargetState::Active)
    }

    /// Number of targets that have not yet sent a final reply.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn cancel_mode(&self) -> Option<CancelMode> {
        match self.cancel_mode.load(Ordering::Acquire) {
            0 => Some(CancelMode::Skip),
            1 => Some(CancelMode::Kill),
            2 => Some(CancelMode::KillNoWait),
            _ => None,
        }
    }

    /// Moves `Pending` to `Canceling` for a kill-mode cancel. Returns false
    /// if the call is already canceling or completed.
    pub fn begin_cancel(&self, mode: CancelMode) -> bool {
        let won = self
            .state
            .compare_exchange(
                CallState::Pending as u8,
                CallState::Canceling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if won {
            self.set_cancel_mode(mode);
        }
        won
    }

    /// Records the cancel mode without changing the call state.
    pub fn set_cancel_mode(&self, mode: CancelMode) {
        let code = match mode {
            CancelMode::Skip => 0,
            CancelMode::Kill => 1,
            CancelMode::KillNoWait => 2,
        };
        self.cancel_mode.store(code, Ordering::Release);
    }

    /// Moves the call to `Completed`. Exactly one caller ever gets `true`;
    /// only that caller may send the terminal reply.
    pub fn complete(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current == CallState::Completed as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                CallState::Completed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Runs `send` while the call is still open. The check and the send
    /// happen under the reply lock, so no terminal reply can slip between
    /// them. Returns false if the call was already completed.
    pub fn forward_progress(&self, send: impl FnOnce()) -> bool {
        let _reply = self.reply.lock();
        if self.is_completed() {
            return false;
        }
        send();
        true
    }

    /// Completes the call and, if this caller won, runs `send` before any
    /// concurrent [`Call::forward_progress`] can observe the call again.
    pub fn complete_with(&self, send: impl FnOnce()) -> bool {
        let _reply = self.reply.lock();
        if !self.complete() {
            return false;
        }
        send();
        true
    }

    /// Marks an active target interrupted. Returns false if it already
    /// replied or was interrupted before.
    pub fn interrupt_target(&self, index: usize) -> bool {
        self.targets.get(index).is_some_and(|t| {
            t.state
                .compare_exchange(
                    TargetState::Active as u8,
                    TargetState::Interrupted as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        })
    }

    /// Records the final reply of a target. Returns the number of targets
    /// still outstanding afterwards, or `None` if the target had already
    /// finished.
    pub fn finish_target(&self, index: usize, outcome: TargetState) -> Option<usize> {
        debug_assert!(outcome.is_finished());
        let target = self.targets.get(index)?;
        let mut current = target.state.load(Ordering::Acquire);
        loop {
            if TargetState::from_u8(current).is_finished() {
                return None;
            }
            match target.state.compare_exchange_weak(
                current,
                outcome as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Some(self.remaining.fetch_sub(1, Ordering::AcqRel) - 1)
    }

    pub fn is_overdue(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("caller", &self.caller.session_id())
            .field("request", &self.request)
            .field("procedure", &self.procedure)
            .field("state", &self.state())
            .field("targets", &self.targets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::NullSink;
    use crate::table::RegistrationTable;
    use std::thread;
    use wampd_protocol::{Dict, InvocationPolicy, MatchPolicy, Message, Role};

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

    fn call_with_targets(n: u64, timeout: Option<Duration>) -> Call {
        let table = RegistrationTable::new(Arc::new(NullSink));
        let targets = (0..n)
            .map(|i| {
                let procedure = table
                    .register(
                        Arc::new(StubPeer(100 + i)),
                        "com.fan",
                        MatchPolicy::Exact,
                        InvocationPolicy::RoundRobin,
                        Dict::new(),
                    )
                    .unwrap();
                Invocation::new(procedure, i + 1, true)
            })
            .collect();
        let options = CallOptions {
            timeout,
            ..Default::default()
        };
        Call::new(Arc::new(StubPeer(1)), 7, "com.fan", options, targets)
    }

    #[test]
    fn test_complete_once() {
        let call = call_with_targets(1, None);
        assert_eq!(call.state(), CallState::Pending);
        assert!(call.complete());
        assert!(!call.complete());
        assert!(call.is_completed());
    }

    #[test]
    fn test_kill_cancel_then_complete() {
        let call = call_with_targets(1, None);
        assert!(call.begin_cancel(CancelMode::Kill));
        assert!(!call.begin_cancel(CancelMode::Kill));
        assert_eq!(call.state(), CallState::Canceling);
        assert_eq!(call.cancel_mode(), Some(CancelMode::Kill));
        assert!(call.complete());
        assert!(!call.begin_cancel(CancelMode::Kill));
    }

    #[test]
    fn test_target_lifecycle() {
        let call = call_with_targets(2, None);
        assert_eq!(call.active_targets().count(), 2);

        assert!(call.interrupt_target(0));
        assert!(!call.interrupt_target(0));
        assert_eq!(call.active_targets().count(), 1);

        // An interrupted target may still reply.
        assert_eq!(call.finish_target(0, TargetState::Errored), Some(1));
        assert_eq!(call.finish_target(0, TargetState::Resulted), None);
        assert!(!call.interrupt_target(0));

        assert_eq!(call.finish_target(1, TargetState::Resulted), Some(0));
        assert_eq!(call.remaining(), 0);
        assert_eq!(call.finish_target(5, TargetState::Resulted), None);
    }

    #[test]
    fn test_deadline() {
        let call = call_with_targets(1, Some(Duration::from_millis(50)));
        let now = Instant::now();
        assert!(!call.is_overdue(call.started));
        assert!(call.is_overdue(now + Duration::from_millis(60)));

        let no_timeout = call_with_targets(1, None);
        assert!(!no_timeout.is_overdue(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_concurrent_complete_has_one_winner() {
        let call = Arc::new(call_with_targets(1, None));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let call = Arc::clone(&call);
                thread::spawn(move || call.complete())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_complete_with_runs_once() {
        let call = call_with_targets(1, None);
        let mut sent = 0;
        assert!(call.forward_progress(|| sent += 1));
        assert!(call.complete_with(|| sent += 10));
        assert!(!call.complete_with(|| sent += 100));
        assert!(!call.forward_progress(|| sent += 1000));
        assert_eq!(sent, 11);
    }

    #[test]
    fn test_no_progress_after_terminal_reply() {
        let call = Arc::new(call_with_targets(1, None));
        let log = Arc::new(Mutex::new(Vec::new()));

        let progress: Vec<_> = (0..4)
            .map(|_| {
                let call = Arc::clone(&call);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for _ in 0..200 {
                        call.forward_progress(|| log.lock().push("progress"));
                    }
                })
            })
            .collect();
        let terminal = {
            let call = Arc::clone(&call);
            let log = Arc::clone(&log);
            thread::spawn(move || call.complete_with(|| log.lock().push("final")))
        };

        assert!(terminal.join().unwrap());
        for handle in progress {
            handle.join().unwrap();
        }
        let log = log.lock();
        assert_eq!(log.iter().filter(|m| **m == "final").count(), 1);
        assert_eq!(log.last(), Some(&"final"));
    }
}
