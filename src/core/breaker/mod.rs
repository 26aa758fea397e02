//! Breaker state machine:
//!
//!                           trip on max_failures-th consecutive failure
//!
//!		+-----------------------------------------------------------------------+
//!		|                                                                       |
//!		|                                                                       v
//!	+----------------+                   +----------------+     Trial       +----------------+
//!	|                |                   |                |<----------------|                |
//!	|                |   Trial succeed   |                |                 |                |
//!	|     Closed     |<------------------|    HalfOpen    |                 |      Open      |
//!	|                |                   |                |   Trial failed  |                |
//!	|                |                   |                +---------------->|                |
//!	+----------------+                   +----------------+                 +----------------+
//!
//! The breaker is a passive guard: it neither sleeps nor polls. Timeout
//! expiry is evaluated lazily against the stored trip timestamp on each call
//! attempt, so no background timer is needed.

pub mod rule;

pub use self::rule::*;

use crate::{logging, utils, CallError};
use std::sync::{Arc, Mutex};

/// States of the breaker state machine.
///
/// `HalfOpen` and `Closed` are derived from the stored flags and the elapsed
/// time; only the open flag and the trip timestamp are stored.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum State {
    Closed,
    HalfOpen,
    Open,
}

impl Default for State {
    fn default() -> State {
        State::Closed
    }
}

/// `StateChangeListener` listens on the breaker state change events.
///
/// Listeners are registered per breaker instance via
/// [`Breaker::with_listeners`]; there is no global registry. The rule is
/// shared as an `Arc` so listeners can tell breakers apart by resource name.
pub trait StateChangeListener: Sync + Send {
    /// Triggered when the breaker closes after a successful trial call.
    fn on_transform_to_closed(&self, prev: State, rule: Arc<Rule>);

    /// Triggered when the breaker opens, either by reaching the failure
    /// threshold or by a failed trial call.
    fn on_transform_to_open(&self, prev: State, rule: Arc<Rule>);

    /// Triggered when the recovery timeout elapsed and a trial call is
    /// admitted.
    fn on_transform_to_half_open(&self, prev: State, rule: Arc<Rule>);
}

/// Outcome of the admission half of the state machine.
enum Admission {
    /// breaker closed, the call passes through
    Pass,
    /// recovery timeout elapsed, admitted as the single trial call
    Trial,
    /// breaker open, the call is rejected outright
    Reject,
}

/// Releases the probe slot if a trial operation unwinds instead of
/// returning, so a panicking trial cannot wedge the breaker open forever.
struct ProbeReset<'a> {
    status: Option<&'a Mutex<Status>>,
}

impl ProbeReset<'_> {
    fn disarm(&mut self) {
        self.status = None;
    }
}

impl Drop for ProbeReset<'_> {
    fn drop(&mut self) {
        if let Some(status) = self.status {
            // must not panic while already unwinding
            if let Ok(mut status) = status.lock() {
                status.probing = false;
            }
        }
    }
}

/// Mutable breaker state. Kept behind a single mutex so that failure
/// accounting and the open/trial decision are atomic with respect to each
/// other when callers race.
#[derive(Debug, Default)]
struct Status {
    /// consecutive failures observed since the last successful call
    failures: u32,
    /// true while calls are rejected or a trial is pending
    open: bool,
    /// true while a trial call is in flight; serializes trial admission
    probing: bool,
    /// the time the breaker may admit a trial call
    next_probe_timestamp_ms: u64,
}

/// `Breaker` guards calls to one unreliable operation.
///
/// One long-lived instance is constructed per protected call site and reused
/// for every invocation. State is purely in-memory; it resets only via
/// process restart.
pub struct Breaker {
    rule: Arc<Rule>,
    status: Mutex<Status>,
    listeners: Vec<Arc<dyn StateChangeListener>>,
}

impl std::fmt::Debug for Breaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Breaker")
            .field("rule", &self.rule)
            .field("status", &self.status)
            .finish()
    }
}

impl Breaker {
    /// Creates a breaker from the given rule. Fails if the rule is invalid.
    pub fn new(rule: Rule) -> crate::Result<Self> {
        Self::with_listeners(rule, Vec::new())
    }

    /// Creates a breaker with state change listeners attached. Listeners are
    /// notified outside the state lock, in registration order.
    pub fn with_listeners(
        rule: Rule,
        listeners: Vec<Arc<dyn StateChangeListener>>,
    ) -> crate::Result<Self> {
        rule.is_valid()?;
        Ok(Self {
            rule: Arc::new(rule),
            status: Mutex::new(Status::default()),
            listeners,
        })
    }

    /// The rule this breaker was built from.
    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    /// Guards one invocation of `op`.
    ///
    /// While the breaker is open the operation is not invoked and the call
    /// fails immediately with [`CallError::Open`]. Otherwise the operation
    /// runs; its result is returned unchanged on success, and its error is
    /// re-surfaced as [`CallError::Inner`] on failure. The breaker never
    /// swallows an underlying failure and never retries on its own.
    ///
    /// A panicking operation unwinds through the breaker untouched; an
    /// unwinding trial call releases its probe slot, so the next caller may
    /// attempt the trial instead.
    pub fn call<T, E, F>(&self, op: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut probe = match self.try_acquire() {
            Admission::Reject => return Err(CallError::Open),
            Admission::Trial => ProbeReset {
                status: Some(&self.status),
            },
            Admission::Pass => ProbeReset { status: None },
        };
        match op() {
            Ok(r) => {
                probe.disarm();
                self.on_success();
                Ok(r)
            }
            Err(e) => {
                probe.disarm();
                self.on_failure();
                Err(CallError::Inner(e))
            }
        }
    }

    /// `is_tripped` reports whether the breaker is actively rejecting calls.
    ///
    /// Once the recovery timeout has elapsed this reports false even though
    /// the breaker has not closed yet, so health checks see a breaker that is
    /// willing to attempt the trial call.
    pub fn is_tripped(&self) -> bool {
        let status = self.status.lock().unwrap();
        status.open && utils::curr_time_millis() < status.next_probe_timestamp_ms
    }

    /// `current_failures` returns the consecutive-failure count. Read-only,
    /// it never resets on read.
    pub fn current_failures(&self) -> u32 {
        self.status.lock().unwrap().failures
    }

    /// `current_state` returns the derived state of the breaker.
    pub fn current_state(&self) -> State {
        let status = self.status.lock().unwrap();
        if !status.open {
            State::Closed
        } else if utils::curr_time_millis() < status.next_probe_timestamp_ms {
            State::Open
        } else {
            State::HalfOpen
        }
    }

    /// `try_acquire` runs the admission half of the state machine: pass when
    /// closed, reject when open, admit a single trial once the timeout
    /// elapsed. First caller wins the trial; racers are rejected until the
    /// trial resolves.
    fn try_acquire(&self) -> Admission {
        let mut status = self.status.lock().unwrap();
        if !status.open {
            return Admission::Pass;
        }
        if status.probing || utils::curr_time_millis() < status.next_probe_timestamp_ms {
            return Admission::Reject;
        }
        status.probing = true;
        drop(status);
        logging::info!(
            "[Breaker] resource {} half-open, admitting a trial call",
            self.rule.resource
        );
        for listener in &self.listeners {
            listener.on_transform_to_half_open(State::Open, Arc::clone(&self.rule));
        }
        Admission::Trial
    }

    fn on_success(&self) {
        let mut status = self.status.lock().unwrap();
        let was_open = status.open;
        status.failures = 0;
        status.open = false;
        status.probing = false;
        drop(status);
        if was_open {
            logging::info!(
                "[Breaker] resource {} closed, trial call succeeded",
                self.rule.resource
            );
            for listener in &self.listeners {
                listener.on_transform_to_closed(State::HalfOpen, Arc::clone(&self.rule));
            }
        }
    }

    fn on_failure(&self) {
        let mut status = self.status.lock().unwrap();
        if status.open {
            // failed trial: restart the open window, the counter survives
            status.probing = false;
            status.next_probe_timestamp_ms =
                utils::curr_time_millis() + self.rule.retry_timeout_ms as u64;
            let until = status.next_probe_timestamp_ms;
            drop(status);
            logging::warn!(
                "[Breaker] resource {} re-opened until {}, trial call failed",
                self.rule.resource,
                utils::format_time_millis(until)
            );
            for listener in &self.listeners {
                listener.on_transform_to_open(State::HalfOpen, Arc::clone(&self.rule));
            }
            return;
        }
        status.failures += 1;
        if status.failures >= self.rule.max_failures {
            status.open = true;
            status.next_probe_timestamp_ms =
                utils::curr_time_millis() + self.rule.retry_timeout_ms as u64;
            let (failures, until) = (status.failures, status.next_probe_timestamp_ms);
            drop(status);
            logging::warn!(
                "[Breaker] resource {} opened until {}, consecutive failures: {}",
                self.rule.resource,
                utils::format_time_millis(until),
                failures
            );
            for listener in &self.listeners {
                listener.on_transform_to_open(State::Closed, Arc::clone(&self.rule));
            }
        }
    }
}

cfg_async! {
    use std::future::Future;

    impl Breaker {
        /// Guards one invocation of an asynchronous operation. Same contract
        /// as [`Breaker::call`]; the operation is not even constructed when
        /// the breaker rejects, and the state lock is never held across an
        /// await point.
        pub async fn call_async<T, E, F, Fut>(&self, op: F) -> Result<T, CallError<E>>
        where
            F: FnOnce() -> Fut,
            Fut: Future<Output = Result<T, E>>,
        {
            let mut probe = match self.try_acquire() {
                Admission::Reject => return Err(CallError::Open),
                Admission::Trial => ProbeReset {
                    status: Some(&self.status),
                },
                Admission::Pass => ProbeReset { status: None },
            };
            match op().await {
                Ok(r) => {
                    probe.disarm();
                    self.on_success();
                    Ok(r)
                }
                Err(e) => {
                    probe.disarm();
                    self.on_failure();
                    Err(CallError::Inner(e))
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::sleep_for_ms;
    use mockall::predicate::*;
    use mockall::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    mock! {
        pub(crate) StateListener {}
        impl StateChangeListener for StateListener {
            fn on_transform_to_closed(&self, prev: State, rule: Arc<Rule>);
            fn on_transform_to_open(&self, prev: State, rule: Arc<Rule>);
            fn on_transform_to_half_open(&self, prev: State, rule: Arc<Rule>);
        }
    }

    fn rule(max_failures: u32, retry_timeout_ms: u32) -> Rule {
        Rule {
            resource: "abc".into(),
            max_failures,
            retry_timeout_ms,
        }
    }

    #[test]
    fn initial_state() {
        let breaker = Breaker::new(rule(3, 1000)).unwrap();
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.current_failures(), 0);
        assert_eq!(breaker.current_state(), State::Closed);
    }

    #[test]
    fn invalid_rule_is_rejected() {
        assert!(Breaker::new(Rule::default()).is_err());
    }

    #[test]
    fn trips_when_failure_threshold_is_reached() {
        let breaker = Breaker::new(rule(1, 100)).unwrap();
        let res = breaker.call(|| Err::<(), &str>("down"));
        assert!(matches!(res, Err(CallError::Inner("down"))));
        assert!(breaker.is_tripped());
        assert_eq!(breaker.current_state(), State::Open);
    }

    #[test]
    fn failure_under_threshold_surfaces_error() {
        let breaker = Breaker::new(rule(3, 100)).unwrap();
        let res = breaker.call(|| Err::<(), &str>("down"));
        // the underlying failure is re-surfaced even while under the threshold
        assert!(matches!(res, Err(CallError::Inner("down"))));
        assert_eq!(breaker.current_failures(), 1);
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn success_resets_failures() {
        let breaker = Breaker::new(rule(3, 100)).unwrap();
        let _ = breaker.call(|| Err::<(), &str>("down"));
        let _ = breaker.call(|| Err::<(), &str>("down"));
        assert_eq!(breaker.current_failures(), 2);
        let res = breaker.call(|| Ok::<&str, &str>("fine"));
        assert_eq!(res.unwrap(), "fine");
        assert_eq!(breaker.current_failures(), 0);
        assert!(!breaker.is_tripped());
        // the circuit never opened
        assert_eq!(breaker.current_state(), State::Closed);
    }

    #[test]
    fn open_rejects_without_invoking() {
        let breaker = Breaker::new(rule(1, 60_000)).unwrap();
        let invocations = AtomicU32::new(0);
        let op = || {
            invocations.fetch_add(1, Ordering::SeqCst);
            Err::<(), &str>("down")
        };
        let _ = breaker.call(op);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert!(breaker.is_tripped());

        for _ in 0..3 {
            let res = breaker.call(|| {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<(), &str>(())
            });
            assert!(matches!(res, Err(CallError::Open)));
        }
        // no downstream load was generated while open
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn half_open_after_timeout() {
        let breaker = Breaker::new(rule(1, 10)).unwrap();
        let _ = breaker.call(|| Err::<(), &str>("down"));
        assert!(breaker.is_tripped());
        assert_eq!(breaker.current_failures(), 1);

        sleep_for_ms(20);
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.current_state(), State::HalfOpen);
        // the counter survives the half-open probe
        assert_eq!(breaker.current_failures(), 1);
    }

    #[test]
    fn trial_success_closes() {
        let breaker = Breaker::new(rule(1, 10)).unwrap();
        let _ = breaker.call(|| Err::<(), &str>("down"));
        sleep_for_ms(20);
        let invoked = AtomicU32::new(0);
        let res = breaker.call(|| {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<(), &str>(())
        });
        assert!(res.is_ok());
        // the trial call was actually delivered
        assert_eq!(invoked.load(Ordering::SeqCst), 1);
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.current_failures(), 0);
        assert_eq!(breaker.current_state(), State::Closed);
    }

    #[test]
    fn trial_failure_reopens_and_restarts_window() {
        let breaker = Breaker::new(rule(1, 50)).unwrap();
        let _ = breaker.call(|| Err::<(), &str>("down"));
        sleep_for_ms(60);
        assert!(!breaker.is_tripped());

        let res = breaker.call(|| Err::<(), &str>("still down"));
        assert!(matches!(res, Err(CallError::Inner("still down"))));
        // reopened with a fresh window, counter untouched
        assert!(breaker.is_tripped());
        assert_eq!(breaker.current_failures(), 1);
        let res = breaker.call(|| Ok::<(), &str>(()));
        assert!(matches!(res, Err(CallError::Open)));
    }

    #[test]
    fn listener_observes_transitions() {
        let mut listener = MockStateListener::new();
        listener
            .expect_on_transform_to_open()
            .withf(|prev, _| *prev == State::Closed)
            .once()
            .return_const(());
        listener
            .expect_on_transform_to_half_open()
            .withf(|prev, _| *prev == State::Open)
            .once()
            .return_const(());
        listener
            .expect_on_transform_to_closed()
            .withf(|prev, _| *prev == State::HalfOpen)
            .once()
            .return_const(());

        let listeners: Vec<Arc<dyn StateChangeListener>> = vec![Arc::new(listener)];
        let breaker = Breaker::with_listeners(rule(1, 10), listeners).unwrap();
        let _ = breaker.call(|| Err::<(), &str>("down"));
        sleep_for_ms(20);
        let _ = breaker.call(|| Ok::<(), &str>(()));
    }

    #[test]
    fn listener_observes_reopen_on_failed_trial() {
        let mut listener = MockStateListener::new();
        listener
            .expect_on_transform_to_open()
            .withf(|prev, _| *prev == State::Closed)
            .once()
            .return_const(());
        listener
            .expect_on_transform_to_half_open()
            .withf(|prev, _| *prev == State::Open)
            .once()
            .return_const(());
        listener
            .expect_on_transform_to_open()
            .withf(|prev, _| *prev == State::HalfOpen)
            .once()
            .return_const(());

        let listeners: Vec<Arc<dyn StateChangeListener>> = vec![Arc::new(listener)];
        let breaker = Breaker::with_listeners(rule(1, 10), listeners).unwrap();
        let _ = breaker.call(|| Err::<(), &str>("down"));
        sleep_for_ms(20);
        let res = breaker.call(|| Err::<(), &str>("still down"));
        assert!(matches!(res, Err(CallError::Inner("still down"))));
        assert!(breaker.is_tripped());
    }

    #[test]
    fn panicking_trial_does_not_wedge() {
        let breaker = Arc::new(Breaker::new(rule(1, 10)).unwrap());
        let _ = breaker.call(|| Err::<(), &str>("down"));
        sleep_for_ms(20);

        let guarded = Arc::clone(&breaker);
        let trial = std::thread::spawn(move || {
            let _ = guarded.call(|| -> Result<(), &str> { panic!("boom") });
        })
        .join();
        assert!(trial.is_err());

        // the probe slot was released, the next caller gets the trial
        let res = breaker.call(|| Ok::<(), &str>(()));
        assert!(res.is_ok());
        assert_eq!(breaker.current_state(), State::Closed);
    }

    #[test]
    fn single_trial_admission() {
        let breaker = Arc::new(Breaker::new(rule(1, 20)).unwrap());
        let _ = breaker.call(|| Err::<(), &str>("down"));
        sleep_for_ms(30);

        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let guarded = Arc::clone(&breaker);
        let trial = std::thread::spawn(move || {
            guarded.call(move || {
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok::<(), &str>(())
            })
        });
        entered_rx.recv().unwrap();

        // a trial is in flight, racing callers are rejected outright
        let res = breaker.call(|| Ok::<(), &str>(()));
        assert!(matches!(res, Err(CallError::Open)));

        release_tx.send(()).unwrap();
        assert!(trial.join().unwrap().is_ok());
        assert_eq!(breaker.current_state(), State::Closed);
        assert_eq!(breaker.current_failures(), 0);
    }
}
