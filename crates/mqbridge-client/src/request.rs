//! Correlation between asynchronous library callbacks and blocking callers.
//!
//! A [`PendingRequest`] is created once per operation kind and reused. Each
//! use arms it with [`PendingRequest::submit`], which returns a
//! [`Completion`] token for the MQTT library. The caller then blocks in
//! [`PendingRequest::wait`] until the library resolves the token from its own
//! thread, or until the request's timeout elapses.
//!
//! Every arming bumps a generation counter. A completion that arrives after
//! its waiter gave up still runs the request's handler, but cannot satisfy a
//! later submission.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};
use mqbridge_core::Timeout;
use parking_lot::{Condvar, Mutex};

use crate::error::{ClientError, Result};

type Handler<C> = Box<dyn Fn(&C, &Result<()>) + Send + Sync>;

enum Phase {
    Idle,
    Armed,
    Done(Result<()>),
}

struct Slot {
    generation: u64,
    phase: Phase,
}

struct Shared<C> {
    name: &'static str,
    slot: Mutex<Slot>,
    signal: Condvar,
    handler: Option<Handler<C>>,
}

/// A reusable, single-waiter request.
pub struct PendingRequest<C = ()> {
    shared: Arc<Shared<C>>,
    timeout: Timeout,
}

impl<C> PendingRequest<C> {
    /// Create a request without a completion handler.
    pub fn new(name: &'static str, timeout: Timeout) -> Self {
        Self::build(name, timeout, None)
    }

    /// Create a request whose handler runs on every completion, on the
    /// thread that resolves it, before any waiter is woken.
    pub fn with_handler<F>(name: &'static str, timeout: Timeout, handler: F) -> Self
    where
        F: Fn(&C, &Result<()>) + Send + Sync + 'static,
    {
        Self::build(name, timeout, Some(Box::new(handler)))
    }

    fn build(name: &'static str, timeout: Timeout, handler: Option<Handler<C>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                slot: Mutex::new(Slot {
                    generation: 0,
                    phase: Phase::Idle,
                }),
                signal: Condvar::new(),
                handler,
            }),
            timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// Arm the request with a fresh context and hand out its completion.
    pub fn submit(&self, context: C) -> Completion<C> {
        let mut slot = self.shared.slot.lock();
        slot.generation += 1;
        slot.phase = Phase::Armed;
        trace!("{} request armed (generation {})", self.shared.name, slot.generation);
        Completion {
            shared: Arc::clone(&self.shared),
            generation: slot.generation,
            context,
            resolved: false,
        }
    }

    /// Disarm after the library refused the submission.
    pub fn cancel(&self) {
        let mut slot = self.shared.slot.lock();
        slot.phase = Phase::Idle;
    }

    /// Block until the submitted operation completes or times out.
    pub fn wait(&self) -> Result<()> {
        self.wait_for(self.timeout)
    }

    /// Like [`wait`](Self::wait) with an explicit bound.
    pub fn wait_for(&self, timeout: Timeout) -> Result<()> {
        let deadline = timeout.deadline_from(Instant::now());
        let mut slot = self.shared.slot.lock();

        if matches!(slot.phase, Phase::Idle) {
            return Err(ClientError::InvalidState(format!(
                "no {} request submitted",
                self.shared.name
            )));
        }

        loop {
            if matches!(slot.phase, Phase::Done(_)) {
                if let Phase::Done(result) = std::mem::replace(&mut slot.phase, Phase::Idle) {
                    return result;
                }
            }

            match deadline {
                None => self.shared.signal.wait(&mut slot),
                Some(deadline) => {
                    if self.shared.signal.wait_until(&mut slot, deadline).timed_out()
                        && matches!(slot.phase, Phase::Armed)
                    {
                        slot.phase = Phase::Idle;
                        return Err(ClientError::Timeout(self.shared.name));
                    }
                }
            }
        }
    }
}

/// Token resolved exactly once by the MQTT library.
///
/// Dropping an unresolved completion resolves it with `BrokerRejected`, so a
/// waiter never outlives the library state that was meant to answer it.
pub struct Completion<C = ()> {
    shared: Arc<Shared<C>>,
    generation: u64,
    context: C,
    resolved: bool,
}

impl<C> Completion<C> {
    /// The context this completion was armed with.
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report the outcome of the operation.
    pub fn resolve(mut self, result: Result<()>) {
        self.finish(result);
    }

    pub fn succeed(self) {
        self.resolve(Ok(()));
    }

    pub fn fail(self, reason: impl Into<String>) {
        self.resolve(Err(ClientError::BrokerRejected(reason.into())));
    }

    fn finish(&mut self, result: Result<()>) {
        if self.resolved {
            return;
        }
        self.resolved = true;

        if let Some(handler) = &self.shared.handler {
            handler(&self.context, &result);
        }

        let mut slot = self.shared.slot.lock();
        if slot.generation == self.generation && matches!(slot.phase, Phase::Armed) {
            slot.phase = Phase::Done(result);
            self.shared.signal.notify_all();
        } else {
            debug!(
                "{} request completed with no waiter (generation {}, current {})",
                self.shared.name, self.generation, slot.generation
            );
        }
    }
}

impl<C> Drop for Completion<C> {
    fn drop(&mut self) {
        if !self.resolved {
            self.finish(Err(ClientError::BrokerRejected(format!(
                "{} request abandoned",
                self.shared.name
            ))));
        }
    }
}

impl<C> std::fmt::Debug for Completion<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("name", &self.shared.name)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_resolve_from_other_thread() {
        let req: PendingRequest<()> = PendingRequest::new("connect", Timeout::Infinite);
        let completion = req.submit(());

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completion.fail("bad credentials");
        });

        match req.wait() {
            Err(ClientError::BrokerRejected(reason)) => assert_eq!(reason, "bad credentials"),
            other => panic!("unexpected result: {:?}", other),
        }
        handle.join().unwrap();

        // Consumed exactly once
        assert!(matches!(req.wait(), Err(ClientError::InvalidState(_))));
    }

    #[test]
    fn test_wait_without_submit() {
        let req: PendingRequest<()> = PendingRequest::new("disconnect", Timeout::Infinite);
        assert!(matches!(req.wait(), Err(ClientError::InvalidState(_))));
    }

    #[test]
    fn test_resolved_before_wait() {
        let req: PendingRequest<()> = PendingRequest::new("subscribe", Timeout::Infinite);
        req.submit(()).succeed();
        assert!(req.wait().is_ok());
    }

    #[test]
    fn test_timeout_then_late_completion() {
        let req: PendingRequest<()> =
            PendingRequest::new("publish", Timeout::After(Duration::from_millis(20)));

        let late = req.submit(());
        assert!(matches!(req.wait(), Err(ClientError::Timeout("publish"))));

        let current = req.submit(());
        // Late signal for the previous generation must not satisfy this one
        late.succeed();
        current.fail("nope");
        assert!(matches!(req.wait(), Err(ClientError::BrokerRejected(_))));
    }

    #[test]
    fn test_handler_runs_for_every_completion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let req = PendingRequest::with_handler(
            "publish",
            Timeout::After(Duration::from_millis(10)),
            move |qos: &u8, result| {
                assert_eq!(*qos, 2);
                assert!(result.is_ok());
                counted.fetch_add(1, Ordering::SeqCst);
            },
        );

        let completion = req.submit(2);
        assert_eq!(*completion.context(), 2);
        assert!(req.wait().is_err());
        completion.succeed();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_completion_wakes_waiter() {
        let req: PendingRequest<()> = PendingRequest::new("connect", Timeout::Infinite);
        let completion = req.submit(());
        thread::spawn(move || drop(completion));
        assert!(matches!(req.wait(), Err(ClientError::BrokerRejected(_))));
    }

    #[test]
    fn test_cancel_disarms() {
        let req: PendingRequest<()> = PendingRequest::new("connect", Timeout::Infinite);
        let completion = req.submit(());
        req.cancel();
        assert!(matches!(req.wait(), Err(ClientError::InvalidState(_))));
        completion.succeed();
        assert!(matches!(req.wait(), Err(ClientError::InvalidState(_))));
    }
}
