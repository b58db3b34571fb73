//! Processing steps.
//!
//! A step is either synchronous ([`Processor`]) or asynchronous
//! ([`AsyncProcessor`]). Both are driven through the asynchronous contract:
//! the exchange is moved into the step together with a [`Callback`], and the
//! step hands the exchange back by invoking the callback exactly once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

use crate::error::{Fault, FaultResult};
use crate::exchange::Exchange;

/// How an asynchronous step completed relative to its return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The callback was invoked before `process_async` returned.
    Sync,
    /// The callback will be invoked later, possibly from another thread.
    Pending,
}

impl Completion {
    pub fn is_sync(self) -> bool {
        matches!(self, Completion::Sync)
    }
}

/// Continuation invoked with the exchange once a step is done with it.
///
/// Consumed on use, so it can fire at most once.
pub struct Callback(Option<Box<dyn FnOnce(Exchange) + Send>>);

impl Callback {
    pub fn new(f: impl FnOnce(Exchange) + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// Hand the exchange back to the caller.
    pub fn done(mut self, exchange: Exchange) {
        if let Some(f) = self.0.take() {
            f(exchange);
        }
    }
}

impl Drop for Callback {
    fn drop(&mut self) {
        if self.0.is_some() {
            warn!("completion callback dropped without being invoked");
        }
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("pending", &self.0.is_some())
            .finish()
    }
}

/// A step that finishes before returning.
pub trait Processor: Send + Sync {
    fn process(&self, exchange: &mut Exchange) -> FaultResult<()>;
}

impl<F> Processor for F
where
    F: Fn(&mut Exchange) -> FaultResult<()> + Send + Sync,
{
    fn process(&self, exchange: &mut Exchange) -> FaultResult<()> {
        self(exchange)
    }
}

/// A step that may suspend and complete later through its callback.
///
/// Implementations must invoke `callback` exactly once, recording any fault
/// on the exchange rather than dropping it.
pub trait AsyncProcessor: Send + Sync {
    fn process_async(&self, exchange: Exchange, callback: Callback) -> Completion;
}

/// A shareable step of either shape.
#[derive(Clone)]
pub enum Step {
    Sync(Arc<dyn Processor>),
    Async(Arc<dyn AsyncProcessor>),
}

impl Step {
    /// Build a synchronous step from a closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut Exchange) -> FaultResult<()> + Send + Sync + 'static,
    {
        Step::Sync(Arc::new(f))
    }

    pub fn sync(processor: impl Processor + 'static) -> Self {
        Step::Sync(Arc::new(processor))
    }

    pub fn asynchronous(processor: impl AsyncProcessor + 'static) -> Self {
        Step::Async(Arc::new(processor))
    }

    /// Run the step through the asynchronous contract.
    pub fn process_async(&self, mut exchange: Exchange, callback: Callback) -> Completion {
        match self {
            Step::Sync(processor) => {
                if let Err(fault) = processor.process(&mut exchange) {
                    exchange.set_fault(fault);
                }
                callback.done(exchange);
                Completion::Sync
            }
            Step::Async(processor) => processor.process_async(exchange, callback),
        }
    }

    /// Run the step and await its completion.
    ///
    /// Faults stay recorded on the returned exchange. An error is returned
    /// only when the step dropped its callback without completing.
    pub async fn process(&self, exchange: Exchange) -> FaultResult<Exchange> {
        await_completion(|callback| self.process_async(exchange, callback)).await
    }

    /// Run the step and block the current thread until it completes.
    ///
    /// A fault recorded on the exchange is taken off and returned as the
    /// error. Must not be called from within an async runtime worker when the
    /// step completes on that same runtime.
    pub fn process_blocking(
        &self,
        exchange: Exchange,
        timeout: Option<Duration>,
    ) -> FaultResult<Exchange> {
        block_on_completion(|callback| self.process_async(exchange, callback), timeout)
    }

    /// Whether both values share the same underlying step.
    pub fn ptr_eq(&self, other: &Step) -> bool {
        match (self, other) {
            (Step::Sync(a), Step::Sync(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (Step::Async(a), Step::Async(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            _ => false,
        }
    }
}

fn dropped_callback() -> Fault {
    Fault::ExecutionFailed("step dropped its completion callback".to_string())
}

/// Start an asynchronous operation and await the exchange it completes with.
pub(crate) async fn await_completion<F>(start: F) -> FaultResult<Exchange>
where
    F: FnOnce(Callback) -> Completion,
{
    let (tx, rx) = oneshot::channel();
    start(Callback::new(move |exchange| {
        let _ = tx.send(exchange);
    }));
    rx.await.map_err(|_| dropped_callback())
}

/// Start an asynchronous operation and block until it completes, turning a
/// recorded fault into the error.
pub(crate) fn block_on_completion<F>(start: F, timeout: Option<Duration>) -> FaultResult<Exchange>
where
    F: FnOnce(Callback) -> Completion,
{
    let (tx, rx) = std::sync::mpsc::channel();
    start(Callback::new(move |exchange| {
        let _ = tx.send(exchange);
    }));
    let received = match timeout {
        Some(limit) => rx
            .recv_timeout(limit)
            .map_err(|_| Fault::Timeout(limit.as_millis() as u64)),
        None => rx.recv().map_err(|_| dropped_callback()),
    };
    let mut exchange = received?;
    match exchange.take_fault() {
        Some(fault) => Err(fault),
        None => Ok(exchange),
    }
}

/// Records whether a callback has fired, to report [`Completion`] honestly
/// from operations that chain several steps.
pub(crate) struct CompletionFlag(Arc<AtomicBool>);

impl CompletionFlag {
    /// Wrap `callback` so that invoking it raises the flag.
    pub(crate) fn track(callback: Callback) -> (Callback, CompletionFlag) {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let tracked = Callback::new(move |exchange| {
            flag.store(true, Ordering::Release);
            callback.done(exchange);
        });
        (tracked, CompletionFlag(fired))
    }

    pub(crate) fn completion(&self) -> Completion {
        if self.0.load(Ordering::Acquire) {
            Completion::Sync
        } else {
            Completion::Pending
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Sync(_) => f.write_str("Step::Sync(..)"),
            Step::Async(_) => f.write_str("Step::Async(..)"),
        }
    }
}

impl<P: AsyncProcessor + 'static> From<Arc<P>> for Step {
    fn from(processor: Arc<P>) -> Self {
        Step::Async(processor)
    }
}

/// Result of driving a step with [`drive`].
pub(crate) enum Driven {
    /// The step finished before returning; the caller keeps going.
    Ready(Exchange, Callback),
    /// The step suspended; `resume` will run when it completes.
    Suspended,
}

enum Slot {
    Waiting,
    Ready(Exchange),
    Detached(Callback),
    Finished,
}

/// Drive `step` so that a synchronous completion is returned to the caller's
/// loop, while an asynchronous one continues via `resume` on whichever thread
/// completes the step.
///
/// The hand-off slot decides which path runs, so the outcome is correct even
/// when a step reports its completion mode wrongly or completes concurrently
/// with its own return.
pub(crate) fn drive<R>(step: &Step, exchange: Exchange, done: Callback, resume: R) -> Driven
where
    R: FnOnce(Exchange, Callback) + Send + 'static,
{
    let slot = Arc::new(Mutex::new(Slot::Waiting));
    let callback_slot = Arc::clone(&slot);
    let callback = Callback::new(move |exchange| {
        let mut state = callback_slot.lock();
        match std::mem::replace(&mut *state, Slot::Finished) {
            Slot::Waiting => *state = Slot::Ready(exchange),
            Slot::Detached(done) => {
                drop(state);
                resume(exchange, done);
            }
            other => *state = other,
        }
    });

    step.process_async(exchange, callback);

    let mut state = slot.lock();
    match std::mem::replace(&mut *state, Slot::Finished) {
        Slot::Ready(exchange) => Driven::Ready(exchange, done),
        Slot::Waiting => {
            *state = Slot::Detached(done);
            Driven::Suspended
        }
        other => {
            *state = other;
            Driven::Suspended
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Deferred;

    impl AsyncProcessor for Deferred {
        fn process_async(&self, mut exchange: Exchange, callback: Callback) -> Completion {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                exchange.set_header("deferred", "yes");
                callback.done(exchange);
            });
            Completion::Pending
        }
    }

    #[test]
    fn test_sync_step_completes_inline() {
        let step = Step::from_fn(|exchange: &mut Exchange| {
            exchange.set_body("done");
            Ok(())
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let completion = step.process_async(
            Exchange::new(),
            Callback::new(move |exchange| {
                assert_eq!(exchange.body().as_text(), Some("done"));
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(completion.is_sync());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sync_step_fault_is_recorded() {
        let step = Step::from_fn(|_: &mut Exchange| Err(Fault::from("bad input")));
        let result = step.process_blocking(Exchange::new(), None);
        assert_eq!(result.unwrap_err(), Fault::ExecutionFailed("bad input".into()));
    }

    #[tokio::test]
    async fn test_async_step_awaited() {
        let step = Step::asynchronous(Deferred);
        let exchange = step.process(Exchange::new()).await.unwrap();
        assert_eq!(exchange.header("deferred"), Some("yes"));
    }

    #[test]
    fn test_blocking_timeout() {
        let step = Step::asynchronous(Deferred);
        let result = step.process_blocking(Exchange::new(), Some(Duration::from_millis(1)));
        assert_eq!(result.unwrap_err(), Fault::Timeout(1));
    }

    #[test]
    fn test_drive_sync_returns_ready() {
        let step = Step::from_fn(|_: &mut Exchange| Ok(()));
        let driven = drive(&step, Exchange::new(), Callback::new(|_| {}), |_, _| {
            panic!("resume must not run for a synchronous step")
        });
        match driven {
            Driven::Ready(exchange, done) => done.done(exchange),
            Driven::Suspended => panic!("expected synchronous completion"),
        }
    }

    #[test]
    fn test_drive_async_resumes() {
        let (tx, rx) = std::sync::mpsc::channel();
        let step = Step::asynchronous(Deferred);
        let driven = drive(
            &step,
            Exchange::new(),
            Callback::new(move |exchange| {
                let _ = tx.send(exchange);
            }),
            |exchange, done| done.done(exchange),
        );
        assert!(matches!(driven, Driven::Suspended));
        let exchange = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(exchange.header("deferred"), Some("yes"));
    }
}
