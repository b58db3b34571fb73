//! Error handler binding and the built-in handlers.
//!
//! A handler is an ordinary [`Step`] that receives an exchange carrying a
//! fault. It may clear the fault and redirect the exchange, re-run the failed
//! target, or pass the exchange on with the fault still set.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::exchange::Exchange;
use crate::step::{AsyncProcessor, Callback, Completion, CompletionFlag, Step};

/// Header holding the description of the fault a dead-letter channel caught.
pub const CAUGHT_FAULT_HEADER: &str = "routekit.caught-fault";

/// Header holding the number of redelivery attempts made so far.
pub const REDELIVERY_COUNTER_HEADER: &str = "routekit.redelivery-counter";

/// A step whose faults can be routed to a designated handler.
pub trait ErrorHandlerAware {
    fn error_handler(&self) -> Option<Step>;

    /// Replace the handler. Exchanges already past the binding point keep
    /// the handler they captured.
    fn set_error_handler(&self, handler: Option<Step>);
}

/// Builds the handler bound to one target step.
pub trait ErrorHandlerFactory: Send + Sync {
    fn create(&self, target: &Step) -> Step;
}

impl<F> ErrorHandlerFactory for F
where
    F: Fn(&Step) -> Step + Send + Sync,
{
    fn create(&self, target: &Step) -> Step {
        self(target)
    }
}

/// Moves failed exchanges to a dead-letter step.
///
/// The fault is cleared and described in [`CAUGHT_FAULT_HEADER`], and the
/// route is stopped so the remaining steps are skipped.
#[derive(Clone)]
pub struct DeadLetterChannel {
    dead_letter: Step,
}

impl DeadLetterChannel {
    pub fn new(dead_letter: Step) -> Self {
        Self { dead_letter }
    }
}

impl AsyncProcessor for DeadLetterChannel {
    fn process_async(&self, mut exchange: Exchange, callback: Callback) -> Completion {
        match exchange.take_fault() {
            Some(fault) => {
                debug!(exchange = exchange.id(), %fault, "moving exchange to dead letter");
                exchange.set_header(CAUGHT_FAULT_HEADER, fault.to_string());
                exchange.stop_route();
                self.dead_letter.process_async(exchange, callback)
            }
            None => {
                callback.done(exchange);
                Completion::Sync
            }
        }
    }
}

impl ErrorHandlerFactory for DeadLetterChannel {
    fn create(&self, _target: &Step) -> Step {
        Step::asynchronous(self.clone())
    }
}

/// Settings for [`Redelivery`] handlers.
#[derive(Clone)]
pub struct RedeliveryPolicy {
    max_redeliveries: u32,
    delay: Option<Duration>,
    fallback: Option<Step>,
}

impl RedeliveryPolicy {
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            max_redeliveries,
            delay: None,
            fallback: None,
        }
    }

    /// Wait before every redelivery.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hand the exchange here once redeliveries are exhausted, instead of
    /// re-raising the fault.
    pub fn with_fallback(mut self, fallback: Step) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn max_redeliveries(&self) -> u32 {
        self.max_redeliveries
    }
}

impl ErrorHandlerFactory for RedeliveryPolicy {
    fn create(&self, target: &Step) -> Step {
        Step::asynchronous(Redelivery::new(target.clone(), self.clone()))
    }
}

/// Re-invokes the failed target until it succeeds or the attempts run out.
pub struct Redelivery {
    shared: Arc<RedeliveryShared>,
}

struct RedeliveryShared {
    target: Step,
    policy: RedeliveryPolicy,
}

impl Redelivery {
    pub fn new(target: Step, policy: RedeliveryPolicy) -> Self {
        Self {
            shared: Arc::new(RedeliveryShared { target, policy }),
        }
    }
}

impl AsyncProcessor for Redelivery {
    fn process_async(&self, exchange: Exchange, callback: Callback) -> Completion {
        let (callback, flag) = CompletionFlag::track(callback);
        RedeliveryShared::handle(Arc::clone(&self.shared), exchange, 0, callback);
        flag.completion()
    }
}

impl RedeliveryShared {
    fn handle(this: Arc<Self>, mut exchange: Exchange, attempts: u32, callback: Callback) {
        if !exchange.is_failed() {
            callback.done(exchange);
            return;
        }
        if attempts >= this.policy.max_redeliveries {
            warn!(
                exchange = exchange.id(),
                attempts,
                fault = ?exchange.fault(),
                "redelivery exhausted"
            );
            match this.policy.fallback.clone() {
                Some(fallback) => {
                    fallback.process_async(exchange, callback);
                }
                None => callback.done(exchange),
            }
            return;
        }

        let attempt = attempts + 1;
        exchange.take_fault();
        exchange.set_header(REDELIVERY_COUNTER_HEADER, attempt.to_string());
        debug!(exchange = exchange.id(), attempt, "redelivering");

        match this.policy.delay {
            Some(delay) => Self::schedule(this, exchange, attempt, callback, delay),
            None => Self::redeliver(this, exchange, attempt, callback),
        }
    }

    fn redeliver(this: Arc<Self>, exchange: Exchange, attempt: u32, callback: Callback) {
        let target = this.target.clone();
        target.process_async(
            exchange,
            Callback::new(move |exchange| Self::handle(this, exchange, attempt, callback)),
        );
    }

    fn schedule(
        this: Arc<Self>,
        exchange: Exchange,
        attempt: u32,
        callback: Callback,
        delay: Duration,
    ) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::redeliver(this, exchange, attempt, callback);
                });
            }
            Err(_) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    Self::redeliver(this, exchange, attempt, callback);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Fault;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(failures: u32) -> (Step, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let step = Step::from_fn(move |exchange: &mut Exchange| {
            let call = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= failures {
                Err(Fault::from(format!("failure {call}")))
            } else {
                exchange.set_body("ok");
                Ok(())
            }
        });
        (step, calls)
    }

    fn failed() -> Exchange {
        let mut exchange = Exchange::new();
        exchange.set_fault(Fault::from("original"));
        exchange
    }

    #[test]
    fn test_dead_letter_channel() {
        let handler = DeadLetterChannel::new(Step::from_fn(|exchange: &mut Exchange| {
            exchange.set_header("dead", "yes");
            Ok(())
        }))
        .create(&Step::from_fn(|_: &mut Exchange| Ok(())));

        let exchange = handler.process_blocking(failed(), None).unwrap();
        assert_eq!(exchange.header("dead"), Some("yes"));
        assert_eq!(
            exchange.header(CAUGHT_FAULT_HEADER),
            Some("Step execution failed: original")
        );
        assert!(exchange.is_route_stopped());
    }

    #[test]
    fn test_redelivery_succeeds() {
        let (target, calls) = flaky(2);
        let handler = RedeliveryPolicy::new(3).create(&target);

        let exchange = handler.process_blocking(failed(), None).unwrap();
        assert_eq!(exchange.body().as_text(), Some("ok"));
        assert_eq!(exchange.header(REDELIVERY_COUNTER_HEADER), Some("3"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_redelivery_exhausted_reraises() {
        let (target, calls) = flaky(10);
        let handler = RedeliveryPolicy::new(2).create(&target);

        let result = handler.process_blocking(failed(), None);
        assert_eq!(result.unwrap_err(), Fault::ExecutionFailed("failure 2".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_redelivery_fallback() {
        let (target, _) = flaky(10);
        let fallback = Step::from_fn(|exchange: &mut Exchange| {
            exchange.take_fault();
            exchange.set_body("fallback");
            Ok(())
        });
        let handler = RedeliveryPolicy::new(1).with_fallback(fallback).create(&target);

        let exchange = handler.process_blocking(failed(), None).unwrap();
        assert_eq!(exchange.body().as_text(), Some("fallback"));
    }

    #[tokio::test]
    async fn test_delayed_redelivery_on_runtime() {
        let (target, calls) = flaky(1);
        let handler = RedeliveryPolicy::new(2)
            .with_delay(Duration::from_millis(5))
            .create(&target);

        let exchange = handler.process(failed()).await.unwrap();
        assert!(!exchange.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
