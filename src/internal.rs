//! The cross-cutting wrapper placed around every step of a chain.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::{debug, trace};

use crate::advice::{share, Advice, SharedAdvice, Token};
use crate::error::FaultResult;
use crate::error_handler::ErrorHandlerAware;
use crate::exchange::{Exchange, RouteId};
use crate::step::{
    await_completion, block_on_completion, AsyncProcessor, Callback, Completion, CompletionFlag,
    Step,
};

/// Wraps a target step with an ordered list of [`Advice`] layers and an
/// optional bound error handler.
///
/// Layers are entered in the order they were added and exited in reverse,
/// each exactly once, before the caller's callback runs. When the exchange
/// carries a fault after unwinding and an error handler is bound, the
/// exchange goes to the handler and the handler's outcome is what the caller
/// receives.
///
/// The handler is captured when an exchange enters, so rebinding only
/// affects exchanges that enter afterwards.
pub struct InternalProcessor {
    id: String,
    route_id: RouteId,
    target: Step,
    advices: Vec<SharedAdvice>,
    error_handler: ArcSwapOption<Step>,
}

impl InternalProcessor {
    pub fn new(id: impl Into<String>, route_id: RouteId, target: Step) -> Self {
        Self {
            id: id.into(),
            route_id,
            target,
            advices: Vec::new(),
            error_handler: ArcSwapOption::empty(),
        }
    }

    /// Add the next layer. Layers added later sit closer to the target.
    pub fn with_advice(mut self, advice: impl Advice) -> Self {
        self.advices.push(share(advice));
        self
    }

    pub(crate) fn with_shared_advices(mut self, advices: Vec<SharedAdvice>) -> Self {
        self.advices.extend(advices);
        self
    }

    pub fn with_error_handler(self, handler: Step) -> Self {
        self.error_handler.store(Some(Arc::new(handler)));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn route_id(&self) -> &RouteId {
        &self.route_id
    }

    pub fn target(&self) -> &Step {
        &self.target
    }

    /// Names of the layers in entry order.
    pub fn advice_names(&self) -> Vec<&str> {
        self.advices.iter().map(|advice| advice.name()).collect()
    }

    /// Asynchronous entry point.
    ///
    /// Runs the target and, if it completes without a fault, `result`. The
    /// callback fires exactly once after every entered layer has exited.
    pub fn process_with(
        &self,
        mut exchange: Exchange,
        result: Option<Step>,
        callback: Callback,
    ) -> Completion {
        let handler = self.error_handler.load_full();
        let (callback, flag) = CompletionFlag::track(callback);

        let mut entered = Vec::with_capacity(self.advices.len());
        for advice in &self.advices {
            match advice.enter(&mut exchange) {
                Ok(token) => entered.push((Arc::clone(advice), token)),
                Err(fault) => {
                    debug!(
                        node = %self.id,
                        advice = advice.name(),
                        %fault,
                        "layer refused exchange"
                    );
                    exchange.set_fault(fault);
                    break;
                }
            }
        }

        let unwind = Unwind {
            node: self.id.clone(),
            entered,
            handler,
            callback,
        };
        if exchange.is_failed() {
            unwind.run(exchange);
            return flag.completion();
        }

        trace!(node = %self.id, exchange = exchange.id(), "invoking target");
        self.target.process_async(
            exchange,
            Callback::new(move |exchange| match result {
                Some(result) if !exchange.is_failed() => {
                    result.process_async(exchange, Callback::new(move |exchange| unwind.run(exchange)));
                }
                _ => unwind.run(exchange),
            }),
        );
        flag.completion()
    }

    /// Run the wrapped step and await its completion.
    pub async fn process(&self, exchange: Exchange) -> FaultResult<Exchange> {
        await_completion(|callback| self.process_with(exchange, None, callback)).await
    }

    /// Synchronous entry point: block until every layer has unwound,
    /// returning any fault as the error.
    pub fn process_blocking(
        &self,
        exchange: Exchange,
        timeout: Option<Duration>,
    ) -> FaultResult<Exchange> {
        block_on_completion(|callback| self.process_with(exchange, None, callback), timeout)
    }
}

/// Exit side of one pass through the wrapper.
struct Unwind {
    node: String,
    entered: Vec<(SharedAdvice, Token)>,
    handler: Option<Arc<Step>>,
    callback: Callback,
}

impl Unwind {
    fn run(self, mut exchange: Exchange) {
        for (advice, token) in self.entered.into_iter().rev() {
            advice.exit(&mut exchange, token);
        }
        match self.handler {
            Some(handler) if exchange.is_failed() => {
                debug!(
                    node = %self.node,
                    exchange = exchange.id(),
                    fault = ?exchange.fault(),
                    "handing failed exchange to error handler"
                );
                handler.process_async(exchange, self.callback);
            }
            _ => self.callback.done(exchange),
        }
    }
}

impl AsyncProcessor for InternalProcessor {
    fn process_async(&self, exchange: Exchange, callback: Callback) -> Completion {
        self.process_with(exchange, None, callback)
    }
}

impl ErrorHandlerAware for InternalProcessor {
    fn error_handler(&self) -> Option<Step> {
        self.error_handler.load_full().map(|handler| (*handler).clone())
    }

    fn set_error_handler(&self, handler: Option<Step>) {
        self.error_handler.store(handler.map(Arc::new));
    }
}

impl fmt::Debug for InternalProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalProcessor")
            .field("id", &self.id)
            .field("route_id", &self.route_id)
            .field("advices", &self.advice_names())
            .field("error_handler", &self.error_handler.load().is_some())
            .finish()
    }
}
