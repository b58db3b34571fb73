//! Integration tests for Routekit
//!
//! These tests exercise the router the way an application would: through the
//! public API only.

use routekit::prelude::*;
use routekit::{
    ConverterTable, InMemoryResourceResolver, InMemoryVariableRepository, ResourceResolver,
    TimingAdvice, TypeConverterLoader, CAUGHT_FAULT_HEADER, REDELIVERY_COUNTER_HEADER,
};
use std::any::Any;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Test Helpers
// =============================================================================

type Log = Arc<Mutex<Vec<String>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Records entry and exit, checking that the token survives the round trip.
struct Recorder {
    label: String,
    log: Log,
}

impl Recorder {
    fn new(label: impl Into<String>, log: &Log) -> Self {
        Self {
            label: label.into(),
            log: Arc::clone(log),
        }
    }
}

impl Advice for Recorder {
    type Token = String;

    fn name(&self) -> &str {
        &self.label
    }

    fn before(&self, _exchange: &mut Exchange) -> FaultResult<String> {
        self.log.lock().unwrap().push(format!("enter {}", self.label));
        Ok(format!("token-{}", self.label))
    }

    fn after(&self, exchange: &mut Exchange, token: String) {
        assert_eq!(token, format!("token-{}", self.label));
        let state = if exchange.is_failed() { "failed" } else { "ok" };
        self.log
            .lock()
            .unwrap()
            .push(format!("exit {} {}", self.label, state));
    }
}

/// Completes on another thread after a short pause.
struct Remote {
    fail: bool,
}

impl AsyncProcessor for Remote {
    fn process_async(&self, mut exchange: Exchange, callback: Callback) -> Completion {
        let fail = self.fail;
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            if fail {
                exchange.set_fault(Fault::from("remote failure"));
            } else {
                exchange.set_header("remote", "done");
            }
            callback.done(exchange);
        });
        Completion::Pending
    }
}

fn layered(target: Step, layers: usize, log: &Log) -> InternalProcessor {
    (0..layers).fold(
        InternalProcessor::new("node", RouteId::new("route"), target),
        |processor, i| processor.with_advice(Recorder::new(format!("l{i}"), log)),
    )
}

fn expected_trace(layers: usize, state: &str, target: Option<&str>) -> Vec<String> {
    let mut trace: Vec<String> = (0..layers).map(|i| format!("enter l{i}")).collect();
    trace.extend(target.map(str::to_string));
    trace.extend((0..layers).rev().map(|i| format!("exit l{i} {state}")));
    trace
}

/// Run through the asynchronous entry point, returning the exchange and how
/// often the callback fired.
fn run_async(processor: &InternalProcessor, exchange: Exchange) -> (Exchange, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let (tx, rx) = mpsc::channel();
    processor.process_with(
        exchange,
        None,
        Callback::new(move |exchange| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(exchange);
        }),
    );
    let exchange = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    (exchange, calls)
}

#[derive(Debug)]
struct Named(&'static str);

impl Provider for Named {
    fn name(&self) -> &str {
        self.0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Component for Named {
    fn create_producer(&self, remaining: &str) -> ResolutionResult<Step> {
        let tag = format!("{}:{remaining}", self.0);
        Ok(Step::from_fn(move |exchange: &mut Exchange| {
            exchange.set_header("producer", tag.clone());
            Ok(())
        }))
    }
}

// =============================================================================
// Cross-Cutting Wrapper
// =============================================================================

#[test]
fn test_exit_hooks_fire_in_reverse_order_sync() {
    for layers in [1, 3, 6] {
        let log = log();
        let sink = Arc::clone(&log);
        let target = Step::from_fn(move |_: &mut Exchange| {
            sink.lock().unwrap().push("target".to_string());
            Ok(())
        });
        let processor = layered(target, layers, &log);

        let (exchange, calls) = run_async(&processor, Exchange::new());
        assert!(!exchange.is_failed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(entries(&log), expected_trace(layers, "ok", Some("target")));
    }
}

#[test]
fn test_exit_hooks_fire_in_reverse_order_async() {
    let log = log();
    let processor = layered(Step::asynchronous(Remote { fail: false }), 4, &log);

    let (exchange, calls) = run_async(&processor, Exchange::new());
    assert_eq!(exchange.header("remote"), Some("done"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(entries(&log), expected_trace(4, "ok", None));
}

#[test]
fn test_completion_flag_reflects_suspension() {
    let sync = InternalProcessor::new("s", RouteId::new("r"), Step::from_fn(|_| Ok(())));
    assert_eq!(
        sync.process_with(Exchange::new(), None, Callback::new(|_| {})),
        Completion::Sync
    );

    let (tx, rx) = mpsc::channel();
    let remote = InternalProcessor::new(
        "a",
        RouteId::new("r"),
        Step::asynchronous(Remote { fail: false }),
    );
    let completion = remote.process_with(
        Exchange::new(),
        None,
        Callback::new(move |exchange| {
            let _ = tx.send(exchange);
        }),
    );
    assert_eq!(completion, Completion::Pending);
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
}

#[test]
fn test_fault_without_handler_reaches_callback() {
    let log = log();
    let processor = layered(Step::asynchronous(Remote { fail: true }), 3, &log);

    let (exchange, calls) = run_async(&processor, Exchange::new());
    assert_eq!(exchange.fault(), Some(&Fault::ExecutionFailed("remote failure".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(entries(&log), expected_trace(3, "failed", None));
}

#[test]
fn test_handler_success_replaces_fault() {
    let log = log();
    let handler = Step::from_fn(|exchange: &mut Exchange| {
        exchange.take_fault();
        exchange.set_body("handled");
        Ok(())
    });
    let processor =
        layered(Step::asynchronous(Remote { fail: true }), 2, &log).with_error_handler(handler);

    let (exchange, calls) = run_async(&processor, Exchange::new());
    assert!(!exchange.is_failed());
    assert_eq!(exchange.body().as_text(), Some("handled"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Hooks saw the fault before the handler cleared it.
    assert_eq!(entries(&log), expected_trace(2, "failed", None));
}

// =============================================================================
// Error Handler Binding
// =============================================================================

fn tagging_handler(tag: &'static str) -> Step {
    Step::from_fn(move |exchange: &mut Exchange| {
        exchange.take_fault();
        exchange.set_header("handled-by", tag);
        Ok(())
    })
}

/// Fails once released through its channel.
struct Held {
    release: Arc<Mutex<mpsc::Receiver<()>>>,
}

impl AsyncProcessor for Held {
    fn process_async(&self, mut exchange: Exchange, callback: Callback) -> Completion {
        let release = Arc::clone(&self.release);
        std::thread::spawn(move || {
            let _ = release.lock().unwrap().recv();
            exchange.set_fault(Fault::from("released"));
            callback.done(exchange);
        });
        Completion::Pending
    }
}

#[test]
fn test_error_handler_round_trip() {
    let processor = InternalProcessor::new("n", RouteId::new("r"), Step::from_fn(|_| Ok(())));
    assert!(processor.error_handler().is_none());

    let first = tagging_handler("first");
    processor.set_error_handler(Some(first.clone()));
    assert!(processor.error_handler().unwrap().ptr_eq(&first));

    let second = tagging_handler("second");
    processor.set_error_handler(Some(second.clone()));
    let bound = processor.error_handler().unwrap();
    assert!(bound.ptr_eq(&second));
    assert!(!bound.ptr_eq(&first));

    processor.set_error_handler(None);
    assert!(processor.error_handler().is_none());
}

#[test]
fn test_rebinding_does_not_affect_inflight_exchange() {
    let (release, held) = mpsc::channel();
    let processor = InternalProcessor::new(
        "n",
        RouteId::new("r"),
        Step::asynchronous(Held {
            release: Arc::new(Mutex::new(held)),
        }),
    )
    .with_error_handler(tagging_handler("old"));

    let (tx, rx) = mpsc::channel();
    let first_tx = tx.clone();
    processor.process_with(
        Exchange::new(),
        None,
        Callback::new(move |exchange| {
            let _ = first_tx.send(exchange);
        }),
    );

    processor.set_error_handler(Some(tagging_handler("new")));
    release.send(()).unwrap();
    let inflight = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(inflight.header("handled-by"), Some("old"));

    release.send(()).unwrap();
    processor.process_with(
        Exchange::new(),
        None,
        Callback::new(move |exchange| {
            let _ = tx.send(exchange);
        }),
    );
    let later = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(later.header("handled-by"), Some("new"));
}

#[tokio::test]
async fn test_dead_letter_channel_in_route() {
    let dead = log();
    let sink = Arc::clone(&dead);
    let context = RouterContext::builder().build().unwrap();
    context
        .add_route(
            Chain::builder("orders")
                .error_handler(Arc::new(DeadLetterChannel::new(Step::from_fn(
                    move |exchange: &mut Exchange| {
                        let caught = exchange.header(CAUGHT_FAULT_HEADER).unwrap_or("");
                        sink.lock().unwrap().push(caught.to_string());
                        Ok(())
                    },
                ))))
                .process(|_| Err(Fault::from("invalid order")))
                .process(|exchange: &mut Exchange| {
                    exchange.set_header("after", "ran");
                    Ok(())
                }),
        )
        .await
        .unwrap();

    let exchange = context.send("orders", Exchange::new()).await.unwrap();
    assert!(!exchange.is_failed());
    assert!(exchange.is_route_stopped());
    assert!(exchange.header("after").is_none());
    assert_eq!(entries(&dead), vec!["Step execution failed: invalid order"]);
}

#[tokio::test]
async fn test_redelivery_in_route() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    let context = RouterContext::builder().build().unwrap();
    context
        .add_route(
            Chain::builder("flaky")
                .error_handler(Arc::new(RedeliveryPolicy::new(3)))
                .process(move |exchange: &mut Exchange| {
                    if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(Fault::from("transient"));
                    }
                    exchange.set_body("delivered");
                    Ok(())
                }),
        )
        .await
        .unwrap();

    let exchange = context.send_blocking("flaky", Exchange::new()).unwrap();
    assert_eq!(exchange.body().as_text(), Some("delivered"));
    assert_eq!(exchange.header(REDELIVERY_COUNTER_HEADER), Some("2"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

// =============================================================================
// Extension Registry
// =============================================================================

#[tokio::test]
async fn test_absent_component_then_registered() {
    let registry = ExtensionRegistry::builder().build().unwrap();
    assert!(registry
        .resolve(ExtensionKind::Component, "foo")
        .await
        .unwrap()
        .is_none());

    let foo = Extension::Component(Arc::new(Named("foo")));
    registry.register(foo.clone()).unwrap();
    let resolved = registry
        .resolve(ExtensionKind::Component, "foo")
        .await
        .unwrap()
        .unwrap();
    assert!(resolved.ptr_eq(&foo));
}

#[tokio::test]
async fn test_second_resolver_for_scheme_rejected() {
    let registry = ExtensionRegistry::builder().build().unwrap();
    let first = InMemoryResourceResolver::new("file").named("first");
    let second = InMemoryResourceResolver::new("file").named("second");

    registry
        .register(Extension::ResourceResolver(Arc::new(first)))
        .unwrap();
    let err = registry
        .register(Extension::ResourceResolver(Arc::new(second)))
        .unwrap_err();
    assert_eq!(
        err,
        RegistryError::SchemeAlreadyClaimed {
            scheme: "file".to_string(),
            owner: "first".to_string(),
        }
    );
}

/// A slow custom source that counts discovery passes.
struct Slow {
    calls: AtomicUsize,
}

#[async_trait]
impl DiscoverySource for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Custom
    }

    async fn discover(&self, key: &routekit::ExtensionKey) -> ResolutionResult<Option<Extension>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(Some(Extension::VariableRepository(Arc::new(
            InMemoryVariableRepository::new(key.name.clone()),
        ))))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lookups_discover_once() {
    let source = Arc::new(Slow {
        calls: AtomicUsize::new(0),
    });
    let registry = Arc::new(
        ExtensionRegistry::builder()
            .source(Arc::clone(&source) as Arc<dyn DiscoverySource>)
            .build()
            .unwrap(),
    );

    let callers = 8;
    let barrier = Arc::new(tokio::sync::Barrier::new(callers));
    let mut handles = Vec::new();
    for _ in 0..callers {
        let registry = Arc::clone(&registry);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            registry
                .resolve(ExtensionKind::VariableRepository, "shared")
                .await
                .unwrap()
                .unwrap()
        }));
    }

    let mut resolved = Vec::new();
    for handle in handles {
        resolved.push(handle.await.unwrap());
    }
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert!(resolved.iter().all(|ext| ext.ptr_eq(&resolved[0])));
}

#[tokio::test]
async fn test_resource_resolution_by_scheme() {
    let context = RouterContext::builder()
        .register(Extension::ResourceResolver(Arc::new(
            InMemoryResourceResolver::new("mem").with("routes.yaml", b"route: orders".to_vec()),
        )))
        .build()
        .unwrap();

    let resource = context
        .registry()
        .resolve_resource("mem:routes.yaml")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resource.read_to_string().unwrap(), "route: orders");
    assert!(context
        .registry()
        .resolve_resource("mem:missing")
        .await
        .unwrap()
        .is_none());
    assert!(context
        .registry()
        .resolve_resource("ftp:anything")
        .await
        .unwrap()
        .is_none());
}

// =============================================================================
// Reload Coordination
// =============================================================================

struct Gate {
    started: Arc<tokio::sync::Notify>,
    release: Arc<tokio::sync::Notify>,
    calls: AtomicUsize,
}

#[async_trait]
impl ReloadParticipant for Gate {
    fn name(&self) -> &str {
        "gate"
    }

    async fn reload(&self, _source: &str) -> Result<(), ReloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_concurrent_reloads_coalesce() {
    let context = RouterContext::builder().build().unwrap();
    let gate = Arc::new(Gate {
        started: Arc::new(tokio::sync::Notify::new()),
        release: Arc::new(tokio::sync::Notify::new()),
        calls: AtomicUsize::new(0),
    });
    context
        .coordinator()
        .add_participant(Arc::clone(&gate) as Arc<dyn ReloadParticipant>);

    let started = Arc::clone(&gate.started);
    let release = Arc::clone(&gate.release);
    let (first, second, ()) = tokio::join!(
        context.reload("first"),
        context.reload("second"),
        async move {
            started.notified().await;
            release.notify_one();
        }
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert!(!first.coalesced);
    assert!(second.coalesced);
    assert_eq!(first.attempt, second.attempt);
    assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    assert_eq!(context.coordinator().stats().succeeded, 1);
}

#[tokio::test]
async fn test_reload_counters_increment_once_per_attempt() {
    let context = RouterContext::builder().build().unwrap();
    let generation = context.registry().generation();

    for expected in 1..=3 {
        let report = context.reload("tick").await.unwrap();
        assert_eq!(report.attempt, expected);
        assert_eq!(context.coordinator().stats().succeeded, expected);
    }
    assert!(context.registry().generation() > generation);
    assert_eq!(context.coordinator().state(), ReloadState::Idle);
}

#[tokio::test]
async fn test_reload_notifications() {
    let context = RouterContext::builder().build().unwrap();
    let mut events = context.notifier().subscribe();
    context.reload("manual").await.unwrap();

    use futures::StreamExt;
    assert_eq!(
        events.next().await,
        Some(Notification::ReloadCompleted {
            source: "manual".into()
        })
    );
}

// =============================================================================
// Routes
// =============================================================================

#[derive(Debug)]
struct Stamp(&'static str);

impl Provider for Stamp {
    fn name(&self) -> &str {
        "stamp"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RoutePolicy for Stamp {
    fn on_exchange_begin(&self, _route: &RouteId, exchange: &mut Exchange) -> FaultResult<()> {
        exchange.set_header("policy", self.0);
        Ok(())
    }
}

#[tokio::test]
async fn test_reload_picks_up_replaced_policy() {
    let context = RouterContext::builder()
        .register(Extension::RoutePolicy(Arc::new(Stamp("v1"))))
        .build()
        .unwrap();
    let original = context
        .add_route(Chain::builder("r").route_policy("stamp").process(|_| Ok(())))
        .await
        .unwrap();

    context
        .register(Extension::RoutePolicy(Arc::new(Stamp("v2"))))
        .unwrap();
    context.reload("policy-change").await.unwrap();

    let exchange = context.send("r", Exchange::new()).await.unwrap();
    assert_eq!(exchange.header("policy"), Some("v2"));
    let exchange = original.process(Exchange::new()).await.unwrap();
    assert_eq!(exchange.header("policy"), Some("v1"));
}

#[tokio::test]
async fn test_route_and_node_layers_nest() {
    let log = log();
    let context = RouterContext::builder().build().unwrap();
    context
        .add_route(
            Chain::builder("nested")
                .instrument(Recorder::new("route", &log))
                .instrument_nodes(Recorder::new("node", &log))
                .step(Step::asynchronous(Remote { fail: false }))
                .process(|_| Ok(())),
        )
        .await
        .unwrap();

    context.send("nested", Exchange::new()).await.unwrap();
    assert_eq!(
        entries(&log),
        vec![
            "enter route",
            "enter node",
            "exit node ok",
            "enter node",
            "exit node ok",
            "exit route ok",
        ]
    );
}

#[tokio::test]
async fn test_endpoints_and_timing() {
    let timing = TimingAdvice::new("timing");
    let stats = timing.stats();
    let context = RouterContext::builder()
        .register(Extension::Component(Arc::new(Named("audit"))))
        .build()
        .unwrap();
    context
        .add_route(Chain::builder("audited").instrument(timing).to("audit:orders"))
        .await
        .unwrap();

    let exchange = context.send("audited", Exchange::new()).await.unwrap();
    assert_eq!(exchange.header("producer"), Some("audit:orders"));
    assert_eq!(exchange.history().len(), 1);
    assert_eq!(stats.completed(), 1);
    assert_eq!(stats.failed(), 0);
}

#[tokio::test]
async fn test_stream_body_is_cached_on_entry() {
    let context = RouterContext::builder().build().unwrap();
    context
        .add_route(Chain::builder("read-twice").process(|exchange: &mut Exchange| {
            let first = exchange.body().as_text().map(str::to_string);
            let second = exchange.body().as_text().map(str::to_string);
            assert_eq!(first, second);
            Ok(())
        }))
        .await
        .unwrap();

    let exchange = Exchange::with_body(Body::Stream(Box::new(Cursor::new(b"payload".to_vec()))));
    let exchange = context.send("read-twice", exchange).await.unwrap();
    assert_eq!(exchange.body().as_text(), Some("payload"));
}

#[derive(Debug)]
struct UpperLoader;

impl Provider for UpperLoader {
    fn name(&self) -> &str {
        "upper"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl TypeConverterLoader for UpperLoader {
    fn load(&self, table: &mut ConverterTable) -> ResolutionResult<()> {
        table.add("text", "upper", |body: &Body| {
            Ok(Body::Text(body.as_text().unwrap_or_default().to_uppercase()))
        });
        Ok(())
    }
}

#[tokio::test]
async fn test_output_type_conversion() {
    let context = RouterContext::builder()
        .register(Extension::TypeConverterLoader(Arc::new(UpperLoader)))
        .build()
        .unwrap();
    context
        .add_route(
            Chain::builder("shout")
                .input_type("text")
                .output_type("upper")
                .process(|exchange: &mut Exchange| {
                    exchange.set_body("hello");
                    Ok(())
                }),
        )
        .await
        .unwrap();

    let exchange = context.send("shout", Exchange::new()).await.unwrap();
    assert_eq!(exchange.body().as_text(), Some("HELLO"));
    assert_eq!(exchange.data_type(), Some("upper"));
}

#[tokio::test]
async fn test_listener_failures_do_not_block_routing() {
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    let context = RouterContext::builder()
        .register(Extension::Component(Arc::new(Named("mock"))))
        .listener(Arc::new(|_: &Notification| -> Result<(), String> {
            Err("listener down".to_string())
        }))
        .listener(Arc::new(move |notification: &Notification| -> Result<(), String> {
            if matches!(notification, Notification::EndpointRegistering { .. }) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }))
        .build()
        .unwrap();

    context
        .add_route(Chain::builder("r").to("mock:a").to("mock:b").to("mock:a"))
        .await
        .unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
}

#[test]
fn test_resolver_is_a_provider() {
    let resolver = InMemoryResourceResolver::new("mem");
    assert_eq!(resolver.scheme(), "mem");
    assert_eq!(Provider::name(&resolver), "mem-resolver");
}
