use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use evalq_engine::{
    start_bridge, BridgeConfig, BridgeError, BridgeEvent, CalcEvaluator, ContextConfig,
    ContextHandle, Evaluator, OutputStreams, WorkerState,
};
use tokio::sync::mpsc;

/// Records every evaluation interval and the peak number of concurrent calls.
#[derive(Default)]
struct Recorder {
    active: AtomicUsize,
    peak: AtomicUsize,
    intervals: Mutex<Vec<(Instant, Instant)>>,
}

struct Recording(Arc<Recorder>);

impl Evaluator for Recording {
    type Context = Vec<String>;

    fn new_context(&self, _config: &ContextConfig) -> Vec<String> {
        Vec::new()
    }

    fn evaluate(&self, ctx: &mut Vec<String>, input: &str, out: &mut OutputStreams) {
        let rec = &self.0;
        let start = Instant::now();
        let now_active = rec.active.fetch_add(1, Ordering::SeqCst) + 1;
        rec.peak.fetch_max(now_active, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(1));
        ctx.push(input.to_string());
        out.stdout.push_str(&format!("{}:{}\n", ctx.len(), input));
        rec.active.fetch_sub(1, Ordering::SeqCst);
        rec.intervals.lock().unwrap().push((start, Instant::now()));
    }
}

/// Blocks inside the engine on input `"block"` until released.
struct Gate {
    started: mpsc::UnboundedSender<()>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl Evaluator for Gate {
    type Context = ();

    fn new_context(&self, _config: &ContextConfig) {}

    fn evaluate(&self, _ctx: &mut (), input: &str, out: &mut OutputStreams) {
        if input == "block" {
            let _ = self.started.send(());
            let _ = self.release.lock().unwrap().recv();
        }
        out.stdout.push_str(input);
    }
}

fn gate() -> (Gate, mpsc::UnboundedReceiver<()>, std_mpsc::Sender<()>) {
    let (started_tx, started_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    (
        Gate {
            started: started_tx,
            release: Mutex::new(release_rx),
        },
        started_rx,
        release_tx,
    )
}

struct Panicky;

impl Evaluator for Panicky {
    type Context = ();

    fn new_context(&self, _config: &ContextConfig) {}

    fn evaluate(&self, _ctx: &mut (), input: &str, out: &mut OutputStreams) {
        if input == "boom" {
            panic!("engine exploded");
        }
        out.stdout.push_str("ok\n");
    }
}

#[tokio::test]
async fn round_trip_text() {
    let handle = start_bridge(BridgeConfig::multi(), CalcEvaluator);
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();

    let out = bridge.submit(Some(ctx), "2 + 2").unwrap().output().await.unwrap();
    assert_eq!(out.stdout, "4\n");
    assert_eq!(out.stderr, "");
    assert!(out.success());

    let bad = bridge.submit(Some(ctx), "2 +").unwrap().output().await.unwrap();
    assert_eq!(bad.stdout, "");
    assert!(!bad.stderr.is_empty());
    assert!(!bad.success());

    let after = bridge.submit(Some(ctx), "3 * 3").unwrap().output().await.unwrap();
    assert_eq!(after.stdout, "9\n");

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn callbacks_fire_in_admission_order() {
    let handle = start_bridge(BridgeConfig::multi(), CalcEvaluator);
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    for i in 0..50 {
        let seen = seen.clone();
        let id = bridge
            .submit_with(Some(ctx), format!("{i}"), move |stdout, stderr| {
                assert_eq!(stderr, "");
                seen.lock().unwrap().push(stdout);
            })
            .unwrap();
        ids.push(id);
    }
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    handle.request_stop();
    handle.wait().await.unwrap();

    let expected: Vec<String> = (0..50).map(|i| format!("{i}\n")).collect();
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_evaluation_at_a_time() {
    let recorder = Arc::new(Recorder::default());
    let handle = start_bridge(BridgeConfig::multi(), Recording(recorder.clone()));
    let bridge = handle.bridge();

    let mut producers = Vec::new();
    for p in 0..8 {
        let bridge = bridge.clone();
        producers.push(tokio::spawn(async move {
            let ctx = bridge.new_context().unwrap();
            let mut tickets = Vec::new();
            for i in 0..10 {
                tickets.push(bridge.submit(Some(ctx), format!("p{p}-{i}")).unwrap());
            }
            let mut outputs = Vec::new();
            for ticket in tickets {
                outputs.push(ticket.output().await.unwrap().stdout);
            }
            outputs
        }));
    }

    for (p, producer) in producers.into_iter().enumerate() {
        let outputs = producer.await.unwrap();
        let expected: Vec<String> = (0..10).map(|i| format!("{}:p{p}-{i}\n", i + 1)).collect();
        assert_eq!(outputs, expected);
    }

    assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
    let mut intervals = recorder.intervals.lock().unwrap().clone();
    assert_eq!(intervals.len(), 80);
    intervals.sort_by_key(|(start, _)| *start);
    for pair in intervals.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "evaluations overlapped");
    }

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn full_queue_rejects_without_blocking() {
    let (gate, mut started, release) = gate();
    let handle = start_bridge(BridgeConfig::multi().with_queue_capacity(3), gate);
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();

    let blocker = bridge.submit(Some(ctx), "block").unwrap();
    started.recv().await.unwrap();

    let mut tickets = Vec::new();
    for i in 0..3 {
        tickets.push(bridge.submit(Some(ctx), format!("job{i}")).unwrap());
    }
    assert_eq!(handle.snapshot().queued, 3);
    let err = bridge.submit(Some(ctx), "overflow").unwrap_err();
    assert_eq!(err, BridgeError::QueueFull { capacity: 3 });
    assert!(!err.is_fatal());

    release.send(()).unwrap();
    assert_eq!(blocker.output().await.unwrap().stdout, "block");
    for (i, ticket) in tickets.into_iter().enumerate() {
        assert_eq!(ticket.output().await.unwrap().stdout, format!("job{i}"));
    }

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn handle_lifecycle() {
    let handle = start_bridge(BridgeConfig::multi(), CalcEvaluator);
    let bridge = handle.bridge();

    let a = bridge.new_context().unwrap();
    let b = bridge.new_context().unwrap();
    assert!(bridge.is_live(a));

    bridge.destroy_context(a).unwrap();
    bridge.destroy_context(a).unwrap();
    bridge.destroy_context(ContextHandle::from_raw(1000)).unwrap();
    assert!(!bridge.is_live(a));

    let err = bridge.submit(Some(a), "1").unwrap_err();
    assert_eq!(err, BridgeError::InvalidHandle(a));
    assert!(err.is_fatal());

    let err = bridge.submit(None, "1").unwrap_err();
    assert_eq!(err, BridgeError::MissingHandle);

    let c = bridge.new_context().unwrap();
    assert_ne!(c, a);
    assert_eq!(c.index(), 2);
    assert_eq!(bridge.submit(Some(b), "1 + 1").unwrap().output().await.unwrap().stdout, "2\n");
    assert_eq!(handle.snapshot().live_contexts, 2);

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn contexts_are_isolated() {
    let handle = start_bridge(BridgeConfig::multi(), CalcEvaluator);
    let bridge = handle.bridge();
    let a = bridge.new_context().unwrap();
    let b = bridge.new_context().unwrap();

    bridge.submit(Some(a), "x = 41").unwrap().output().await.unwrap();
    let in_a = bridge.submit(Some(a), "x + 1").unwrap().output().await.unwrap();
    let in_b = bridge.submit(Some(b), "x + 1").unwrap().output().await.unwrap();
    assert_eq!(in_a.stdout, "42\n");
    assert_eq!(in_b.stderr, "error: undefined: x\n");

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn destroy_after_admission_still_runs_the_job() {
    let (gate, mut started, release) = gate();
    let handle = start_bridge(BridgeConfig::multi(), gate);
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();

    let blocker = bridge.submit(Some(ctx), "block").unwrap();
    started.recv().await.unwrap();
    let queued = bridge.submit(Some(ctx), "after").unwrap();
    bridge.destroy_context(ctx).unwrap();

    release.send(()).unwrap();
    blocker.output().await.unwrap();
    assert_eq!(queued.output().await.unwrap().stdout, "after");

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn shutdown_drains_admitted_work() {
    let handle = start_bridge(BridgeConfig::multi(), CalcEvaluator);
    let mut events = handle.subscribe();
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();

    let ticket = bridge.submit(Some(ctx), "6 * 7").unwrap();
    handle.request_stop();
    handle.request_stop();
    bridge.request_stop();

    assert_eq!(
        bridge.submit(Some(ctx), "1").unwrap_err(),
        BridgeError::ShuttingDown
    );
    assert_eq!(ticket.output().await.unwrap().stdout, "42\n");

    handle.wait().await.unwrap();
    assert!(bridge.is_stopping());

    let mut stop_requested = 0;
    let mut finished = 0;
    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        match event {
            BridgeEvent::StopRequested => stop_requested += 1,
            BridgeEvent::JobFinished { .. } => finished += 1,
            BridgeEvent::Stopped => stopped = true,
            _ => {}
        }
    }
    assert_eq!(stop_requested, 1);
    assert_eq!(finished, 1);
    assert!(stopped);
}

#[tokio::test]
async fn snapshot_reaches_terminal() {
    let handle = start_bridge(BridgeConfig::multi(), CalcEvaluator);
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();
    for input in ["1", "2 +", "3"] {
        bridge.submit(Some(ctx), input).unwrap().output().await.unwrap();
    }

    let snap = handle.snapshot();
    assert_eq!(snap.completed, 3);
    assert_eq!(snap.recent_jobs.len(), 3);
    assert_eq!(
        snap.recent_jobs.iter().map(|j| j.success).collect::<Vec<_>>(),
        vec![true, false, true]
    );

    let mut snapshots = handle.watch_snapshot();
    handle.request_stop();
    handle.wait().await.unwrap();
    let last = snapshots.borrow_and_update().clone();
    assert_eq!(last.worker, WorkerState::Terminal);
    assert!(last.stop_requested);
}

#[tokio::test]
async fn single_context_mode() {
    let handle = start_bridge(BridgeConfig::single(), CalcEvaluator);
    let bridge = handle.bridge();
    assert_eq!(bridge.config().queue_capacity, 1);

    assert_eq!(bridge.new_context().unwrap_err(), BridgeError::HandlesUnsupported);
    assert_eq!(
        bridge.submit(Some(ContextHandle::from_raw(0)), "1").unwrap_err(),
        BridgeError::HandlesUnsupported
    );

    bridge.submit(None, "y = 5").unwrap().output().await.unwrap();
    let out = bridge.submit(None, "y ** 2").unwrap().output().await.unwrap();
    assert_eq!(out.stdout, "25\n");

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn sessions_own_their_context() {
    let handle = start_bridge(BridgeConfig::multi(), CalcEvaluator);
    let bridge = handle.bridge();

    let session = bridge.session().unwrap();
    let ctx = session.handle();
    session.run("n = 10").await.unwrap();
    assert_eq!(session.run("n / 4").await.unwrap().stdout, "2.5\n");
    assert!(bridge.is_live(ctx));

    drop(session);
    assert!(!bridge.is_live(ctx));

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn engine_and_callback_panics_do_not_stop_the_worker() {
    let handle = start_bridge(BridgeConfig::multi(), Panicky);
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();

    let boom = bridge.submit(Some(ctx), "boom").unwrap().output().await.unwrap();
    assert_eq!(boom.stdout, "");
    assert_eq!(boom.stderr, "internal error: evaluation panicked\n");

    bridge
        .submit_with(Some(ctx), "fine", |_, _| panic!("callback exploded"))
        .unwrap();
    let next = bridge.submit(Some(ctx), "fine").unwrap().output().await.unwrap();
    assert_eq!(next.stdout, "ok\n");

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[test]
fn events_serialize_with_type_tag() {
    let event = BridgeEvent::ContextCreated {
        handle: ContextHandle::from_raw(3),
    };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json, serde_json::json!({ "type": "ContextCreated", "handle": 3 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_ids_follow_execution_order_without_gaps() {
    let handle = start_bridge(BridgeConfig::multi().with_queue_capacity(4), CalcEvaluator);
    let mut events = handle.subscribe();
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();

    let mut producers = Vec::new();
    for p in 0..4 {
        let bridge = bridge.clone();
        producers.push(tokio::spawn(async move {
            let mut tickets = Vec::new();
            for i in 0..25 {
                loop {
                    match bridge.submit(Some(ctx), format!("{p} * 100 + {i}")) {
                        Ok(ticket) => {
                            tickets.push(ticket);
                            break;
                        }
                        Err(BridgeError::QueueFull { .. }) => tokio::task::yield_now().await,
                        Err(err) => panic!("unexpected rejection: {err}"),
                    }
                }
            }
            for ticket in tickets {
                assert!(ticket.output().await.unwrap().success());
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    handle.request_stop();
    handle.wait().await.unwrap();

    let mut started = Vec::new();
    let mut finished = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            BridgeEvent::JobStarted { job_id, .. } => started.push(job_id),
            BridgeEvent::JobFinished { outcome } => finished.push(outcome.job_id),
            _ => {}
        }
    }
    let expected: Vec<u64> = (1..=100).collect();
    assert_eq!(started, expected);
    assert_eq!(finished, expected);
}

#[tokio::test]
async fn rejected_submissions_do_not_consume_ids() {
    let (gate, mut started, release) = gate();
    let handle = start_bridge(BridgeConfig::multi().with_queue_capacity(1), gate);
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();

    let first = bridge.submit(Some(ctx), "block").unwrap();
    started.recv().await.unwrap();
    let second = bridge.submit(Some(ctx), "b").unwrap();
    for _ in 0..3 {
        assert!(matches!(
            bridge.submit(Some(ctx), "c"),
            Err(BridgeError::QueueFull { .. })
        ));
    }
    assert_eq!((first.job_id(), second.job_id()), (1, 2));

    release.send(()).unwrap();
    first.output().await.unwrap();
    second.output().await.unwrap();
    let third = bridge.submit(Some(ctx), "c").unwrap();
    assert_eq!(third.job_id(), 3);
    assert_eq!(third.output().await.unwrap().job_id, 3);

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn contexts_can_override_default_options() {
    let handle = start_bridge(BridgeConfig::multi(), CalcEvaluator);
    let bridge = handle.bridge();
    let restricted = bridge.new_context().unwrap();
    let open = bridge
        .new_context_with(ContextConfig { restricted: false })
        .unwrap();

    let dir = std::env::temp_dir().join("evalq-missing-dir-for-load");
    let command = format!(")load {}", dir.join("vars.json").display());

    let out = bridge.submit(Some(restricted), command.as_str()).unwrap().output().await.unwrap();
    assert_eq!(out.stderr, "error: )load is disabled in restricted mode\n");

    let out = bridge.submit(Some(open), command.as_str()).unwrap().output().await.unwrap();
    assert!(out.stderr.starts_with("error: "));
    assert!(out.stderr.contains("vars.json"));

    handle.request_stop();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn deeply_nested_input_is_reported_and_the_worker_continues() {
    let handle = start_bridge(BridgeConfig::multi(), CalcEvaluator);
    let bridge = handle.bridge();
    let ctx = bridge.new_context().unwrap();

    let nested = format!("{}1{}", "(".repeat(20_000), ")".repeat(20_000));
    let out = bridge.submit(Some(ctx), nested).unwrap().output().await.unwrap();
    assert_eq!(out.stdout, "");
    assert_eq!(out.stderr, "error: expression nested too deeply (limit 256)\n");

    let out = bridge.submit(Some(ctx), "2 + 2").unwrap().output().await.unwrap();
    assert_eq!(out.stdout, "4\n");

    handle.request_stop();
    handle.wait().await.unwrap();
}
