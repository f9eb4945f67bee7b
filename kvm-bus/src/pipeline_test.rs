use super::*;

use std::sync::atomic::AtomicUsize;

use tokio::sync::mpsc;

use crate::buffer::{BufferSender, buffer_channel};
use crate::context::Timeouts;
use crate::graph::Backend;
use crate::sim::{SimBackend, SimGraph};

struct TestEncoder {
    running: AtomicBool,
    queue: BufferSender,
}

impl Encoder for TestEncoder {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn input_queue(&self) -> &BufferSender {
        &self.queue
    }
}

fn test_encoder(capacity: usize) -> (Arc<TestEncoder>, BufferReceiver) {
    let (queue, rx) = buffer_channel(capacity);
    let encoder = Arc::new(TestEncoder {
        running: AtomicBool::new(true),
        queue,
    });
    (encoder, rx)
}

struct Fixture {
    backend: Arc<SimBackend>,
    ctx: Arc<MediaContext>,
    fatal: Arc<Mutex<Vec<String>>>,
}

fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = SimBackend::new();
    let fatal = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&fatal);
    let ctx = MediaContext::new(backend.clone())
        .with_timeouts(Timeouts {
            poll_interval: Duration::from_millis(10),
            stop: Duration::from_millis(300),
            encoder_stop: Duration::from_millis(300),
            startup: Duration::from_secs(2),
        })
        .with_fatal_hook(Arc::new(move |msg: &str| recorded.lock().push(msg.to_string())));
    Fixture {
        backend,
        ctx: Arc::new(ctx),
        fatal,
    }
}

impl Fixture {
    fn capture(&self, options: PipelineOptions) -> (Arc<PipelineController>, Arc<SimGraph>) {
        let graph = self
            .backend
            .parse_launch("fakesrc name=src ! appsink name=appsink")
            .unwrap();
        let pipeline = PipelineController::new(
            &self.ctx,
            graph,
            "test",
            MediaType::Video,
            options.with_output_stage("appsink"),
        )
        .unwrap();
        (pipeline, self.backend.last_graph().unwrap())
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn drain(rx: &mut BufferReceiver) -> Vec<Buffer> {
    let mut out = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        if let BufferCmd::Data(buffer) = cmd {
            out.push(buffer);
        }
    }
    out
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_prefix_names_component() {
    let f = fixture();
    let (pipeline, _) = f.capture(PipelineOptions::new());
    assert_eq!(pipeline.prefix(), "[pipe#0 video test]");
    assert_eq!(pipeline.state(), PipelineState::Created);
    pipeline.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fan_out_shares_one_buffer() {
    let f = fixture();
    let (pipeline, _) = f.capture(PipelineOptions::new());
    let (a, mut rx_a) = test_encoder(4);
    let (b, mut rx_b) = test_encoder(4);
    let (c, mut rx_c) = test_encoder(4);
    assert!(pipeline.add_encoder(a.clone()));
    assert!(pipeline.add_encoder(b.clone()));
    assert!(pipeline.add_encoder(c.clone()));
    assert!(!pipeline.add_encoder(a.clone()));
    assert_eq!(pipeline.encoder_count(), 3);

    let buffer = Buffer::new(vec![7u8; 64]);
    assert_eq!(buffer.ref_count(), 1);
    assert_eq!(pipeline.send_buffer(&buffer), 3);
    assert_eq!(buffer.ref_count(), 4);

    let got: Vec<Buffer> = [&mut rx_a, &mut rx_b, &mut rx_c]
        .into_iter()
        .flat_map(drain)
        .collect();
    assert_eq!(got.len(), 3);
    assert!(got.iter().all(|b| b.ptr_eq(&buffer)));

    drop(got);
    assert_eq!(buffer.ref_count(), 1);
    pipeline.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_and_removed_encoders_are_skipped() {
    let f = fixture();
    let (pipeline, _) = f.capture(PipelineOptions::new());
    let (idle, mut rx_idle) = test_encoder(4);
    let (removed, mut rx_removed) = test_encoder(4);
    let (live, mut rx_live) = test_encoder(4);
    idle.running.store(false, Ordering::SeqCst);

    pipeline.add_encoder(idle.clone());
    pipeline.add_encoder(removed.clone());
    pipeline.add_encoder(live.clone());
    let removed_dyn: Arc<dyn Encoder> = removed.clone();
    assert!(pipeline.remove_encoder(&removed_dyn));
    assert!(!pipeline.remove_encoder(&removed_dyn));

    let buffer = Buffer::new(vec![1u8; 8]);
    assert_eq!(pipeline.send_buffer(&buffer), 1);
    assert!(drain(&mut rx_idle).is_empty());
    assert!(drain(&mut rx_removed).is_empty());
    assert_eq!(drain(&mut rx_live).len(), 1);
    assert_eq!(buffer.ref_count(), 1);
    pipeline.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_queue_stops_fan_out() {
    let f = fixture();
    let (pipeline, _) = f.capture(PipelineOptions::new());
    let (first, mut rx_first) = test_encoder(4);
    let (narrow, mut rx_narrow) = test_encoder(1);
    let (last, mut rx_last) = test_encoder(4);
    pipeline.add_encoder(first.clone());
    pipeline.add_encoder(narrow.clone());
    pipeline.add_encoder(last.clone());

    assert_eq!(pipeline.send_buffer(&Buffer::new(vec![0u8])), 3);
    // narrow is now full: first still gets the unit, last does not
    assert_eq!(pipeline.send_buffer(&Buffer::new(vec![1u8])), 1);

    assert_eq!(drain(&mut rx_first).len(), 2);
    assert_eq!(drain(&mut rx_narrow).len(), 1);
    assert_eq!(drain(&mut rx_last).len(), 1);
    pipeline.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_queue_is_skipped() {
    let f = fixture();
    let (pipeline, _) = f.capture(PipelineOptions::new());
    let (gone, rx_gone) = test_encoder(4);
    let (live, mut rx_live) = test_encoder(4);
    drop(rx_gone);
    pipeline.add_encoder(gone.clone());
    pipeline.add_encoder(live.clone());

    assert_eq!(pipeline.send_buffer(&Buffer::new(vec![0u8])), 1);
    assert_eq!(drain(&mut rx_live).len(), 1);
    pipeline.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_emitted_frames_reach_encoders() {
    let f = fixture();
    let (pipeline, sim) = f.capture(PipelineOptions::new());
    let (encoder, mut rx) = test_encoder(8);
    pipeline.add_encoder(encoder.clone());

    pipeline.start().unwrap();
    wait_until(|| pipeline.state() == PipelineState::Playing).await;

    for i in 0..3u8 {
        assert!(sim.emit(Buffer::new(vec![i; 4])));
    }
    for i in 0..3u8 {
        let cmd = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match cmd {
            BufferCmd::Data(buffer) => assert_eq!(buffer.data().as_ref(), &[i; 4]),
            BufferCmd::Eos => panic!("unexpected eos"),
        }
    }
    assert_eq!(pipeline.frames_generated(), 3);

    pipeline.stop().await;
    assert_eq!(pipeline.state(), PipelineState::CleanedUp);
    assert_eq!(sim.eos_events(), 1);
    assert_eq!(sim.current_state(), GraphState::Null);
    assert!(sim.element_names().is_empty());
    assert_eq!(sim.removed_elements(), vec!["src", "appsink"]);
    assert!(f.fatal.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_twice_and_after_stop() {
    let f = fixture();
    let (pipeline, _) = f.capture(PipelineOptions::new());
    pipeline.start().unwrap();

    let err = pipeline.start().unwrap_err();
    assert!(matches!(
        crate::error::kind(&err),
        Some(PipelineError::AlreadyRunning)
    ));

    pipeline.stop().await;
    let err = pipeline.start().unwrap_err();
    assert!(matches!(crate::error::kind(&err), Some(PipelineError::Stopped)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_stop_cleans_up_once() {
    let f = fixture();
    let (pipeline, sim) = f.capture(PipelineOptions::new());
    pipeline.start().unwrap();
    wait_until(|| pipeline.state() == PipelineState::Playing).await;

    tokio::join!(pipeline.stop(), pipeline.stop(), pipeline.stop());
    assert!(pipeline.is_cleaned_up());
    assert_eq!(sim.eos_events(), 1);
    assert_eq!(sim.removed_elements().len(), 2);

    pipeline.stop().await;
    assert_eq!(sim.eos_events(), 1);
    assert_eq!(sim.removed_elements().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_before_start() {
    let f = fixture();
    let (pipeline, sim) = f.capture(PipelineOptions::new());
    pipeline.stop().await;

    assert!(pipeline.is_cleaned_up());
    assert_eq!(sim.eos_events(), 0);
    assert_eq!(sim.removed_elements().len(), 2);
    assert!(pipeline.start().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_handler_runs_once_and_skips_eos() {
    let f = fixture();
    let (pipeline, sim) = f.capture(PipelineOptions::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut failures) = mpsc::unbounded_channel();
    let counter = Arc::clone(&calls);
    pipeline.set_failure_handler(Arc::new(move |err: PipelineError| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(err);
    }));

    pipeline.start().unwrap();
    wait_until(|| pipeline.state() == PipelineState::Playing).await;
    sim.inject_error("src", "device unplugged");
    sim.inject_error("src", "device unplugged again");

    let err = tokio::time::timeout(Duration::from_secs(2), failures.recv())
        .await
        .unwrap()
        .unwrap();
    match err {
        PipelineError::Failed { source, message } => {
            assert_eq!(source, "src");
            assert_eq!(message, "device unplugged");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(pipeline.has_failed());
    assert_eq!(pipeline.state(), PipelineState::Failed);

    pipeline.stop().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sim.eos_events(), 0);
    assert!(pipeline.is_cleaned_up());
    assert_eq!(sim.removed_elements().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_eos_runs_handler() {
    let f = fixture();
    let (tx, mut ended) = mpsc::unbounded_channel();
    let (pipeline, sim) = f.capture(PipelineOptions::new().with_eos_handler(Arc::new(move || {
        let _ = tx.send(());
    })));
    pipeline.start().unwrap();
    wait_until(|| pipeline.state() == PipelineState::Playing).await;

    assert!(sim.send_eos());
    tokio::time::timeout(Duration::from_secs(2), ended.recv())
        .await
        .unwrap()
        .unwrap();
    wait_until(|| pipeline.is_cleaned_up()).await;
    assert!(!pipeline.has_failed());

    pipeline.stop().await;
    assert_eq!(sim.removed_elements().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stuck_teardown_goes_to_fatal_hook() {
    let f = fixture();
    let (pipeline, sim) = f.capture(PipelineOptions::new());
    pipeline.start().unwrap();
    wait_until(|| pipeline.state() == PipelineState::Playing).await;

    sim.stall_eos(true);
    pipeline.stop().await;
    {
        let fatal = f.fatal.lock();
        assert_eq!(fatal.len(), 1);
        assert!(fatal[0].contains("stop timed out"), "{}", fatal[0]);
    }

    // the forced null lets the bus loop finish teardown
    wait_until(|| pipeline.is_cleaned_up()).await;
    assert_eq!(sim.current_state(), GraphState::Null);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_input_stage_forwards_buffers() {
    let f = fixture();
    let graph = f
        .backend
        .parse_launch("appsrc name=appsrc ! fakeenc name=enc ! fakesink name=sink")
        .unwrap();
    let sim = f.backend.last_graph().unwrap();
    let (tx, rx) = buffer_channel(4);
    let pipeline = PipelineController::new(
        &f.ctx,
        graph,
        "forward",
        MediaType::Audio,
        PipelineOptions::new().with_input_stage("appsrc", rx),
    )
    .unwrap();
    pipeline.start().unwrap();

    tx.send(BufferCmd::Data(Buffer::new(vec![1u8]))).await.unwrap();
    tx.send(BufferCmd::Data(Buffer::new(vec![2u8]))).await.unwrap();
    wait_until(|| sim.pushed() == 2).await;

    pipeline.stop().await;
    assert!(pipeline.is_cleaned_up());
}

#[test]
fn test_missing_output_stage_is_rejected() {
    let f = fixture();
    let graph = f.backend.parse_launch("fakesrc ! fakesink").unwrap();
    let err = PipelineController::new(
        &f.ctx,
        graph,
        "broken",
        MediaType::Video,
        PipelineOptions::new().with_output_stage("appsink"),
    )
    .err()
    .unwrap();
    assert!(matches!(
        crate::error::kind(&err),
        Some(PipelineError::MissingElement(name)) if name == "appsink"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_registration_churn_during_fan_out() {
    const ROUNDS: usize = 500;
    let f = fixture();
    let (pipeline, _) = f.capture(PipelineOptions::new());
    let (stable, mut rx_stable) = test_encoder(ROUNDS);
    assert!(pipeline.add_encoder(stable.clone()));

    let churn = {
        let pipeline = Arc::clone(&pipeline);
        std::thread::spawn(move || {
            let mut receivers = Vec::new();
            for _ in 0..ROUNDS {
                let (transient, rx) = test_encoder(ROUNDS);
                let transient: Arc<dyn Encoder> = transient;
                assert!(pipeline.add_encoder(Arc::clone(&transient)));
                assert!(pipeline.remove_encoder(&transient));
                receivers.push(rx);
            }
            receivers
        })
    };

    let buffer = Buffer::new(vec![7u8; 8]);
    for _ in 0..ROUNDS {
        assert!(pipeline.send_buffer(&buffer) >= 1);
    }
    let transient_receivers = churn.join().unwrap();

    assert_eq!(pipeline.encoder_count(), 1);
    let received = drain(&mut rx_stable);
    assert_eq!(received.len(), ROUNDS);
    assert!(received.iter().all(|b| b.ptr_eq(&buffer)));
    drop(received);
    for mut rx in transient_receivers {
        drain(&mut rx);
    }
    assert_eq!(buffer.ref_count(), 1);
    pipeline.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_racing_start_tears_down() {
    let f = fixture();
    for _ in 0..20 {
        let (pipeline, sim) = f.capture(PipelineOptions::new());
        let starter = Arc::clone(&pipeline);
        let start = tokio::spawn(async move { starter.start() });
        pipeline.stop().await;
        let started = start.await.unwrap();

        if let Err(err) = started {
            assert!(
                matches!(crate::error::kind(&err), Some(PipelineError::Stopped)),
                "{:#}",
                err
            );
        }
        wait_until(|| pipeline.is_cleaned_up()).await;
        assert_eq!(sim.current_state(), GraphState::Null);
        assert!(sim.element_names().is_empty());
        // bus loop and output puller have exited
        wait_until(|| Arc::strong_count(&pipeline) == 1).await;
    }
    assert!(f.fatal.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_eos_command_ends_input_stage() {
    let f = fixture();
    let graph = f
        .backend
        .parse_launch("appsrc name=appsrc ! fakeenc name=enc ! fakesink name=sink")
        .unwrap();
    let sim = f.backend.last_graph().unwrap();
    let (tx, rx) = buffer_channel(4);
    let pipeline = PipelineController::new(
        &f.ctx,
        graph,
        "forward",
        MediaType::Audio,
        PipelineOptions::new().with_input_stage("appsrc", rx),
    )
    .unwrap();
    pipeline.start().unwrap();

    tx.send(BufferCmd::Data(Buffer::new(vec![1u8]))).await.unwrap();
    wait_until(|| sim.pushed() == 1).await;
    tx.send(BufferCmd::Eos).await.unwrap();
    wait_until(|| tx.is_closed()).await;

    assert!(matches!(
        tx.try_send(BufferCmd::Data(Buffer::new(vec![2u8]))),
        Err(TrySendError::Closed(_))
    ));
    assert_eq!(sim.pushed(), 1);

    pipeline.stop().await;
    assert!(pipeline.is_cleaned_up());
}
