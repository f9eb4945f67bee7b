use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{Buffer, BufferCmd, BufferReceiver},
    context::MediaContext,
    encoder::Encoder,
    error::PipelineError,
    graph::{BusMessage, Graph, GraphState, InputStage, OutputStage},
    registry::ConcurrentSlice,
    sample::MediaType,
};

pub type FailureHandler = Arc<dyn Fn(PipelineError) + Send + Sync>;
pub type EosHandler = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle of one controller as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Starting,
    Playing,
    Stopping,
    CleanedUp,
    Failed,
}

/// Registered consumer, compared by identity.
#[derive(Clone)]
pub struct EncoderRef(Arc<dyn Encoder>);

impl PartialEq for EncoderRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Default)]
pub struct PipelineOptions {
    output_stage: Option<String>,
    input_stage: Option<(String, BufferReceiver)>,
    on_eos: Option<EosHandler>,
}

impl PipelineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull raw units from the named appsink and fan them out to encoders.
    pub fn with_output_stage(mut self, name: &str) -> Self {
        self.output_stage = Some(name.to_string());
        self
    }

    /// Forward buffers received on `input` into the named appsrc.
    pub fn with_input_stage(mut self, name: &str, input: BufferReceiver) -> Self {
        self.input_stage = Some((name.to_string(), input));
        self
    }

    pub fn with_eos_handler(mut self, handler: EosHandler) -> Self {
        self.on_eos = Some(handler);
        self
    }
}

/// Owns one native graph from construction to teardown and fans its output
/// out to registered encoders.
///
/// `start` must be called from within a tokio runtime: the bus loop and the
/// output puller run on the blocking pool, the input forwarder on the runtime.
pub struct PipelineController {
    prefix: String,
    media_type: MediaType,
    ctx: Arc<MediaContext>,
    graph: Mutex<Option<Arc<dyn Graph>>>,
    output: Option<Arc<dyn OutputStage>>,
    input: Option<Arc<dyn InputStage>>,
    input_rx: Mutex<Option<BufferReceiver>>,
    input_task: Mutex<Option<JoinHandle<()>>>,
    encoders: ConcurrentSlice<EncoderRef>,
    lifecycle: Mutex<()>,
    is_starting: AtomicBool,
    is_stopping: AtomicBool,
    has_failed: AtomicBool,
    cleaned_up: AtomicBool,
    graph_state: watch::Sender<GraphState>,
    cleaned: watch::Sender<bool>,
    cancel: CancellationToken,
    on_eos: Option<EosHandler>,
    on_failure: Mutex<Option<FailureHandler>>,
    frames: AtomicU64,
}

impl PipelineController {
    pub fn new(
        ctx: &Arc<MediaContext>,
        graph: Arc<dyn Graph>,
        label: &str,
        media_type: MediaType,
        options: PipelineOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let output = match options.output_stage {
            Some(ref name) => Some(
                graph
                    .output_stage(name)
                    .ok_or(PipelineError::MissingElement(name.clone()))?,
            ),
            None => None,
        };
        let (input, input_rx) = match options.input_stage {
            Some((name, rx)) => (
                Some(
                    graph
                        .input_stage(&name)
                        .ok_or(PipelineError::MissingElement(name))?,
                ),
                Some(rx),
            ),
            None => (None, None),
        };

        let id = ctx.next_id();
        Ok(Arc::new(Self {
            prefix: format!("[pipe#{} {} {}]", id, media_type, label),
            media_type,
            ctx: Arc::clone(ctx),
            graph: Mutex::new(Some(graph)),
            output,
            input,
            input_rx: Mutex::new(input_rx),
            input_task: Mutex::new(None),
            encoders: ConcurrentSlice::new(),
            lifecycle: Mutex::new(()),
            is_starting: AtomicBool::new(false),
            is_stopping: AtomicBool::new(false),
            has_failed: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            graph_state: watch::Sender::new(GraphState::Null),
            cleaned: watch::Sender::new(false),
            cancel: CancellationToken::new(),
            on_eos: options.on_eos,
            on_failure: Mutex::new(None),
            frames: AtomicU64::new(0),
        }))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn state(&self) -> PipelineState {
        if self.has_failed.load(Ordering::SeqCst) {
            PipelineState::Failed
        } else if self.cleaned_up.load(Ordering::SeqCst) {
            PipelineState::CleanedUp
        } else if self.is_stopping.load(Ordering::SeqCst) {
            PipelineState::Stopping
        } else if *self.graph_state.borrow() == GraphState::Playing {
            PipelineState::Playing
        } else if self.is_starting.load(Ordering::SeqCst) {
            PipelineState::Starting
        } else {
            PipelineState::Created
        }
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.has_failed.load(Ordering::SeqCst)
    }

    /// Raw units pulled from the graph so far.
    pub fn frames_generated(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.len()
    }

    /// Invoked at most once, off the bus thread, on the first graph error.
    pub fn set_failure_handler(&self, handler: FailureHandler) {
        *self.on_failure.lock() = Some(handler);
    }

    /// Register an encoder for fan-out. Returns false if it was already registered.
    pub fn add_encoder(&self, encoder: Arc<dyn Encoder>) -> bool {
        let added = self.encoders.push_unique(EncoderRef(encoder));
        if added {
            log::debug!("{} encoder added, total {}", self.prefix, self.encoders.len());
        }
        added
    }

    /// Returns false if the encoder was not registered.
    pub fn remove_encoder(&self, encoder: &Arc<dyn Encoder>) -> bool {
        let removed = self.encoders.remove_item(&EncoderRef(Arc::clone(encoder)));
        if removed {
            log::debug!("{} encoder removed, total {}", self.prefix, self.encoders.len());
        }
        removed
    }

    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.is_stopping.load(Ordering::SeqCst) {
            return Err(PipelineError::Stopped.into());
        }
        if self.is_starting.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning.into());
        }
        let graph = self.graph.lock().clone().ok_or(PipelineError::Stopped)?;

        let runtime = tokio::runtime::Handle::current();
        let this = Arc::clone(self);
        let bus_graph = Arc::clone(&graph);
        tokio::task::spawn_blocking(move || this.bus_loop(bus_graph, runtime));

        graph
            .set_state(GraphState::Playing)
            .map_err(|e| anyhow::anyhow!("{} failed to start: {:#}", self.prefix, e))?;
        log::info!("{} starting", self.prefix);

        if let Some(output) = self.output.as_ref() {
            self.spawn_output_puller(Arc::clone(output));
        }
        if let Some(input) = self.input.as_ref() {
            if let Some(rx) = self.input_rx.lock().take() {
                self.spawn_input_forwarder(Arc::clone(input), rx);
            }
        }

        Ok(())
    }

    /// Drain the graph and wait for cleanup. Safe to call repeatedly, concurrently,
    /// or before `start`; every caller returns once the graph is torn down.
    /// A teardown that exceeds the stop timeout goes to the fatal hook.
    pub async fn stop(&self) {
        let timeout = self.ctx.timeouts().stop;
        let mut cleaned_rx = self.cleaned.subscribe();
        if self.is_stopping.swap(true, Ordering::SeqCst) {
            let _ = tokio::time::timeout(timeout, cleaned_rx.wait_for(|c| *c)).await;
            return;
        }

        // let an in-flight start finish launching its tasks
        drop(self.lifecycle.lock());

        log::info!("{} stopping...", self.prefix);
        self.cancel.cancel();
        let input_task = self.input_task.lock().take();
        if let Some(task) = input_task {
            let _ = task.await;
        }

        let graph = self.graph.lock().clone();
        if !self.is_starting.swap(true, Ordering::SeqCst) {
            // no bus loop will ever run
            if let Some(graph) = graph {
                let poll = self.ctx.timeouts().poll_interval;
                if let Err(e) = graph.set_state(GraphState::Null) {
                    log::error!("{} pipe to null error: {:#}", self.prefix, e);
                }
                self.cleanup(&graph, poll);
            }
            return;
        }

        if let Some(graph) = graph {
            if self.has_failed.load(Ordering::SeqCst) {
                log::error!("{} this pipeline has failed, no need for eos", self.prefix);
                if let Err(e) = graph.set_state(GraphState::Null) {
                    log::error!("{} pipe to null error: {:#}", self.prefix, e);
                }
            } else if !graph.send_eos() {
                log::warn!("{} graph refused eos, forcing null", self.prefix);
                if let Err(e) = graph.set_state(GraphState::Null) {
                    log::error!("{} pipe to null error: {:#}", self.prefix, e);
                }
            }

            match tokio::time::timeout(timeout, cleaned_rx.wait_for(|c| *c)).await {
                Ok(_) => log::info!("{} clean up complete", self.prefix),
                Err(_) => {
                    self.ctx
                        .fatal(&format!("{} stop timed out after {:?}", self.prefix, timeout));
                    // only reached when the fatal hook returns
                    let _ = graph.set_state(GraphState::Null);
                }
            }
        } else {
            log::debug!("{} already cleaned up", self.prefix);
        }
    }

    /// Deliver one raw unit to every running encoder, in registration order.
    ///
    /// A saturated input queue stops delivery of this buffer to that encoder and
    /// to every encoder after it. Returns how many encoders got a reference.
    pub fn send_buffer(&self, buffer: &Buffer) -> usize {
        let mut delivered = 0;
        for encoder in self.encoders.values() {
            if !encoder.0.is_running() {
                continue;
            }

            let queue = encoder.0.input_queue();
            match queue.try_send(BufferCmd::Data(buffer.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "{} inputChan is full, mediaType: {}, len: {}",
                        self.prefix,
                        self.media_type,
                        queue.max_capacity() - queue.capacity()
                    );
                    return delivered;
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("{} encoder input closed, skipping", self.prefix);
                }
            }
        }
        delivered
    }

    fn bus_loop(self: Arc<Self>, graph: Arc<dyn Graph>, runtime: tokio::runtime::Handle) {
        let poll = self.ctx.timeouts().poll_interval;
        let top_level = graph.name();
        loop {
            let msg = match graph.pop_message(poll) {
                Some(msg) => msg,
                None => {
                    if self.is_stopping.load(Ordering::SeqCst)
                        && graph.state(Duration::ZERO) == GraphState::Null
                    {
                        log::warn!("{} graph went null without eos", self.prefix);
                        break;
                    }
                    continue;
                }
            };

            match msg {
                BusMessage::StateChanged { source, old, new } => {
                    if source != top_level {
                        continue;
                    }
                    log::info!(
                        "{} state changed, source: {}, old: {}, new: {}",
                        self.prefix,
                        source,
                        old,
                        new
                    );
                    self.graph_state.send_replace(new);
                }
                BusMessage::Eos => {
                    log::info!("{} eos", self.prefix);
                    if let Err(e) = graph.set_state(GraphState::Null) {
                        log::error!("{} pipe to null error: {:#}", self.prefix, e);
                    }
                    if let Some(handler) = self.on_eos.as_ref() {
                        handler();
                    }
                    break;
                }
                BusMessage::Error { source, message } => {
                    if let Err(e) = graph.set_state(GraphState::Null) {
                        log::error!("{} pipe to null error: {:#}", self.prefix, e);
                    }
                    if self.has_failed.swap(true, Ordering::SeqCst) {
                        return;
                    }

                    log::error!("{} pipeline failed at {}: {}", self.prefix, source, message);
                    if let Some(handler) = self.on_failure.lock().take() {
                        let err = PipelineError::Failed { source, message };
                        runtime.spawn_blocking(move || handler(err));
                    }
                    break;
                }
                BusMessage::Other => {}
            }
        }

        self.cleanup(&graph, poll);
    }

    fn cleanup(&self, graph: &Arc<dyn Graph>, poll: Duration) {
        loop {
            let state = graph.state(poll);
            if state == GraphState::Null {
                break;
            }
            log::info!("{} waiting for pipeline to clean up... {}", self.prefix, state);
            if let Err(e) = graph.set_state(GraphState::Null) {
                log::error!("{} pipe to null error: {:#}", self.prefix, e);
            }
        }

        for element in graph.elements() {
            if let Err(e) = element.set_state_blocking(GraphState::Null) {
                log::error!(
                    "{} failed to stop element {}: {:#}",
                    self.prefix,
                    element.name(),
                    e
                );
            }
            if let Err(e) = graph.remove(&element) {
                log::error!(
                    "{} failed to remove element {}: {:#}",
                    self.prefix,
                    element.name(),
                    e
                );
            }
        }

        self.graph.lock().take();
        self.graph_state.send_replace(GraphState::Null);
        self.cleaned_up.store(true, Ordering::SeqCst);
        self.cleaned.send_replace(true);
        log::info!("{} pipe destroyed", self.prefix);
    }

    fn spawn_output_puller(self: &Arc<Self>, output: Arc<dyn OutputStage>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let startup = this.ctx.timeouts().startup;
            let mut state_rx = this.graph_state.subscribe();
            let mut cleaned_rx = this.cleaned.subscribe();
            let ready = tokio::time::timeout(startup, async {
                tokio::select! {
                    r = state_rx.wait_for(|s| *s == GraphState::Playing) => r.is_ok(),
                    _ = cleaned_rx.wait_for(|c| *c) => false,
                }
            })
            .await;

            match ready {
                Ok(true) => {}
                Ok(false) => return,
                Err(_) => {
                    if !this.has_failed.load(Ordering::SeqCst) {
                        this.ctx.fatal(&format!(
                            "{} timed out with startup after {:?}, cleanedUp: {}, isStopping: {}",
                            this.prefix,
                            startup,
                            this.cleaned_up.load(Ordering::SeqCst),
                            this.is_stopping.load(Ordering::SeqCst)
                        ));
                    }
                    return;
                }
            }

            let puller = Arc::clone(&this);
            let _ = tokio::task::spawn_blocking(move || puller.pull_loop(output)).await;
        });
    }

    fn pull_loop(&self, output: Arc<dyn OutputStage>) {
        let mut first_frame = true;
        loop {
            let started = Instant::now();
            let buffer = output.pull();
            let took = started.elapsed();
            if took > Duration::from_secs(1) {
                log::debug!("{} took {:?} to generate frame", self.prefix, took);
            }

            let Some(buffer) = buffer else {
                if !self.is_stopping.load(Ordering::SeqCst)
                    && !self.has_failed.load(Ordering::SeqCst)
                {
                    log::error!(
                        "{} pull err, eos: {}, output ended unexpectedly",
                        self.prefix,
                        output.is_eos()
                    );
                }
                break;
            };

            self.frames.fetch_add(1, Ordering::Relaxed);
            if first_frame {
                first_frame = false;
                log::info!("{} first frame generated", self.prefix);
            }

            self.send_buffer(&buffer);
        }
        log::debug!("{} output routine finished", self.prefix);
    }

    fn spawn_input_forwarder(self: &Arc<Self>, input: Arc<dyn InputStage>, mut rx: BufferReceiver) {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = rx.recv() => match cmd {
                        Some(BufferCmd::Data(buffer)) => {
                            if let Err(e) = input.push(buffer) {
                                log::warn!("{} push buffer error: {:#}", this.prefix, e);
                            }
                        }
                        Some(BufferCmd::Eos) | None => {
                            log::info!("{} nil frame received, stopping", this.prefix);
                            break;
                        }
                    },
                }
            }
            if !this.is_stopping.load(Ordering::SeqCst) {
                log::warn!("{} input routine exited", this.prefix);
            }
        });
        *self.input_task.lock() = Some(handle);
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
