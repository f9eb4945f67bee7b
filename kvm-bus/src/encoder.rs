use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{BufferCmd, BufferReceiver, BufferSender, buffer_channel},
    capture::CaptureSettings,
    context::MediaContext,
    error::PipelineError,
    graph::{BusMessage, ControlEvent, Element, Graph, GraphState, InputStage, OutputStage},
    pipeline::FailureHandler,
    sample::{MediaType, Sample, SampleMetadata, SampleSender},
};

/// What fan-out needs from a consumer. Anything implementing this pair can be
/// registered on a capture source.
pub trait Encoder: Send + Sync {
    fn is_running(&self) -> bool;

    fn input_queue(&self) -> &BufferSender;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Rockchip MPP hardware HEVC
    HevcMpp,
    /// Rockchip MPP hardware H.264
    H264Mpp,
    Opus,
    #[serde(other)]
    Unknown,
}

impl Codec {
    pub fn media_type(&self) -> MediaType {
        match self {
            Codec::HevcMpp | Codec::H264Mpp => MediaType::Video,
            Codec::Opus => MediaType::Audio,
            Codec::Unknown => MediaType::Unknown,
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let s = match self {
            Codec::HevcMpp => "HEVC_MPP",
            Codec::H264Mpp => "H264_MPP",
            Codec::Opus => "OPUS",
            Codec::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

fn default_input_queue() -> usize {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    /// Profile name, stamped on every sample as its source
    pub name: String,
    pub codec: Codec,
    /// bps
    pub bitrate: u64,
    pub framerate: u32,
    /// Passed through to the encode element as properties
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default = "default_input_queue")]
    pub input_queue: usize,
}

impl EncoderSettings {
    pub fn new(name: &str, codec: Codec, bitrate: u64, framerate: u32) -> Self {
        Self {
            name: name.to_string(),
            codec,
            bitrate,
            framerate,
            options: BTreeMap::new(),
            input_queue: default_input_queue(),
        }
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_input_queue(mut self, capacity: usize) -> Self {
        self.input_queue = capacity;
        self
    }

    /// Graph description for this profile fed from `capture`.
    pub fn describe(&self, capture: &CaptureSettings) -> Result<String, PipelineError> {
        if self.codec == Codec::Unknown {
            return Err(PipelineError::UnsupportedCodec(self.codec.to_string()));
        }
        if self.codec.media_type() != capture.media_type() {
            return Err(PipelineError::UnsupportedCodec(format!(
                "{} cannot encode {} capture",
                self.codec,
                capture.media_type()
            )));
        }
        if self.bitrate == 0 {
            return Err(PipelineError::InvalidSettings(format!(
                "{}: bitrate must be positive",
                self.name
            )));
        }
        if self.input_queue == 0 {
            return Err(PipelineError::InvalidSettings(format!(
                "{}: input queue must hold at least one buffer",
                self.name
            )));
        }

        let options = self
            .options
            .iter()
            .map(|(k, v)| {
                // MPP encoders spell this property with capitals
                let k = if k == "num-ref-frames" {
                    "num-Ref-Frames"
                } else {
                    k.as_str()
                };
                format!("{}={}", k, v)
            })
            .collect::<Vec<_>>();

        let encode = match (self.codec, capture) {
            (Codec::HevcMpp | Codec::H264Mpp, CaptureSettings::Video(video)) => {
                if self.framerate == 0 {
                    return Err(PipelineError::InvalidSettings(format!(
                        "{}: framerate must be positive",
                        self.name
                    )));
                }
                let (element, parser) = if self.codec == Codec::HevcMpp {
                    ("mpph265enc", "h265parse")
                } else {
                    ("mpph264enc", "h264parse")
                };
                let mut enc = vec![element.to_string(), "name=enc".to_string()];
                enc.extend(options);
                enc.push(format!("bps={}", self.bitrate));
                format!(
                    "appsrc is-live=true format=time name=appsrc caps=\"video/x-raw,format=NV12,width={},height={},framerate={}/1\" ! {} ! {}",
                    video.width,
                    video.height,
                    self.framerate,
                    enc.join(" "),
                    parser
                )
            }
            (Codec::Opus, CaptureSettings::Audio(audio)) => {
                let mut enc = vec!["opusenc".to_string(), "name=enc".to_string()];
                enc.extend(options);
                enc.push(format!("bitrate={}", self.bitrate));
                format!(
                    "appsrc is-live=true format=time name=appsrc caps=\"audio/x-raw,rate={},channels={},format={},layout=interleaved\" ! audioconvert ! {}",
                    audio.sample_rate,
                    audio.channels,
                    audio.format,
                    enc.join(" ")
                )
            }
            _ => return Err(PipelineError::UnsupportedCodec(self.codec.to_string())),
        };

        Ok(format!("{} ! appsink name=appsink sync=false", encode))
    }
}

/// Independent encode graph fed from its own bounded input queue.
///
/// Lifetime is not tied to any capture source: registering it only makes it a
/// fan-out target. Encoded samples go to the shared output queue handed in at
/// construction; a full queue drops the sample.
pub struct FrameEncoder {
    prefix: String,
    settings: EncoderSettings,
    capture: CaptureSettings,
    media_type: MediaType,
    ctx: Arc<MediaContext>,
    graph: Mutex<Option<Arc<dyn Graph>>>,
    input: Arc<dyn InputStage>,
    output: Arc<dyn OutputStage>,
    encoder_element: Arc<dyn Element>,
    input_tx: BufferSender,
    input_rx: Mutex<Option<BufferReceiver>>,
    input_task: Mutex<Option<JoinHandle<()>>>,
    output_tx: SampleSender,
    first_frame: watch::Sender<bool>,
    graph_state: watch::Sender<GraphState>,
    stopped: watch::Sender<bool>,
    lifecycle: Mutex<()>,
    is_starting: AtomicBool,
    is_stopping: AtomicBool,
    is_running: AtomicBool,
    has_failed: AtomicBool,
    cancel: CancellationToken,
    on_failure: Mutex<Option<FailureHandler>>,
    produced: AtomicU64,
    dropped: AtomicU64,
}

impl FrameEncoder {
    pub fn new(
        ctx: &Arc<MediaContext>,
        settings: EncoderSettings,
        capture: &CaptureSettings,
        output: SampleSender,
    ) -> anyhow::Result<Arc<Self>> {
        let description = settings.describe(capture)?;
        let graph = ctx.backend().parse_launch(&description).map_err(|e| {
            anyhow::anyhow!("failed to create encoder {}: {:#}", settings.name, e)
        })?;

        let input = graph
            .input_stage("appsrc")
            .ok_or(PipelineError::MissingElement("appsrc".to_string()))?;
        let output_stage = graph
            .output_stage("appsink")
            .ok_or(PipelineError::MissingElement("appsink".to_string()))?;
        let encoder_element = graph
            .element("enc")
            .ok_or(PipelineError::MissingElement("enc".to_string()))?;

        let id = ctx.next_id();
        let media_type = settings.codec.media_type();
        let (input_tx, input_rx) = buffer_channel(settings.input_queue);
        log::debug!("encoder {} graph: {}", settings.name, description);

        Ok(Arc::new(Self {
            prefix: format!("[encoder#{} {} {}]", id, media_type, settings.name),
            settings,
            capture: capture.clone(),
            media_type,
            ctx: Arc::clone(ctx),
            graph: Mutex::new(Some(graph)),
            input,
            output: output_stage,
            encoder_element,
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            input_task: Mutex::new(None),
            output_tx: output,
            first_frame: watch::Sender::new(false),
            graph_state: watch::Sender::new(GraphState::Null),
            stopped: watch::Sender::new(false),
            lifecycle: Mutex::new(()),
            is_starting: AtomicBool::new(false),
            is_stopping: AtomicBool::new(false),
            is_running: AtomicBool::new(false),
            has_failed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            on_failure: Mutex::new(None),
            produced: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn capture_settings(&self) -> &CaptureSettings {
        &self.capture
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn has_failed(&self) -> bool {
        self.has_failed.load(Ordering::SeqCst)
    }

    pub fn has_produced_first_frame(&self) -> bool {
        *self.first_frame.borrow()
    }

    pub fn samples_produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// Samples discarded because the output queue was full.
    pub fn samples_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn set_failure_handler(&self, handler: FailureHandler) {
        *self.on_failure.lock() = Some(handler);
    }

    /// Launch the bus loop, output puller and input forwarder, then wait until
    /// the graph is at least paused so callers never push into a graph that
    /// is still coming up.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        {
            let _lifecycle = self.lifecycle.lock();
            if self.is_stopping.load(Ordering::SeqCst) {
                log::error!("{} something tried to start stopped encoder", self.prefix);
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

            let puller = Arc::clone(self);
            tokio::task::spawn_blocking(move || puller.pull_loop());
            self.spawn_input_forwarder();
        }

        let startup = self.ctx.timeouts().startup;
        let mut state_rx = self.graph_state.subscribe();
        let waited = tokio::time::timeout(
            startup,
            state_rx.wait_for(|s| {
                *s >= GraphState::Paused
                    || self.has_failed.load(Ordering::SeqCst)
                    || self.is_stopping.load(Ordering::SeqCst)
            }),
        )
        .await
        .map(|r| r.is_ok());
        match waited {
            Ok(true) if !self.has_failed.load(Ordering::SeqCst) => {}
            Ok(_) => {
                return Err(anyhow::anyhow!("{} failed while starting", self.prefix));
            }
            Err(_) => {
                log::error!("{} waiting for state change timed out", self.prefix);
                return Err(PipelineError::StartTimeout(startup).into());
            }
        }

        // a stop that began meanwhile owns teardown
        let _lifecycle = self.lifecycle.lock();
        if self.is_stopping.load(Ordering::SeqCst) {
            log::warn!("{} stopped while starting", self.prefix);
            return Err(PipelineError::Stopped.into());
        }
        self.is_running.store(true, Ordering::SeqCst);
        log::info!("{} started", self.prefix);
        Ok(())
    }

    /// Wait for the first encoded sample, then ask the encode element for a
    /// keyframe with headers. An element that refuses the event is broken and
    /// goes to the fatal hook.
    pub async fn request_keyframe(&self) -> anyhow::Result<()> {
        log::debug!("{} requested keyframe, codec: {}", self.prefix, self.settings.codec);

        let mut first_rx = self.first_frame.subscribe();
        let _ = first_rx
            .wait_for(|produced| *produced || self.is_stopping.load(Ordering::SeqCst))
            .await;
        if !*self.first_frame.borrow() {
            return Err(PipelineError::Stopped.into());
        }

        if !self
            .encoder_element
            .send_upstream(ControlEvent::ForceKeyUnit { all_headers: true })
        {
            self.ctx
                .fatal(&format!("{} failed to send kf event", self.prefix));
        }
        Ok(())
    }

    /// Cancel input, drain with end-of-stream and tear the graph down.
    /// Idempotent; a graph that does not reach null within the encoder stop
    /// timeout goes to the fatal hook.
    pub async fn stop(&self) {
        let mut stopped_rx = self.stopped.subscribe();
        if self.is_stopping.swap(true, Ordering::SeqCst) {
            let timeout = self.ctx.timeouts().encoder_stop;
            let _ = tokio::time::timeout(timeout, stopped_rx.wait_for(|s| *s)).await;
            return;
        }

        // let an in-flight start finish launching its tasks
        drop(self.lifecycle.lock());

        log::info!("{} stopping encoder...", self.prefix);
        // wake keyframe requests parked on the first frame, and a start
        // still waiting for the graph
        self.first_frame.send_modify(|_| {});
        self.graph_state.send_modify(|_| {});
        self.cancel.cancel();
        let input_task = self.input_task.lock().take();
        if let Some(task) = input_task {
            let _ = task.await;
        }

        let graph = self.graph.lock().clone();
        if let Some(graph) = graph {
            if !self.is_starting.swap(true, Ordering::SeqCst) {
                if let Err(e) = graph.set_state(GraphState::Null) {
                    log::error!("{} pipe to null error: {:#}", self.prefix, e);
                }
                self.graph_state.send_replace(GraphState::Null);
            } else if !graph.send_eos() {
                log::warn!("{} graph refused eos, forcing null", self.prefix);
                if let Err(e) = graph.set_state(GraphState::Null) {
                    log::error!("{} pipe to null error: {:#}", self.prefix, e);
                }
            }

            self.wait_for_null(&graph).await;
            self.release(&graph);
        }

        self.is_running.store(false, Ordering::SeqCst);
        self.stopped.send_replace(true);
        log::info!("{} stopped encoder", self.prefix);
    }

    async fn wait_for_null(&self, graph: &Arc<dyn Graph>) {
        let timeouts = self.ctx.timeouts();
        let started = Instant::now();
        let mut state_rx = self.graph_state.subscribe();
        loop {
            state_rx.mark_unchanged();
            if graph.state(Duration::ZERO) == GraphState::Null {
                return;
            }
            if started.elapsed() > timeouts.encoder_stop {
                self.ctx.fatal(&format!(
                    "{} stop timed out after {:?}",
                    self.prefix, timeouts.encoder_stop
                ));
                // only reached when the fatal hook returns
                let _ = graph.set_state(GraphState::Null);
                return;
            }
            let _ = tokio::time::timeout(timeouts.poll_interval, state_rx.changed()).await;
            log::debug!(
                "{} waiting to stop, state: {}",
                self.prefix,
                graph.state(Duration::ZERO)
            );
        }
    }

    fn release(&self, graph: &Arc<dyn Graph>) {
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
                    log::debug!("{} encoder pipeline eos", self.prefix);
                    if let Err(e) = graph.set_state(GraphState::Null) {
                        log::error!("{} failed to set encoder state to null: {:#}", self.prefix, e);
                    }
                    break;
                }
                BusMessage::Error { source, message } => {
                    if let Err(e) = graph.set_state(GraphState::Null) {
                        log::error!("{} failed to set encoder state to null: {:#}", self.prefix, e);
                    }
                    if self.has_failed.swap(true, Ordering::SeqCst) {
                        break;
                    }
                    log::error!("{} encoder pipeline failed at {}: {}", self.prefix, source, message);
                    self.is_running.store(false, Ordering::SeqCst);
                    if let Some(handler) = self.on_failure.lock().take() {
                        let err = PipelineError::Failed { source, message };
                        runtime.spawn_blocking(move || handler(err));
                    }
                    break;
                }
                BusMessage::Other => {}
            }
        }

        self.graph_state.send_replace(GraphState::Null);
        log::warn!("{} encoder bus exit", self.prefix);
    }

    fn pull_loop(&self) {
        let mut first_frame = true;
        loop {
            let Some(buffer) = self.output.pull() else {
                if !self.is_stopping.load(Ordering::SeqCst) {
                    log::warn!(
                        "{} pull err, eos: {}, encoder output routine rip",
                        self.prefix,
                        self.output.is_eos()
                    );
                }
                break;
            };

            if first_frame {
                first_frame = false;
                self.first_frame.send_replace(true);
            }

            if self.is_stopping.load(Ordering::SeqCst) {
                continue;
            }

            let sample = Sample {
                data: buffer.data().clone(),
                timestamp: buffer.pts().unwrap_or_default(),
                duration: buffer.duration().unwrap_or_default(),
                metadata: SampleMetadata {
                    is_key_frame: buffer.is_key(),
                    source: self.settings.name.clone(),
                    media_type: self.media_type,
                },
            };

            match self.output_tx.try_send(sample) {
                Ok(()) => {
                    self.produced.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    log::warn!(
                        "{} output queue is full, dropped {} samples",
                        self.prefix,
                        dropped
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    log::debug!("{} output queue closed", self.prefix);
                }
            }
        }
    }

    fn spawn_input_forwarder(self: &Arc<Self>) {
        let Some(mut rx) = self.input_rx.lock().take() else {
            return;
        };
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = rx.recv() => match cmd {
                        Some(BufferCmd::Data(buffer)) => {
                            // push consumes the engine's reference
                            if let Err(e) = this.input.push(buffer) {
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
                log::warn!("{} encoder input routine rip", this.prefix);
            }
        });
        *self.input_task.lock() = Some(handle);
    }
}

impl Encoder for FrameEncoder {
    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn input_queue(&self) -> &BufferSender {
        &self.input_tx
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
