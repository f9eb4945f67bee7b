//! GStreamer implementation of the graph interface.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;

use crate::buffer::{Buffer, BufferFlags};
use crate::graph::{
    Backend, BusMessage, ControlEvent, Element, Graph, GraphState, InputStage, OutputStage,
};

pub fn init() -> anyhow::Result<()> {
    gst::init().map_err(|e| anyhow::anyhow!("gstreamer init failed: {}", e))
}

#[derive(Default)]
pub struct GstBackend;

impl GstBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl Backend for GstBackend {
    fn parse_launch(&self, description: &str) -> anyhow::Result<Arc<dyn Graph>> {
        let pipeline = gst::parse::launch(description)
            .map_err(|e| anyhow::anyhow!("failed to parse pipeline: {}", e))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow::anyhow!("description is not a pipeline: {}", description))?;
        let bus = pipeline
            .bus()
            .ok_or(anyhow::anyhow!("pipeline has no bus"))?;
        Ok(Arc::new(GstGraph { pipeline, bus }))
    }
}

fn to_gst(state: GraphState) -> gst::State {
    match state {
        GraphState::Null => gst::State::Null,
        GraphState::Ready => gst::State::Ready,
        GraphState::Paused => gst::State::Paused,
        GraphState::Playing => gst::State::Playing,
    }
}

fn from_gst(state: gst::State) -> GraphState {
    match state {
        gst::State::Ready => GraphState::Ready,
        gst::State::Paused => GraphState::Paused,
        gst::State::Playing => GraphState::Playing,
        _ => GraphState::Null,
    }
}

fn clock_time(d: Duration) -> gst::ClockTime {
    gst::ClockTime::from_nseconds(d.as_nanos() as u64)
}

pub struct GstGraph {
    pipeline: gst::Pipeline,
    bus: gst::Bus,
}

impl Graph for GstGraph {
    fn name(&self) -> String {
        self.pipeline.name().to_string()
    }

    fn set_state(&self, state: GraphState) -> anyhow::Result<()> {
        self.pipeline.set_state(to_gst(state))?;
        Ok(())
    }

    fn state(&self, timeout: Duration) -> GraphState {
        let (_, current, _) = self.pipeline.state(clock_time(timeout));
        from_gst(current)
    }

    fn send_eos(&self) -> bool {
        self.pipeline.send_event(gst::event::Eos::new())
    }

    fn pop_message(&self, timeout: Duration) -> Option<BusMessage> {
        let msg = self.bus.timed_pop(clock_time(timeout))?;
        let source = msg
            .src()
            .map(|s| s.name().to_string())
            .unwrap_or_default();
        let parsed = match msg.view() {
            gst::MessageView::StateChanged(s) => BusMessage::StateChanged {
                source,
                old: from_gst(s.old()),
                new: from_gst(s.current()),
            },
            gst::MessageView::Eos(..) => BusMessage::Eos,
            gst::MessageView::Error(err) => BusMessage::Error {
                source,
                message: match err.debug() {
                    Some(debug) => format!("{} ({})", err.error(), debug),
                    None => err.error().to_string(),
                },
            },
            _ => BusMessage::Other,
        };
        Some(parsed)
    }

    fn element(&self, name: &str) -> Option<Arc<dyn Element>> {
        self.pipeline
            .by_name(name)
            .map(|element| Arc::new(GstElement { element }) as Arc<dyn Element>)
    }

    fn elements(&self) -> Vec<Arc<dyn Element>> {
        self.pipeline
            .children()
            .into_iter()
            .map(|element| Arc::new(GstElement { element }) as Arc<dyn Element>)
            .collect()
    }

    fn remove(&self, element: &Arc<dyn Element>) -> anyhow::Result<()> {
        let name = element.name();
        let found = self
            .pipeline
            .by_name(&name)
            .ok_or(anyhow::anyhow!("element {} is not in the pipeline", name))?;
        self.pipeline.remove(&found)?;
        Ok(())
    }

    fn output_stage(&self, name: &str) -> Option<Arc<dyn OutputStage>> {
        self.pipeline
            .by_name(name)
            .and_then(|e| e.downcast::<gst_app::AppSink>().ok())
            .map(|sink| Arc::new(GstOutput { sink }) as Arc<dyn OutputStage>)
    }

    fn input_stage(&self, name: &str) -> Option<Arc<dyn InputStage>> {
        self.pipeline
            .by_name(name)
            .and_then(|e| e.downcast::<gst_app::AppSrc>().ok())
            .map(|src| Arc::new(GstInput { src }) as Arc<dyn InputStage>)
    }
}

struct GstElement {
    element: gst::Element,
}

impl Element for GstElement {
    fn name(&self) -> String {
        self.element.name().to_string()
    }

    fn set_state_blocking(&self, state: GraphState) -> anyhow::Result<()> {
        self.element.set_state(to_gst(state))?;
        let (result, _, _) = self.element.state(gst::ClockTime::NONE);
        result?;
        Ok(())
    }

    fn send_upstream(&self, event: ControlEvent) -> bool {
        let Some(pad) = self.element.static_pad("src") else {
            return false;
        };
        match event {
            ControlEvent::ForceKeyUnit { all_headers } => {
                let structure = gst::Structure::builder("GstForceKeyUnit")
                    .field("all-headers", all_headers)
                    .build();
                pad.send_event(gst::event::CustomUpstream::new(structure))
            }
        }
    }
}

struct GstOutput {
    sink: gst_app::AppSink,
}

impl OutputStage for GstOutput {
    fn pull(&self) -> Option<Buffer> {
        let sample = self.sink.pull_sample().ok()?;
        let buffer = sample.buffer()?;
        let map = buffer.map_readable().ok()?;

        let gst_flags = buffer.flags();
        let mut flags = BufferFlags::NONE;
        if gst_flags.contains(gst::BufferFlags::HEADER) {
            flags = flags | BufferFlags::HEADER;
        }
        if gst_flags.contains(gst::BufferFlags::DELTA_UNIT) {
            flags = flags | BufferFlags::DELTA_UNIT;
        }

        let mut out = Buffer::builder(Bytes::copy_from_slice(map.as_slice())).flags(flags);
        if let Some(pts) = buffer.pts() {
            out = out.pts(Duration::from_nanos(pts.nseconds()));
        }
        if let Some(duration) = buffer.duration() {
            out = out.duration(Duration::from_nanos(duration.nseconds()));
        }
        Some(out.build())
    }

    fn is_eos(&self) -> bool {
        self.sink.is_eos()
    }
}

struct GstInput {
    src: gst_app::AppSrc,
}

impl InputStage for GstInput {
    fn push(&self, buffer: Buffer) -> anyhow::Result<()> {
        let mut gst_buffer = gst::Buffer::from_slice(buffer.data().clone());
        if let Some(buffer_ref) = gst_buffer.get_mut() {
            if let Some(pts) = buffer.pts() {
                buffer_ref.set_pts(clock_time(pts));
            }
            if let Some(duration) = buffer.duration() {
                buffer_ref.set_duration(clock_time(duration));
            }
            if buffer.flags().contains(BufferFlags::DELTA_UNIT) {
                buffer_ref.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }
        self.src
            .push_buffer(gst_buffer)
            .map_err(|e| anyhow::anyhow!("failed to push buffer: {:?}", e))?;
        Ok(())
    }
}
