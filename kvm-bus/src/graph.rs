//! Capability interface over a native processing graph.
//!
//! The engine only talks to these traits. `sim` implements them in-process
//! for tests; `gst` (feature `gstreamer`) maps them onto GStreamer.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl Display for GraphState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        let s = match self {
            GraphState::Null => "null",
            GraphState::Ready => "ready",
            GraphState::Paused => "paused",
            GraphState::Playing => "playing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    StateChanged {
        source: String,
        old: GraphState,
        new: GraphState,
    },
    Eos,
    Error {
        source: String,
        message: String,
    },
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Ask an encoder to emit a keyframe, optionally preceded by stream headers
    ForceKeyUnit { all_headers: bool },
}

/// Builds graphs from a `src ! filter name=x ! sink` description.
pub trait Backend: Send + Sync + 'static {
    fn parse_launch(&self, description: &str) -> anyhow::Result<Arc<dyn Graph>>;
}

pub trait Graph: Send + Sync {
    /// Name of the top-level graph; bus messages from sub-elements carry other names.
    fn name(&self) -> String;

    fn set_state(&self, state: GraphState) -> anyhow::Result<()>;

    /// Current state, waiting up to `timeout` for an in-flight transition to settle.
    fn state(&self, timeout: Duration) -> GraphState;

    /// Inject end-of-stream at the sources. Returns false if the graph refused it.
    fn send_eos(&self) -> bool;

    /// Next bus message, or `None` if nothing arrived within `timeout`.
    fn pop_message(&self, timeout: Duration) -> Option<BusMessage>;

    fn element(&self, name: &str) -> Option<Arc<dyn Element>>;

    fn elements(&self) -> Vec<Arc<dyn Element>>;

    fn remove(&self, element: &Arc<dyn Element>) -> anyhow::Result<()>;

    /// Pull-based output stage (appsink) by name.
    fn output_stage(&self, name: &str) -> Option<Arc<dyn OutputStage>>;

    /// Push-based input stage (appsrc) by name.
    fn input_stage(&self, name: &str) -> Option<Arc<dyn InputStage>>;
}

pub trait Element: Send + Sync {
    fn name(&self) -> String;

    /// Change state and wait for the transition to finish.
    fn set_state_blocking(&self, state: GraphState) -> anyhow::Result<()>;

    /// Send an upstream control event from the element's source pad.
    fn send_upstream(&self, event: ControlEvent) -> bool;
}

pub trait OutputStage: Send + Sync {
    /// Block for the next unit. `None` once the stage reached end-of-stream
    /// or was flushed by a transition to null.
    fn pull(&self) -> Option<Buffer>;

    fn is_eos(&self) -> bool;
}

pub trait InputStage: Send + Sync {
    fn push(&self, buffer: Buffer) -> anyhow::Result<()>;
}
