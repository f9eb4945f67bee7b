//! In-process graph backend with deterministic behaviour.
//!
//! Descriptions are parsed into named elements the way `gst-launch` names them
//! (`name=` wins, caps filters become `capsfilterN`, the rest `<factory>N`).
//! State changes complete synchronously and are reported on the bus for the
//! graph and every element. Graphs with an `appsrc` pass each pushed buffer
//! through to the `appsink` unchanged, except that a pending force-key-unit
//! request turns the next output into a header keyframe. Capture graphs get
//! their frames from [`SimGraph::emit`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::buffer::{Buffer, BufferFlags};
use crate::graph::{
    Backend, BusMessage, ControlEvent, Element, Graph, GraphState, InputStage, OutputStage,
};

#[derive(Default)]
pub struct SimBackend {
    graphs: Mutex<Vec<Arc<SimGraph>>>,
    counter: AtomicUsize,
}

impl SimBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every graph built so far, oldest first.
    pub fn graphs(&self) -> Vec<Arc<SimGraph>> {
        self.graphs.lock().clone()
    }

    pub fn last_graph(&self) -> Option<Arc<SimGraph>> {
        self.graphs.lock().last().cloned()
    }
}

impl Backend for SimBackend {
    fn parse_launch(&self, description: &str) -> anyhow::Result<Arc<dyn Graph>> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        let graph = Arc::new(SimGraph::parse(&format!("pipeline{}", index), description)?);
        self.graphs.lock().push(Arc::clone(&graph));
        Ok(graph)
    }
}

struct Flow {
    state: GraphState,
    out: VecDeque<Buffer>,
    eos: bool,
    force_key: bool,
    stall_eos: bool,
    eos_events: usize,
    pushed: usize,
}

struct Shared {
    name: String,
    flow: Mutex<Flow>,
    flow_cond: Condvar,
    bus: Mutex<VecDeque<BusMessage>>,
    bus_cond: Condvar,
}

impl Shared {
    fn post(&self, msg: BusMessage) {
        self.bus.lock().push_back(msg);
        self.bus_cond.notify_all();
    }
}

pub struct SimElement {
    name: String,
    factory: String,
    shared: Arc<Shared>,
    state: Mutex<GraphState>,
    events: Mutex<Vec<ControlEvent>>,
    refuse_events: AtomicBool,
}

impl SimElement {
    pub fn factory(&self) -> &str {
        &self.factory
    }
}

impl Element for SimElement {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn set_state_blocking(&self, state: GraphState) -> anyhow::Result<()> {
        *self.state.lock() = state;
        Ok(())
    }

    fn send_upstream(&self, event: ControlEvent) -> bool {
        if self.refuse_events.load(Ordering::SeqCst) {
            return false;
        }
        self.events.lock().push(event);
        match event {
            ControlEvent::ForceKeyUnit { .. } => {
                self.shared.flow.lock().force_key = true;
            }
        }
        true
    }
}

pub struct SimGraph {
    shared: Arc<Shared>,
    description: String,
    elements: Mutex<Vec<Arc<SimElement>>>,
    removed: Mutex<Vec<String>>,
}

impl SimGraph {
    fn parse(name: &str, description: &str) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared {
            name: name.to_string(),
            flow: Mutex::new(Flow {
                state: GraphState::Null,
                out: VecDeque::new(),
                eos: false,
                force_key: false,
                stall_eos: false,
                eos_events: 0,
                pushed: 0,
            }),
            flow_cond: Condvar::new(),
            bus: Mutex::new(VecDeque::new()),
            bus_cond: Condvar::new(),
        });

        let mut elements = Vec::new();
        let mut caps_index = 0;
        for (index, segment) in description.split(" ! ").enumerate() {
            let segment = segment.trim();
            let factory = segment
                .split_whitespace()
                .next()
                .ok_or(anyhow::anyhow!("empty element in description: {:?}", description))?
                .trim_end_matches(',');
            let (factory, default_name) = if factory.contains('/') {
                let n = format!("capsfilter{}", caps_index);
                caps_index += 1;
                ("capsfilter".to_string(), n)
            } else {
                (factory.to_string(), format!("{}{}", factory, index))
            };
            let name = segment
                .split_whitespace()
                .find_map(|token| token.strip_prefix("name="))
                .map(|n| n.to_string())
                .unwrap_or(default_name);

            elements.push(Arc::new(SimElement {
                name,
                factory,
                shared: Arc::clone(&shared),
                state: Mutex::new(GraphState::Null),
                events: Mutex::new(Vec::new()),
                refuse_events: AtomicBool::new(false),
            }));
        }

        Ok(Self {
            shared,
            description: description.to_string(),
            elements: Mutex::new(elements),
            removed: Mutex::new(Vec::new()),
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Produce a raw unit at the graph's output, as a capture device would.
    /// Ignored once the graph is back in null.
    pub fn emit(&self, buffer: Buffer) -> bool {
        let mut flow = self.shared.flow.lock();
        if flow.state == GraphState::Null || flow.eos {
            return false;
        }
        flow.out.push_back(buffer);
        self.shared.flow_cond.notify_all();
        true
    }

    /// Report an internal error on the bus.
    pub fn inject_error(&self, source: &str, message: &str) {
        self.shared.post(BusMessage::Error {
            source: source.to_string(),
            message: message.to_string(),
        });
    }

    /// Accept end-of-stream without ever delivering it, like a wedged driver.
    pub fn stall_eos(&self, stall: bool) {
        self.shared.flow.lock().stall_eos = stall;
    }

    /// Make `send_upstream` on the named element fail.
    pub fn refuse_events(&self, element: &str, refuse: bool) {
        if let Some(el) = self.find(element) {
            el.refuse_events.store(refuse, Ordering::SeqCst);
        }
    }

    pub fn eos_events(&self) -> usize {
        self.shared.flow.lock().eos_events
    }

    pub fn pushed(&self) -> usize {
        self.shared.flow.lock().pushed
    }

    pub fn current_state(&self) -> GraphState {
        self.shared.flow.lock().state
    }

    pub fn element_names(&self) -> Vec<String> {
        self.elements.lock().iter().map(|e| e.name.clone()).collect()
    }

    pub fn removed_elements(&self) -> Vec<String> {
        self.removed.lock().clone()
    }

    pub fn control_events(&self, element: &str) -> Vec<ControlEvent> {
        self.find(element)
            .map(|e| e.events.lock().clone())
            .unwrap_or_default()
    }

    fn find(&self, name: &str) -> Option<Arc<SimElement>> {
        self.elements
            .lock()
            .iter()
            .find(|e| e.name == name)
            .cloned()
    }

    fn find_factory(&self, name: &str, factory: &str) -> Option<Arc<SimElement>> {
        self.find(name).filter(|e| e.factory == factory)
    }
}

impl Graph for SimGraph {
    fn name(&self) -> String {
        self.shared.name.clone()
    }

    fn set_state(&self, target: GraphState) -> anyhow::Result<()> {
        let mut flow = self.shared.flow.lock();
        let old = flow.state;
        if old == target {
            return Ok(());
        }

        let order = [
            GraphState::Null,
            GraphState::Ready,
            GraphState::Paused,
            GraphState::Playing,
        ];
        let from = order.iter().position(|s| *s == old).unwrap_or(0);
        let to = order.iter().position(|s| *s == target).unwrap_or(0);
        let steps: Vec<(GraphState, GraphState)> = if from < to {
            (from..to).map(|i| (order[i], order[i + 1])).collect()
        } else {
            (to..from).rev().map(|i| (order[i + 1], order[i])).collect()
        };

        flow.state = target;
        if target == GraphState::Null {
            flow.out.clear();
        }
        drop(flow);
        self.shared.flow_cond.notify_all();

        let elements = self.elements.lock().clone();
        for el in &elements {
            *el.state.lock() = target;
        }
        for (old, new) in steps {
            for el in &elements {
                self.shared.post(BusMessage::StateChanged {
                    source: el.name.clone(),
                    old,
                    new,
                });
            }
            self.shared.post(BusMessage::StateChanged {
                source: self.shared.name.clone(),
                old,
                new,
            });
        }
        Ok(())
    }

    fn state(&self, _timeout: Duration) -> GraphState {
        self.shared.flow.lock().state
    }

    fn send_eos(&self) -> bool {
        let mut flow = self.shared.flow.lock();
        flow.eos_events += 1;
        if flow.state == GraphState::Null {
            return false;
        }
        if flow.stall_eos {
            return true;
        }
        flow.eos = true;
        drop(flow);
        self.shared.flow_cond.notify_all();
        self.shared.post(BusMessage::Eos);
        true
    }

    fn pop_message(&self, timeout: Duration) -> Option<BusMessage> {
        let mut bus = self.shared.bus.lock();
        if bus.is_empty() {
            self.shared.bus_cond.wait_for(&mut bus, timeout);
        }
        bus.pop_front()
    }

    fn element(&self, name: &str) -> Option<Arc<dyn Element>> {
        self.find(name).map(|e| e as Arc<dyn Element>)
    }

    fn elements(&self) -> Vec<Arc<dyn Element>> {
        self.elements
            .lock()
            .iter()
            .map(|e| Arc::clone(e) as Arc<dyn Element>)
            .collect()
    }

    fn remove(&self, element: &Arc<dyn Element>) -> anyhow::Result<()> {
        let name = element.name();
        let mut elements = self.elements.lock();
        let index = elements
            .iter()
            .position(|e| e.name == name)
            .ok_or(anyhow::anyhow!("element {} is not in {}", name, self.shared.name))?;
        elements.remove(index);
        self.removed.lock().push(name);
        Ok(())
    }

    fn output_stage(&self, name: &str) -> Option<Arc<dyn OutputStage>> {
        self.find_factory(name, "appsink").map(|_| {
            Arc::new(SimOutput {
                shared: Arc::clone(&self.shared),
            }) as Arc<dyn OutputStage>
        })
    }

    fn input_stage(&self, name: &str) -> Option<Arc<dyn InputStage>> {
        self.find_factory(name, "appsrc").map(|_| {
            Arc::new(SimInput {
                shared: Arc::clone(&self.shared),
            }) as Arc<dyn InputStage>
        })
    }
}

struct SimOutput {
    shared: Arc<Shared>,
}

impl OutputStage for SimOutput {
    fn pull(&self) -> Option<Buffer> {
        let mut flow = self.shared.flow.lock();
        loop {
            if flow.state == GraphState::Null {
                return None;
            }
            if let Some(buffer) = flow.out.pop_front() {
                return Some(buffer);
            }
            if flow.eos {
                return None;
            }
            self.shared.flow_cond.wait(&mut flow);
        }
    }

    fn is_eos(&self) -> bool {
        let flow = self.shared.flow.lock();
        flow.eos && flow.out.is_empty()
    }
}

struct SimInput {
    shared: Arc<Shared>,
}

impl InputStage for SimInput {
    fn push(&self, buffer: Buffer) -> anyhow::Result<()> {
        let mut flow = self.shared.flow.lock();
        if flow.eos {
            anyhow::bail!("push after end-of-stream");
        }
        let mut flags = buffer.flags();
        if flow.force_key {
            flow.force_key = false;
            flags = BufferFlags::HEADER;
        }
        let mut out = Buffer::builder(buffer.data().clone()).flags(flags);
        if let Some(pts) = buffer.pts() {
            out = out.pts(pts);
        }
        if let Some(duration) = buffer.duration() {
            out = out.duration(duration);
        }
        flow.out.push_back(out.build());
        flow.pushed += 1;
        drop(flow);
        self.shared.flow_cond.notify_all();
        Ok(())
    }
}
