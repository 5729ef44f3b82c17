//! Main simulator interface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::blocks::{library, BlockKind, StepContext};
use crate::error::{CbdError, Result};
use crate::events::{Direction, RegulaFalsi, StateEvent, StateEventLocator};
use crate::model::{BlockId, Diagram, PortId, Signal};
use crate::tracer::{Interpolation, TraceDispatcher, TraceMessage, Tracer};

use super::depgraph::DepGraph;
use super::linear::{LinearSolver, LoopSolver};
use super::realtime::RealTimePacer;
use super::scheduler::{must_compute, Group, RecomputePolicy, Scheduler};
use super::{DEFAULT_DELTA_T, DEFAULT_OVERDUE_LIMIT, TERMINATION_PRECISION};

/// Stops a run when it returns `true`; called with the model and the
/// index of the next iteration.
pub type TerminationCondition = Box<dyn Fn(&Diagram, usize) -> bool>;

/// Configuration for the simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Step of the clock added to models without one.
    pub delta_t: f64,
    /// Run until this time; `None` runs until stopped.
    pub termination_time: Option<f64>,
    /// When dependency graphs and schedules are rebuilt.
    pub recompute: RecomputePolicy,
    /// Wall-clock seconds per simulated second, or `None` to run as fast
    /// as possible.
    pub real_time: Option<f64>,
    /// Late iterations in a row before a real-time run pauses.
    pub overdue_limit: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            delta_t: DEFAULT_DELTA_T,
            termination_time: None,
            recompute: RecomputePolicy::default(),
            real_time: None,
            overdue_limit: DEFAULT_OVERDUE_LIMIT,
        }
    }
}

impl SimulatorConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delta_t(mut self, delta_t: f64) -> Self {
        self.delta_t = delta_t;
        self
    }

    pub fn with_termination_time(mut self, time: f64) -> Self {
        self.termination_time = Some(time);
        self
    }

    pub fn with_recompute_policy(mut self, policy: RecomputePolicy) -> Self {
        self.recompute = policy;
        self
    }

    /// Pace the run against the wall clock.
    ///
    /// A scale of 1 runs in real time, 2 at half speed and 0.5 twice as
    /// fast.
    pub fn with_real_time(mut self, scale: f64) -> Self {
        self.real_time = Some(scale);
        self
    }

    pub fn with_overdue_limit(mut self, limit: usize) -> Self {
        self.overdue_limit = limit;
        self
    }
}

/// Located crossing candidate of one event.
struct Bracket {
    event: usize,
    p1: (f64, f64),
    p2: (f64, f64),
    direction: Direction,
}

/// Runs a causal block diagram.
pub struct Simulator {
    diagram: Diagram,
    config: SimulatorConfig,
    scheduler: Scheduler,
    /// Dependency graph of the last rebuild.
    depgraph: Option<DepGraph>,
    loop_solver: Box<dyn LoopSolver>,
    locator: Arc<dyn StateEventLocator>,
    events: Vec<StateEvent>,
    termination_condition: Option<TerminationCondition>,
    /// Values of the root input ports.
    inputs: HashMap<String, f64>,
    tracers: TraceDispatcher,
    pacer: Option<RealTimePacer>,
    stop: Arc<AtomicBool>,
    clock: Option<BlockId>,
    /// Ports reported to tracers, in the order of their names.
    signal_ports: Vec<PortId>,
    /// Index of the next iteration since the last (re)start.
    iteration: usize,
    /// Time of the last committed iteration.
    time: f64,
    /// Step imposed on the next iteration while locating an event.
    forced_delta: Option<f64>,
    /// Clock start before the first event restart of a run.
    first_start: Option<f64>,
    started: bool,
}

impl Simulator {
    /// Create a new simulator for the given model with default configuration.
    pub fn new(diagram: Diagram) -> Self {
        Self::with_config(diagram, SimulatorConfig::default())
    }

    /// Create a new simulator for the given model with custom configuration.
    pub fn with_config(diagram: Diagram, config: SimulatorConfig) -> Self {
        Self {
            diagram,
            scheduler: Scheduler::new(config.recompute.clone()),
            config,
            depgraph: None,
            loop_solver: Box::new(LinearSolver),
            locator: Arc::new(RegulaFalsi::default()),
            events: Vec::new(),
            termination_condition: None,
            inputs: HashMap::new(),
            tracers: TraceDispatcher::new(),
            pacer: None,
            stop: Arc::new(AtomicBool::new(false)),
            clock: None,
            signal_ports: Vec::new(),
            iteration: 0,
            time: 0.0,
            forced_delta: None,
            first_start: None,
            started: false,
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn diagram(&self) -> &Diagram {
        &self.diagram
    }

    /// Mutable access to the model, e.g. to change parameters between runs.
    pub fn diagram_mut(&mut self) -> &mut Diagram {
        &mut self.diagram
    }

    pub fn into_diagram(self) -> Diagram {
        self.diagram
    }

    /// Index of the next iteration since the last (re)start.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Time of the last committed iteration.
    pub fn time(&self) -> f64 {
        self.time
    }

    // ============ Setup ============

    pub fn set_termination_time(&mut self, time: f64) {
        self.config.termination_time = Some(time);
    }

    /// Stop a run as soon as `condition` holds, checked before every
    /// iteration but the first.
    pub fn set_termination_condition<F>(&mut self, condition: F)
    where
        F: Fn(&Diagram, usize) -> bool + 'static,
    {
        self.termination_condition = Some(Box::new(condition));
    }

    pub fn set_loop_solver(&mut self, solver: impl LoopSolver + 'static) {
        self.loop_solver = Box::new(solver);
    }

    /// Locator used for every state event; [`RegulaFalsi`] by default.
    pub fn set_state_event_locator(&mut self, locator: impl StateEventLocator + 'static) {
        self.locator = Arc::new(locator);
    }

    pub fn register_state_event(&mut self, event: StateEvent) {
        debug!(output = %event.output(), level = event.level(), "state event registered");
        self.events.push(event);
    }

    /// Register a tracer for the next run, receiving every committed
    /// iteration.
    pub fn add_tracer(&mut self, tracer: impl Tracer + 'static) -> Result<()> {
        self.tracers.add(Box::new(tracer), None)
    }

    /// Register a tracer for the next run, receiving rows every `interval`
    /// time units reconstructed with `method`.
    pub fn add_tracer_with_interval(
        &mut self,
        tracer: impl Tracer + 'static,
        interval: f64,
        method: Interpolation,
    ) -> Result<()> {
        self.tracers.add(Box::new(tracer), Some((interval, method)))
    }

    /// Value fed to the root input port `name` at every iteration.
    pub fn set_input(&mut self, name: &str, value: f64) -> Result<()> {
        let root = self.diagram.block(self.diagram.root())?;
        if root.input_index(name).is_none() {
            return Err(CbdError::port_not_found(self.diagram.name(), name));
        }
        self.inputs.insert(name.to_string(), value);
        Ok(())
    }

    /// Flag that ends the current run before its next iteration. It can be
    /// set from any thread.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    // ============ Running ============

    /// Simulate from the clock's start time until the termination time,
    /// the termination condition or a stop request.
    pub fn run(&mut self) -> Result<()> {
        self.begin()?;
        let result = self.run_loop();
        self.conclude(&result);
        result
    }

    /// [`Simulator::run`] with a new termination time.
    pub fn run_until(&mut self, time: f64) -> Result<()> {
        self.set_termination_time(time);
        self.run()
    }

    /// Simulate exactly `steps` iterations from the start, ignoring the
    /// termination time and condition.
    pub fn run_steps(&mut self, steps: usize) -> Result<()> {
        self.begin()?;
        let mut result = Ok(());
        for _ in 0..steps {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            result = self.step();
            if result.is_err() {
                break;
            }
        }
        self.conclude(&result);
        result
    }

    /// Compute one iteration, continuing from the current state.
    pub fn step(&mut self) -> Result<()> {
        if !self.started {
            self.prepare()?;
        }
        let ctx = self.step_context()?;
        self.tracers.send(TraceMessage::IterationStart {
            iteration: self.iteration,
            time: ctx.time,
        });
        self.compute_step()?;
        self.time = ctx.time;
        if !self.process_events()? {
            self.publish_sample();
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.reset()?;
        self.prepare()?;
        info!(
            model = %self.diagram.name(),
            termination_time = ?self.config.termination_time,
            "simulation started"
        );
        Ok(())
    }

    fn run_loop(&mut self) -> Result<()> {
        let mut first = true;
        loop {
            if !first && self.finished()? {
                return Ok(());
            }
            first = false;
            self.step()?;
            if self.pacer.is_some() {
                let mut next = self.step_context()?.time;
                if let Some(end) = self.config.termination_time {
                    next = next.min(end);
                }
                if let Some(pacer) = &mut self.pacer {
                    pacer.wait(next);
                }
            }
        }
    }

    fn conclude(&mut self, result: &Result<()>) {
        self.tracers.finish();
        self.pacer = None;
        self.started = false;
        match result {
            Ok(()) => info!(iteration = self.iteration, time = self.time, "simulation finished"),
            Err(e) => error!(error = %e, time = self.time, "simulation aborted"),
        }
    }

    /// Forget every computed signal and start over at iteration 0.
    fn reset(&mut self) -> Result<()> {
        if let Some(start) = self.first_start.take() {
            self.diagram.set_clock_start(start)?;
        }
        self.diagram.clear_signals();
        self.iteration = 0;
        self.depgraph = None;
        self.scheduler.invalidate();
        self.forced_delta = None;
        self.started = false;
        self.stop.store(false, Ordering::SeqCst);
        for event in &mut self.events {
            event.fired = false;
        }
        Ok(())
    }

    /// Add a clock when missing, validate the model and start the tracers.
    fn prepare(&mut self) -> Result<()> {
        let delta_t = self.config.delta_t;
        if !(delta_t > 0.0 && delta_t.is_finite()) {
            return Err(CbdError::invalid_parameter(
                "delta_t",
                format!("must be positive, got {}", delta_t),
            ));
        }
        let clock = match self.diagram.clock() {
            Ok(id) => id,
            Err(CbdError::MissingClock { .. }) => {
                let root = self.diagram.root();
                let prefix = self.diagram.unique_block_name(root, "clock", false)?;
                info!(prefix = %prefix, delta_t, "model has no clock, adding a fixed rate clock");
                library::add_fixed_rate_clock(&mut self.diagram, root, &prefix, delta_t, 0.0)?
            }
            Err(e) => return Err(e),
        };
        self.diagram.validate()?;
        self.clock = Some(clock);
        let start_time = self.step_context()?.time;
        if self.iteration == 0 {
            self.time = start_time;
        }

        self.signal_ports = self.diagram.signal_ports();
        self.tracers.start()?;
        if self.tracers.is_running() {
            let names: Vec<String> = self.signal_ports.iter().map(|p| self.diagram.port_path(*p)).collect();
            self.tracers.send(TraceMessage::Started {
                names: names.into(),
                start_time,
            });
        }

        if let Some(scale) = self.config.real_time {
            let mut pacer = RealTimePacer::new(scale, self.config.overdue_limit);
            pacer.start(start_time);
            self.pacer = Some(pacer);
        }
        self.started = true;
        Ok(())
    }

    /// Whether the run ends before the next iteration.
    fn finished(&self) -> Result<bool> {
        if self.stop.load(Ordering::SeqCst) {
            info!(time = self.time, "stop requested");
            return Ok(true);
        }
        if let Some(condition) = &self.termination_condition {
            if condition(&self.diagram, self.iteration) {
                return Ok(true);
            }
        }
        match self.config.termination_time {
            // Also ends runs whose next time already lies past the end.
            Some(end) => {
                let next = self.step_context()?;
                Ok(round_to(end - next.time, TERMINATION_PRECISION) < next.delta)
            }
            None => Ok(false),
        }
    }

    // ============ Iterations ============

    /// Time information of the next iteration.
    ///
    /// Iteration 0 happens at the clock's start time. Later iterations
    /// advance by the forced step while locating an event, otherwise by the
    /// value of the clock's `h` input one iteration earlier (or its start
    /// delta when `h` is unconnected).
    fn step_context(&self) -> Result<StepContext> {
        let clock = match self.clock {
            Some(id) => id,
            None => self.diagram.clock()?,
        };
        let block = self.diagram.block(clock)?;
        let &BlockKind::Clock {
            start_time,
            start_delta,
        } = block.kind()
        else {
            return Err(CbdError::MissingClock {
                model: self.diagram.name().to_string(),
            });
        };
        if self.iteration == 0 {
            return Ok(StepContext {
                iteration: 0,
                time: start_time,
                delta: start_delta,
                start_time,
            });
        }

        let previous = self.iteration - 1;
        let time_port = PortId::output(clock, 0);
        let last_time = self
            .diagram
            .port(time_port)?
            .history()
            .get(previous)
            .map(|s| s.value)
            .ok_or_else(|| CbdError::missing_signal(self.diagram.port_path(time_port), previous))?;
        let delta = match self.forced_delta {
            Some(delta) => delta,
            None if block.inputs().first().map_or(false, |h| h.incoming().is_some()) => {
                self.diagram.input_signal(clock, 0, previous)?.value
            }
            None => start_delta,
        };
        Ok(StepContext {
            iteration: self.iteration,
            time: last_time + delta,
            delta,
            start_time,
        })
    }

    /// Compute every block for the next iteration and advance to it.
    fn compute_step(&mut self) -> Result<()> {
        let ctx = self.step_context()?;
        let it = self.iteration;
        if self.depgraph.is_none() || self.scheduler.policy().recompute_at(it) {
            let graph = DepGraph::build(&self.diagram, it)?;
            debug!(iteration = it, members = graph.len(), "dependency graph rebuilt");
            self.depgraph = Some(graph);
        }
        let groups = match &self.depgraph {
            Some(graph) => self.scheduler.obtain(graph, it)?,
            None => Vec::new(),
        };
        for group in &groups {
            match group {
                Group::Block(id) => self.compute_block(*id, &ctx)?,
                Group::Port(port) => self.feed_input(*port, &ctx)?,
                Group::Cycle(blocks) => self.solve_loop(blocks, &ctx)?,
            }
        }
        self.iteration += 1;
        Ok(())
    }

    /// Undo the last iteration.
    fn rewind_step(&mut self) {
        self.iteration = self.iteration.saturating_sub(1);
        self.diagram.rewind();
    }

    fn is_due(&self, id: BlockId, ctx: &StepContext) -> Result<bool> {
        Ok(must_compute(self.diagram.block(id)?.rate(), ctx.iteration, ctx.time))
    }

    fn compute_block(&mut self, id: BlockId, ctx: &StepContext) -> Result<()> {
        if !self.is_due(id, ctx)? {
            return self.hold_outputs(id, ctx.time);
        }
        let path = self.diagram.path_of(id);
        let diagram = &self.diagram;
        let values = diagram.block(id)?.kind().compute(&path, ctx, |port, iteration| {
            diagram.input_signal(id, port, iteration).map(|s| s.value)
        })?;
        for (index, value) in values.into_iter().enumerate() {
            self.diagram
                .push_signal(PortId::output(id, index), Signal::new(ctx.time, value))?;
        }
        Ok(())
    }

    /// Repeat the previous output values of a block that is not due.
    fn hold_outputs(&mut self, id: BlockId, time: f64) -> Result<()> {
        let count = self.diagram.block(id)?.outputs().len();
        for index in 0..count {
            let port = PortId::output(id, index);
            let last = self
                .diagram
                .port(port)?
                .history()
                .last()
                .map(|s| s.value)
                .ok_or_else(|| CbdError::missing_signal(self.diagram.port_path(port), self.iteration))?;
            self.diagram.push_signal(port, Signal::new(time, last))?;
        }
        Ok(())
    }

    fn feed_input(&mut self, port: PortId, ctx: &StepContext) -> Result<()> {
        if port.block != self.diagram.root() || !port.is_input() {
            return Ok(());
        }
        let name = self.diagram.port(port)?.name();
        let value = *self
            .inputs
            .get(name)
            .ok_or_else(|| CbdError::MissingInput { port: name.to_string() })?;
        self.diagram.push_signal(port, Signal::new(ctx.time, value))
    }

    fn solve_loop(&mut self, blocks: &[BlockId], ctx: &StepContext) -> Result<()> {
        let values = self.loop_solver.solve(&self.diagram, blocks, ctx.iteration)?;
        for (&id, value) in blocks.iter().zip(values) {
            if self.is_due(id, ctx)? {
                self.diagram
                    .push_signal(PortId::output(id, 0), Signal::new(ctx.time, value))?;
            } else {
                self.hold_outputs(id, ctx.time)?;
            }
        }
        Ok(())
    }

    // ============ State Events ============

    /// Check the armed events against the iteration just computed. When one
    /// crossed, replace that iteration by one ending at the earliest
    /// crossing, run its callback and restart the clock there.
    ///
    /// Returns whether an event fired.
    fn process_events(&mut self) -> Result<bool> {
        let mut brackets = Vec::new();
        for (index, event) in self.events.iter_mut().enumerate() {
            if event.fired {
                // The step starting at the restart is never checked again.
                if event.can_rearm(&self.diagram)? {
                    event.fired = false;
                }
                continue;
            }
            if !event.crossed(&self.diagram)? {
                continue;
            }
            let history = self.diagram.signal_history(event.output())?;
            let n = history.len();
            if let (Some(prev), Some(curr)) = (history.get(n - 2), history.get(n - 1)) {
                brackets.push(Bracket {
                    event: index,
                    p1: (prev.time, prev.value - event.level()),
                    p2: (curr.time, curr.value - event.level()),
                    direction: event.direction(),
                });
            }
        }
        let Some(first) = brackets.first() else {
            return Ok(false);
        };
        let t_lower = first.p1.0;
        let mut winner = (f64::INFINITY, first.event);

        self.rewind_step();
        let locator = Arc::clone(&self.locator);
        for bracket in &brackets {
            let output = self.events[bracket.event].output().to_string();
            let level = self.events[bracket.event].level();
            let mut probe = |t: f64| self.probe(&output, level, t, t_lower);
            let time = locator.locate(bracket.p1, bracket.p2, &mut probe, bracket.direction)?;
            debug!(output = %output, time, "state event located");
            if time < winner.0 {
                winner = (time, bracket.event);
            }
        }
        let (time, index) = winner;

        self.forced_delta = Some(time - t_lower);
        let computed = self.compute_step();
        self.forced_delta = None;
        computed?;
        self.time = time;
        self.publish_sample();

        info!(output = %self.events[index].output(), time, "state event");
        self.events[index].fired = true;
        self.events[index].fire(time, &mut self.diagram)?;
        self.restart(time)
    }

    /// Value of `output` minus `level` at `time`, leaving no trace in the
    /// model.
    fn probe(&mut self, output: &str, level: f64, time: f64, t_lower: f64) -> Result<f64> {
        self.forced_delta = Some(time - t_lower);
        let computed = self.compute_step();
        self.forced_delta = None;
        computed?;
        let value = self.diagram.signal_history(output)?.last().map(|s| s.value);
        self.rewind_step();
        value
            .map(|v| v - level)
            .ok_or_else(|| CbdError::missing_signal(output, self.iteration))
    }

    /// Clear all signals and continue from iteration 0 at `time`.
    fn restart(&mut self, time: f64) -> Result<bool> {
        let previous = self.clock_start_time()?;
        self.first_start.get_or_insert(previous);
        self.diagram.clear_signals();
        self.diagram.set_clock_start(time)?;
        self.clock = Some(self.diagram.clock()?);
        self.iteration = 0;
        self.depgraph = None;
        self.scheduler.invalidate();
        Ok(true)
    }

    fn clock_start_time(&self) -> Result<f64> {
        let clock = self.diagram.clock()?;
        match self.diagram.block(clock)?.kind() {
            BlockKind::Clock { start_time, .. } => Ok(*start_time),
            _ => Err(CbdError::MissingClock {
                model: self.diagram.name().to_string(),
            }),
        }
    }

    // ============ Tracing ============

    /// Send the newest value of every signal to the tracers.
    fn publish_sample(&self) {
        if !self.tracers.is_running() {
            return;
        }
        let values = self
            .signal_ports
            .iter()
            .map(|&port| {
                self.diagram
                    .history_of(port)
                    .ok()
                    .and_then(|h| h.last())
                    .map_or(f64::NAN, |s| s.value)
            })
            .collect();
        self.tracers.send(TraceMessage::Sample {
            time: self.time,
            values,
        });
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}
