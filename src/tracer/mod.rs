//! Delivery of simulation samples to tracers.
//!
//! The simulator pushes [`TraceMessage`]s into a channel; a worker thread
//! drains it and hands rows to every registered [`Tracer`]. Delivery is
//! fire-and-forget: a slow tracer never holds up the simulation.

mod interpolate;

pub use interpolate::{Interpolation, Interpolator};

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::error::{CbdError, Result};

/// What the simulator reports to the tracer worker.
#[derive(Debug, Clone)]
pub enum TraceMessage {
    /// A run begins; `names` labels every value of later samples.
    Started { names: Arc<[String]>, start_time: f64 },
    IterationStart { iteration: usize, time: f64 },
    /// Newest value of every signal after an iteration.
    Sample { time: f64, values: Vec<f64> },
    Finished,
}

/// One row handed to a tracer.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRecord {
    pub time: f64,
    pub names: Arc<[String]>,
    pub values: Vec<f64>,
}

impl TraceRecord {
    /// Value of the signal called `name`.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.names.iter().position(|n| n == name).map(|i| self.values[i])
    }
}

/// A consumer of simulation rows.
pub trait Tracer: Send {
    fn start(&mut self, _names: &[String]) {}

    fn iteration(&mut self, _iteration: usize, _time: f64) {}

    fn trace(&mut self, record: &TraceRecord);

    fn finish(&mut self) {}
}

/// Forwards every row to a channel.
pub struct ChannelTracer {
    sender: Sender<TraceRecord>,
}

impl ChannelTracer {
    pub fn new() -> (Self, Receiver<TraceRecord>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl Tracer for ChannelTracer {
    fn trace(&mut self, record: &TraceRecord) {
        // A dropped receiver only means nobody listens anymore.
        let _ = self.sender.send(record.clone());
    }
}

/// Writes every row to the log at info level.
#[derive(Debug, Default)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn start(&mut self, names: &[String]) {
        info!(signals = names.len(), "trace started");
    }

    fn trace(&mut self, record: &TraceRecord) {
        let row: Vec<String> = record
            .names
            .iter()
            .zip(&record.values)
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        info!(time = record.time, "{}", row.join(" "));
    }

    fn finish(&mut self) {
        info!("trace finished");
    }
}

struct Registration {
    tracer: Box<dyn Tracer>,
    interval: Option<(f64, Interpolation)>,
    interpolator: Option<Interpolator>,
}

impl Registration {
    fn handle(&mut self, message: &TraceMessage, names: &Arc<[String]>) {
        match message {
            TraceMessage::Started { names, start_time } => {
                self.interpolator = self
                    .interval
                    .map(|(ci, method)| Interpolator::new(ci, method, *start_time));
                self.tracer.start(names);
            }
            TraceMessage::IterationStart { iteration, time } => self.tracer.iteration(*iteration, *time),
            TraceMessage::Sample { time, values } => match &mut self.interpolator {
                Some(interpolator) => {
                    for (time, values) in interpolator.feed(*time, values) {
                        self.tracer.trace(&TraceRecord {
                            time,
                            names: names.clone(),
                            values,
                        });
                    }
                }
                None => self.tracer.trace(&TraceRecord {
                    time: *time,
                    names: names.clone(),
                    values: values.clone(),
                }),
            },
            TraceMessage::Finished => self.tracer.finish(),
        }
    }
}

/// Owns the registered tracers and, while a run is active, the worker
/// thread serving them.
#[derive(Default)]
pub struct TraceDispatcher {
    pending: Vec<Registration>,
    sender: Option<Sender<TraceMessage>>,
    worker: Option<JoinHandle<()>>,
}

impl TraceDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tracer receiving raw samples, or rows every `ci` time
    /// units when an interval is given.
    pub fn add(&mut self, tracer: Box<dyn Tracer>, interval: Option<(f64, Interpolation)>) -> Result<()> {
        if let Some((ci, _)) = interval {
            if !(ci > 0.0 && ci.is_finite()) {
                return Err(CbdError::invalid_parameter(
                    "communication interval",
                    format!("must be positive, got {}", ci),
                ));
            }
        }
        if self.is_running() {
            warn!("tracer added while a run is active, it will not receive samples");
        }
        self.pending.push(Registration {
            tracer,
            interval,
            interpolator: None,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.sender.is_some()
    }

    /// Spawn the worker with every registered tracer. Without tracers no
    /// thread is started and messages are dropped.
    pub fn start(&mut self) -> Result<()> {
        if self.pending.is_empty() || self.is_running() {
            return Ok(());
        }
        let mut registrations = std::mem::take(&mut self.pending);
        let (sender, receiver) = mpsc::channel::<TraceMessage>();
        let worker = thread::Builder::new()
            .name("cbd-tracer".to_string())
            .spawn(move || {
                let mut names: Arc<[String]> = Arc::from(Vec::new());
                for message in receiver {
                    if let TraceMessage::Started { names: started, .. } = &message {
                        names = started.clone();
                    }
                    for registration in &mut registrations {
                        registration.handle(&message, &names);
                    }
                    if matches!(message, TraceMessage::Finished) {
                        break;
                    }
                }
            })
            .map_err(|e| CbdError::TracerWorker {
                message: e.to_string(),
            })?;
        debug!("tracer worker started");
        self.sender = Some(sender);
        self.worker = Some(worker);
        Ok(())
    }

    /// Queue a message for the worker.
    pub fn send(&self, message: TraceMessage) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(message);
        }
    }

    /// Send [`TraceMessage::Finished`] and wait until every queued message
    /// is delivered.
    pub fn finish(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(TraceMessage::Finished);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("tracer worker panicked");
            }
        }
    }
}

impl Drop for TraceDispatcher {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Arc<[String]> {
        Arc::from(vec!["a".to_string(), "b".to_string()])
    }

    #[test]
    fn test_raw_samples_reach_tracers() {
        let (tracer, receiver) = ChannelTracer::new();
        let mut dispatcher = TraceDispatcher::new();
        dispatcher.add(Box::new(tracer), None).unwrap();
        dispatcher.start().unwrap();
        dispatcher.send(TraceMessage::Started {
            names: names(),
            start_time: 0.0,
        });
        dispatcher.send(TraceMessage::Sample {
            time: 0.0,
            values: vec![1.0, 2.0],
        });
        dispatcher.send(TraceMessage::Sample {
            time: 1.0,
            values: vec![3.0, 4.0],
        });
        dispatcher.finish();

        let rows: Vec<TraceRecord> = receiver.iter().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].time, 1.0);
        assert_eq!(rows[1].value("b"), Some(4.0));
        assert_eq!(rows[1].value("c"), None);
    }

    #[test]
    fn test_interval_tracers_get_resampled_rows() {
        let (tracer, receiver) = ChannelTracer::new();
        let mut dispatcher = TraceDispatcher::new();
        dispatcher
            .add(Box::new(tracer), Some((0.5, Interpolation::Linear)))
            .unwrap();
        assert!(dispatcher.add(Box::new(LogTracer), Some((0.0, Interpolation::Hold))).is_err());
        dispatcher.start().unwrap();
        dispatcher.send(TraceMessage::Started {
            names: names(),
            start_time: 0.0,
        });
        for k in 0..3 {
            let t = k as f64;
            dispatcher.send(TraceMessage::Sample {
                time: t,
                values: vec![t, -t],
            });
        }
        dispatcher.finish();

        let rows: Vec<(f64, f64)> = receiver.iter().map(|r| (r.time, r.values[1])).collect();
        assert_eq!(rows, vec![(0.0, 0.0), (0.5, -0.5), (1.0, -1.0), (1.5, -1.5), (2.0, -2.0)]);
    }

    #[test]
    fn test_dispatcher_without_tracers_is_inert() {
        let mut dispatcher = TraceDispatcher::new();
        dispatcher.start().unwrap();
        assert!(!dispatcher.is_running());
        dispatcher.send(TraceMessage::Finished);
        dispatcher.finish();
    }
}
