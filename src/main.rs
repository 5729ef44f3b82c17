//! CBD - Causal Block Diagram simulator
//!
//! Runs one of the bundled demo models and prints the final value of
//! every signal.
//!
//! # Usage
//!
//! ```bash
//! cbd bouncing_ball --delta 0.01 --end 15 --locator itp
//! ```

use clap::{Parser, ValueEnum};
use cbd_core::{
    demos,
    error::Result,
    events::{Bisection, Itp, LinearInterpolation, PostCrossing, PreCrossing, RegulaFalsi},
    tracer::LogTracer,
    SimulatorConfig, DEFAULT_DELTA_T, DEFAULT_END_TIME,
};

/// Crossing-time locator for state events.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Locator {
    Pre,
    Post,
    Linear,
    Bisection,
    RegulaFalsi,
    Itp,
}

/// Causal block diagram simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Demo model to run
    #[arg(value_name = "DEMO", default_value = "bouncing_ball")]
    demo: String,

    /// Step size of the clock
    #[arg(short, long, default_value_t = DEFAULT_DELTA_T)]
    delta: f64,

    /// Termination time
    #[arg(short, long, default_value_t = DEFAULT_END_TIME)]
    end: f64,

    /// State-event locator
    #[arg(short, long, value_enum, default_value_t = Locator::RegulaFalsi)]
    locator: Locator,

    /// Pace the run against the wall clock with this scale
    #[arg(long, value_name = "SCALE")]
    realtime: Option<f64>,

    /// Log every traced row
    #[arg(long)]
    trace: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    cbd_core::init_logging(&args.log_level);

    let mut config = SimulatorConfig::new()
        .with_delta_t(args.delta)
        .with_termination_time(args.end);
    if let Some(scale) = args.realtime {
        config = config.with_real_time(scale);
    }

    let mut sim = demos::demo(&args.demo)?.into_simulator(config);
    match args.locator {
        Locator::Pre => sim.set_state_event_locator(PreCrossing),
        Locator::Post => sim.set_state_event_locator(PostCrossing),
        Locator::Linear => sim.set_state_event_locator(LinearInterpolation),
        Locator::Bisection => sim.set_state_event_locator(Bisection::default()),
        Locator::RegulaFalsi => sim.set_state_event_locator(RegulaFalsi::default()),
        Locator::Itp => sim.set_state_event_locator(Itp::default()),
    }
    if args.trace {
        sim.add_tracer(LogTracer)?;
    }

    sim.run()?;

    let diagram = sim.diagram();
    println!("time = {}", sim.time());
    for name in diagram.all_signal_names() {
        if let Some(signal) = diagram.signal_history(&name)?.last() {
            println!("{} = {}", name, signal.value);
        }
    }
    Ok(())
}
