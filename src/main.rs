use std::{
    path::PathBuf,
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dining_philosophers::{Simulation, SimulationConfig, Strategy, Transition};
use libc::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dining_philosophers", version, about = "Dining philosophers simulator")]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a table until the duration elapses or a signal arrives
    Run {
        #[arg(short = 'n', long)]
        philosophers: Option<usize>,

        #[arg(short, long, value_enum)]
        strategy: Option<Strategy>,

        /// Seconds to run; runs until interrupted when omitted
        #[arg(short, long)]
        duration: Option<f64>,

        /// TOML file with philosophers, strategy and [timing] (milliseconds)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Every philosopher starts its first cycle at the same moment
        #[arg(long)]
        synchronized: bool,

        /// Speed-up factor applied to every delay
        #[arg(long, default_value_t = 1.0)]
        speed: f64,

        /// Print one line per state transition
        #[arg(long)]
        events: bool,

        /// Print reports and the final snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Describe the acquisition strategies
    Describe {
        #[arg(value_enum)]
        strategy: Option<Strategy>,
    },
}

struct RunArgs {
    config: SimulationConfig,
    duration: Option<Duration>,
    events: bool,
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run {
            philosophers,
            strategy,
            duration,
            config,
            synchronized,
            speed,
            events,
            json,
        } => {
            let mut cfg = match config {
                Some(path) => SimulationConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => SimulationConfig::default(),
            };
            // コマンドラインの指定を優先する
            if let Some(n) = philosophers {
                cfg.philosophers = n;
            }
            if let Some(st) = strategy {
                cfg.strategy = st;
            }
            if synchronized {
                cfg.timing.synchronized_start = true;
            }
            if !(speed.is_finite() && speed > 0.0) {
                bail!("--speed must be a positive number, got {speed}");
            }
            cfg.timing = cfg.timing.scaled(1.0 / speed);
            cfg.validate()?;

            let duration = match duration {
                Some(secs) if secs.is_finite() && secs > 0.0 => Some(Duration::from_secs_f64(secs)),
                Some(secs) => bail!("--duration must be a positive number, got {secs}"),
                None => None,
            };

            run(RunArgs {
                config: cfg,
                duration,
                events,
                json,
            })
        }
        Command::Describe { strategy } => {
            let strategies = strategy.map_or_else(|| Strategy::ALL.to_vec(), |s| vec![s]);
            for (i, st) in strategies.into_iter().enumerate() {
                if i > 0 {
                    println!();
                }
                println!("[{}]", st.name());
                println!("{}", st.description());
            }
            Ok(())
        }
    }
}

fn run(args: RunArgs) -> Result<()> {
    let sim = Simulation::with_timing(args.config.timing);

    let printer = args.events.then(|| {
        let rx = sim.subscribe();
        thread::spawn(move || {
            for n in rx {
                match n.transition {
                    Transition::State { philosopher, state } => {
                        println!("P{philosopher} -> {state}")
                    }
                    Transition::Acquired { philosopher, fork } => {
                        println!("P{philosopher} took F{fork}")
                    }
                    Transition::Deadlock => println!("*** deadlock detected ***"),
                }
            }
        })
    });

    // SIGINT / SIGTERM で止める
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signal_handle = signals.handle();
    let (sig_tx, sig_rx) = mpsc::channel();
    let watcher = thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            let _ = sig_tx.send(sig);
        }
    });

    sim.start_with(&args.config)?;
    info!(
        philosophers = args.config.philosophers,
        strategy = %args.config.strategy,
        "press Ctrl-C to stop"
    );

    let started = Instant::now();
    let period = args.config.timing.stats_period;
    loop {
        match sig_rx.recv_timeout(period) {
            Ok(sig) => {
                info!(signal = sig, "interrupted");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if let Some(report) = sim.latest_report() {
            if args.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!("{report}\n");
            }
        }
        if args.duration.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
    }

    sim.stop();
    let report = sim.stats()?;
    let snapshot = sim.snapshot();
    sim.reset();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{report}");
    }

    signal_handle.close();
    let _ = watcher.join();
    // 購読者の送信側は Simulation が持っているので、drop すると表示スレッドが終わる
    drop(sim);
    if let Some(printer) = printer {
        let _ = printer.join();
    }
    Ok(())
}
