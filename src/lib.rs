//! Dining philosophers on OS threads.
//!
//! Philosophers sit in a ring and compete for the forks between them under
//! one of four acquisition strategies. A monitor thread watches for the
//! circular wait of the naive strategy, and a statistics thread summarises
//! meals and waits.

pub mod config;
pub mod error;
pub mod event;
pub mod fork;
pub mod monitor;
pub mod philosopher;
pub mod semaphore;
pub mod simulation;
pub mod stats;
pub mod strategy;
pub mod table;

pub type PhilosopherId = usize;
pub type ForkId = usize;

pub use config::{SimulationConfig, Timing, MAX_PHILOSOPHERS, MIN_PHILOSOPHERS};
pub use error::SimError;
pub use event::{ForkView, Notification, PhilosopherView, Snapshot, Transition};
pub use philosopher::PhilosopherState;
pub use simulation::Simulation;
pub use stats::{Efficiency, StatsReport};
pub use strategy::Strategy;
