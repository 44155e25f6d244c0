use std::{fmt, str::FromStr, sync::Arc, thread, time::Duration};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    config::Timing,
    error::SimError,
    fork::{Fork, ForkGuard},
    philosopher::{PhilosopherState, Seat},
    semaphore::{Permit, Semaphore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Naive,
    Ordering,
    Limit,
    Asymmetric,
}

impl Strategy {
    pub const ALL: [Strategy; 4] = [
        Strategy::Naive,
        Strategy::Ordering,
        Strategy::Limit,
        Strategy::Asymmetric,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Strategy::Naive => "naive",
            Strategy::Ordering => "ordering",
            Strategy::Limit => "limit",
            Strategy::Asymmetric => "asymmetric",
        }
    }

    // 循環待ちが起こり得るのは Naive だけ
    pub fn may_deadlock(self) -> bool {
        matches!(self, Strategy::Naive)
    }

    pub fn description(self) -> &'static str {
        match self {
            Strategy::Naive => {
                "Naive (deadlock-prone)\n\
                 Algorithm: pick up the left fork, then the right fork, eat, put both down.\n\
                 Problem: if every philosopher takes the left fork at the same time nobody\n\
                 can get a right fork and the table deadlocks. The right fork is awaited\n\
                 with a timeout, after which the left fork is put back and the attempt retried."
            }
            Strategy::Ordering => {
                "Resource ordering\n\
                 Algorithm: forks are numbered; every philosopher takes the lower-numbered\n\
                 fork first, then the higher-numbered one.\n\
                 Advantages: circular wait is impossible, so no deadlock.\n\
                 Disadvantages: starvation is possible; some philosophers wait longer."
            }
            Strategy::Limit => {
                "Limit N-1 philosophers\n\
                 Algorithm: a counting semaphore admits at most N-1 philosophers to the\n\
                 table; forks are then taken in resource order.\n\
                 Advantages: at least one fork is always free, so no deadlock.\n\
                 Disadvantages: reduced parallelism, one philosopher always excluded."
            }
            Strategy::Asymmetric => {
                "Asymmetric pick\n\
                 Algorithm: even philosophers take the left fork first, odd philosophers\n\
                 take the right fork first. This breaks the symmetry of the naive table.\n\
                 Advantages: no deadlock, good parallelism, fair distribution of meals."
            }
        }
    }

    pub fn policy(self, philosophers: usize, timing: &Timing) -> Arc<dyn StrategyPolicy> {
        match self {
            Strategy::Naive => Arc::new(Naive {
                skew: timing.naive_skew,
                timeout: timing.naive_timeout,
            }),
            Strategy::Ordering => Arc::new(Ordered),
            Strategy::Limit => Arc::new(Limit::new(philosophers)),
            Strategy::Asymmetric => Arc::new(Asymmetric),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|st| st.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown strategy: {s}"))
    }
}

// 2 本のフォークを取得順に保持する
// フィールドは宣言順に drop されるので、後に取った方を先に書いておけば逆順に解放される
#[derive(Debug)]
pub struct Grip<'t> {
    second: ForkGuard<'t>,
    first: ForkGuard<'t>,
}

impl<'t> Grip<'t> {
    fn new(first: ForkGuard<'t>, second: ForkGuard<'t>) -> Self {
        Grip { second, first }
    }

    pub fn first_fork(&self) -> usize {
        self.first.fork_id()
    }

    pub fn second_fork(&self) -> usize {
        self.second.fork_id()
    }
}

/// Fork-acquisition algorithm, chosen once per session and shared by every
/// philosopher at the table.
pub trait StrategyPolicy: Send + Sync + fmt::Debug {
    fn kind(&self) -> Strategy;

    // 思考と食事の 1 サイクルに入る前の入場制御。Limit 以外は何もしない
    fn admit(&self, _seat: &Seat<'_>) -> Option<Permit<'_>> {
        None
    }

    fn acquire<'t>(&self, seat: &Seat<'t>) -> Result<Grip<'t>, SimError>;
}

// 両方ブロッキングで順に取る
fn grab_in_order<'t>(seat: &Seat<'t>, first: &'t Fork, second: &'t Fork) -> Grip<'t> {
    let first = first.acquire(seat.id());
    seat.took(&first);
    let second = second.acquire(seat.id());
    seat.took(&second);
    Grip::new(first, second)
}

#[derive(Debug)]
pub struct Naive {
    skew: Duration,
    timeout: Duration,
}

impl StrategyPolicy for Naive {
    fn kind(&self) -> Strategy {
        Strategy::Naive
    }

    fn acquire<'t>(&self, seat: &Seat<'t>) -> Result<Grip<'t>, SimError> {
        let left = seat.left().acquire(seat.id());
        seat.took(&left);
        // 全員が左を取り終えるだけの隙を作る
        thread::sleep(self.skew);

        match seat.right().try_acquire_for(seat.id(), self.timeout) {
            Some(right) => {
                seat.took(&right);
                Ok(Grip::new(left, right))
            }
            None => {
                seat.record_timeout();
                seat.enter(PhilosopherState::Deadlocked);
                drop(left);
                Err(SimError::AcquisitionTimeout {
                    philosopher: seat.id(),
                    fork: seat.right().id(),
                })
            }
        }
    }
}

// 番号の小さいフォークから取る
#[derive(Debug)]
pub struct Ordered;

impl StrategyPolicy for Ordered {
    fn kind(&self) -> Strategy {
        Strategy::Ordering
    }

    fn acquire<'t>(&self, seat: &Seat<'t>) -> Result<Grip<'t>, SimError> {
        let (left, right) = (seat.left(), seat.right());
        let (lo, hi) = if left.id() < right.id() {
            (left, right)
        } else {
            (right, left)
        };
        Ok(grab_in_order(seat, lo, hi))
    }
}

#[derive(Debug)]
pub struct Asymmetric;

impl StrategyPolicy for Asymmetric {
    fn kind(&self) -> Strategy {
        Strategy::Asymmetric
    }

    fn acquire<'t>(&self, seat: &Seat<'t>) -> Result<Grip<'t>, SimError> {
        let (left, right) = (seat.left(), seat.right());
        let grip = if seat.id() % 2 == 0 {
            grab_in_order(seat, left, right)
        } else {
            grab_in_order(seat, right, left)
        };
        Ok(grip)
    }
}

// 同時に席に着けるのは N-1 人まで
#[derive(Debug)]
pub struct Limit {
    seats: Semaphore,
}

impl Limit {
    pub fn new(philosophers: usize) -> Self {
        Limit {
            seats: Semaphore::new(philosophers.saturating_sub(1).max(1)),
        }
    }
}

impl StrategyPolicy for Limit {
    fn kind(&self) -> Strategy {
        Strategy::Limit
    }

    fn admit(&self, seat: &Seat<'_>) -> Option<Permit<'_>> {
        if let Some(permit) = self.seats.try_permit() {
            return Some(permit);
        }
        seat.enter(PhilosopherState::Waiting);
        trace!(philosopher = seat.id(), "waiting for a seat");
        Some(self.seats.permit())
    }

    fn acquire<'t>(&self, seat: &Seat<'t>) -> Result<Grip<'t>, SimError> {
        Ordered.acquire(seat)
    }
}
