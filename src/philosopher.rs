use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    config::Timing,
    error::SimError,
    event::Transition,
    fork::{Fork, ForkGuard},
    semaphore::Permit,
    strategy::StrategyPolicy,
    table::{neighbours, Table},
    PhilosopherId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PhilosopherState {
    Thinking = 0,
    Hungry = 1,
    Eating = 2,
    Waiting = 3,
    Deadlocked = 4,
}

impl PhilosopherState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PhilosopherState::Hungry,
            2 => PhilosopherState::Eating,
            3 => PhilosopherState::Waiting,
            4 => PhilosopherState::Deadlocked,
            _ => PhilosopherState::Thinking,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PhilosopherState::Thinking => "Thinking",
            PhilosopherState::Hungry => "Hungry",
            PhilosopherState::Eating => "Eating",
            PhilosopherState::Waiting => "Waiting",
            PhilosopherState::Deadlocked => "Deadlocked",
        }
    }
}

impl fmt::Display for PhilosopherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.label())
    }
}

// 外から観測できる哲学者の状態
// 書き込むのは哲学者自身のスレッドだけで、モニタや統計はアトミックに読むだけ
#[derive(Debug)]
pub struct Status {
    state: AtomicU8,
    eat_count: AtomicU64,
    think_count: AtomicU64,
    wait_count: AtomicU64,
    max_wait_us: AtomicU64,
    last_action_us: AtomicU64, // セッション開始からの経過時間
    admitted: AtomicBool,      // 入場制御の許可を持っているか
}

impl Default for Status {
    fn default() -> Self {
        Status {
            state: AtomicU8::new(PhilosopherState::Thinking as u8),
            eat_count: AtomicU64::new(0),
            think_count: AtomicU64::new(0),
            wait_count: AtomicU64::new(0),
            max_wait_us: AtomicU64::new(0),
            last_action_us: AtomicU64::new(0),
            admitted: AtomicBool::new(false),
        }
    }
}

impl Status {
    pub fn state(&self) -> PhilosopherState {
        PhilosopherState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn eat_count(&self) -> u64 {
        self.eat_count.load(Ordering::Relaxed)
    }

    pub fn think_count(&self) -> u64 {
        self.think_count.load(Ordering::Relaxed)
    }

    pub fn wait_count(&self) -> u64 {
        self.wait_count.load(Ordering::Relaxed)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_micros(self.max_wait_us.load(Ordering::Relaxed))
    }

    pub fn last_action(&self) -> Duration {
        Duration::from_micros(self.last_action_us.load(Ordering::Relaxed))
    }

    pub fn admitted(&self) -> bool {
        self.admitted.load(Ordering::Acquire)
    }

    fn set_state(&self, state: PhilosopherState, at: Duration) {
        self.last_action_us.store(micros(at), Ordering::Relaxed);
        self.state.store(state as u8, Ordering::Release);
    }

    fn record_wait(&self, waited: Duration) {
        self.max_wait_us.fetch_max(micros(waited), Ordering::Relaxed);
    }
}

// 許可証と admitted フラグを一緒に持つ
// drop ではフラグを先に下ろしてから許可を返すので、立っているフラグの数が上限を超えることはない
struct Admission<'a> {
    status: &'a Status,
    _permit: Option<Permit<'a>>,
}

impl<'a> Admission<'a> {
    fn new(status: &'a Status, permit: Option<Permit<'a>>) -> Self {
        status.admitted.store(permit.is_some(), Ordering::Release);
        Admission {
            status,
            _permit: permit,
        }
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        self.status.admitted.store(false, Ordering::Release);
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// A philosopher's place at the table: its id, its two forks and its
/// observable status. Strategies act on behalf of the philosopher through it.
#[derive(Debug)]
pub struct Seat<'t> {
    id: PhilosopherId,
    left: &'t Fork,
    right: &'t Fork,
    status: &'t Status,
    table: &'t Table,
}

impl<'t> Seat<'t> {
    pub(crate) fn new(id: PhilosopherId, table: &'t Table) -> Self {
        let (left, right) = neighbours(id, table.philosopher_count());
        Seat {
            id,
            left: &table.forks()[left],
            right: &table.forks()[right],
            status: &table.seats()[id],
            table,
        }
    }

    pub fn id(&self) -> PhilosopherId {
        self.id
    }

    pub fn left(&self) -> &'t Fork {
        self.left
    }

    pub fn right(&self) -> &'t Fork {
        self.right
    }

    pub fn status(&self) -> &'t Status {
        self.status
    }

    // 状態を変えて通知する
    pub fn enter(&self, state: PhilosopherState) {
        self.status.set_state(state, self.table.elapsed());
        self.table.publish(Transition::State {
            philosopher: self.id,
            state,
        });
    }

    // フォークを取った直後に通知する
    pub fn took(&self, fork: &ForkGuard<'_>) {
        trace!(philosopher = self.id, fork = fork.fork_id(), "took fork");
        self.table.publish(Transition::Acquired {
            philosopher: self.id,
            fork: fork.fork_id(),
        });
    }

    pub fn record_timeout(&self) {
        self.status.wait_count.fetch_add(1, Ordering::Relaxed);
    }

    fn think(&self) {
        self.status.think_count.fetch_add(1, Ordering::Relaxed);
        // 食後は既に Thinking に戻っている
        if self.status.state() != PhilosopherState::Thinking {
            self.enter(PhilosopherState::Thinking);
        }
    }

    fn eat(&self, waited: Duration) {
        self.status.record_wait(waited);
        self.status.eat_count.fetch_add(1, Ordering::Relaxed);
        self.enter(PhilosopherState::Eating);
    }
}

pub struct Philosopher {
    id: PhilosopherId,
    table: Arc<Table>,
    policy: Arc<dyn StrategyPolicy>,
    timing: Timing,
}

impl Philosopher {
    pub(crate) fn new(
        id: PhilosopherId,
        table: Arc<Table>,
        policy: Arc<dyn StrategyPolicy>,
        timing: Timing,
    ) -> Self {
        Philosopher {
            id,
            table,
            policy,
            timing,
        }
    }

    // 停止が通知されるまで 思考 -> 空腹 -> 食事 を繰り返す
    // 停止を確認するのはフォークを 1 本も持っていない場所だけ
    pub fn run(self) -> Result<(), SimError> {
        self.table.wait_gate();

        let seat = Seat::new(self.id, &self.table);
        let mut rng = rand::thread_rng();
        let mut first_cycle = true;
        debug!(philosopher = self.id, strategy = %self.policy.kind(), "seated");

        while self.table.is_running() {
            let admission = Admission::new(seat.status(), self.policy.admit(&seat));
            if !self.table.is_running() {
                break;
            }

            seat.think();
            let pause = self.timing.think_for(self.id, first_cycle, &mut rng);
            first_cycle = false;
            if !self.table.nap(pause) {
                break;
            }

            self.dine(&seat)?;
            drop(admission);
        }

        seat.enter(PhilosopherState::Thinking);
        debug!(
            philosopher = self.id,
            meals = seat.status().eat_count(),
            "left the table"
        );
        Ok(())
    }

    // 食べ終わるか、待ちを諦めた後に停止が来るまで戻らない
    fn dine(&self, seat: &Seat<'_>) -> Result<(), SimError> {
        loop {
            seat.enter(PhilosopherState::Hungry);
            let hungry_since = Instant::now();

            match self.policy.acquire(seat) {
                Ok(grip) => {
                    seat.eat(hungry_since.elapsed());
                    thread::sleep(self.timing.eat);
                    trace!(
                        philosopher = self.id,
                        first = grip.first_fork(),
                        second = grip.second_fork(),
                        "done eating"
                    );
                    drop(grip);
                    seat.enter(PhilosopherState::Thinking);
                    return Ok(());
                }
                Err(SimError::AcquisitionTimeout { fork, .. }) => {
                    debug!(philosopher = self.id, fork, "gave up waiting for fork");
                    if !self.table.nap(self.timing.naive_backoff) {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl fmt::Debug for Philosopher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Philosopher")
            .field("id", &self.id)
            .field("strategy", &self.policy.kind())
            .finish()
    }
}
