use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::{
    fork::Fork,
    philosopher::{PhilosopherState, Status},
    strategy::Strategy,
    table::neighbours,
    ForkId, PhilosopherId,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhilosopherView {
    pub id: PhilosopherId,
    pub state: PhilosopherState,
    pub eat_count: u64,
    pub think_count: u64,
    pub wait_count: u64,
    #[serde(serialize_with = "seconds")]
    pub max_wait: Duration,
    #[serde(serialize_with = "seconds")]
    pub last_action: Duration,
    pub left_fork: ForkId,
    pub right_fork: ForkId,
    // 入場制御の許可を持っているか (Limit 以外は常に false)
    pub admitted: bool,
}

impl PhilosopherView {
    pub(crate) fn observe(id: PhilosopherId, n: usize, status: &Status) -> Self {
        let (left_fork, right_fork) = neighbours(id, n);
        PhilosopherView {
            id,
            state: status.state(),
            eat_count: status.eat_count(),
            think_count: status.think_count(),
            wait_count: status.wait_count(),
            max_wait: status.max_wait(),
            last_action: status.last_action(),
            left_fork,
            right_fork,
            admitted: status.admitted(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForkView {
    pub id: ForkId,
    pub available: bool,
    pub owner: Option<PhilosopherId>,
}

impl From<&Fork> for ForkView {
    fn from(fork: &Fork) -> Self {
        // owner と available は同じ読み取りから作る
        let owner = fork.owner();
        ForkView {
            id: fork.id(),
            available: owner.is_none(),
            owner,
        }
    }
}

/// Read-only view of a session for renderers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub strategy: Option<Strategy>,
    pub running: bool,
    pub deadlock_detected: bool,
    #[serde(serialize_with = "seconds")]
    pub elapsed: Duration,
    pub philosophers: Vec<PhilosopherView>,
    pub forks: Vec<ForkView>,
}

impl Snapshot {
    // セッションが無いときの空のテーブル
    pub fn empty() -> Self {
        Snapshot {
            strategy: None,
            running: false,
            deadlock_detected: false,
            elapsed: Duration::ZERO,
            philosophers: Vec::new(),
            forks: Vec::new(),
        }
    }

    pub fn count_in(&self, state: PhilosopherState) -> usize {
        self.philosophers
            .iter()
            .filter(|p| p.state == state)
            .count()
    }

    pub fn admitted_count(&self) -> usize {
        self.philosophers.iter().filter(|p| p.admitted).count()
    }

    pub fn fork_owners(&self) -> Vec<Option<PhilosopherId>> {
        self.forks.iter().map(|f| f.owner).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    State {
        philosopher: PhilosopherId,
        state: PhilosopherState,
    },
    Acquired {
        philosopher: PhilosopherId,
        fork: ForkId,
    },
    Deadlock,
}

// 購読者に届く通知。原因となった遷移と、その直後のテーブルの様子
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub transition: Transition,
    pub snapshot: Snapshot,
}

pub(crate) fn seconds<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}
