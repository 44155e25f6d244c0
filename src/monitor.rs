use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{event::Transition, table::Table, PhilosopherId};

/// True when every philosopher holds its own left fork and its right fork is
/// held by someone else. `owners[i]` is the owner of fork `i`; philosopher
/// `i` sits between fork `i` (left) and fork `i + 1` (right).
///
/// Only fork ownership is consulted. A philosopher that has already timed
/// out and entered `Deadlocked` has put its left fork back, so it no longer
/// counts towards the cycle; a state-based check would also count it.
pub fn circular_wait(owners: &[Option<PhilosopherId>]) -> bool {
    let n = owners.len();
    if n == 0 {
        return false;
    }
    (0..n).all(|i| {
        let holds_left = owners[i] == Some(i);
        let right_taken = matches!(owners[(i + 1) % n], Some(o) if o != i);
        holds_left && right_taken
    })
}

/// Periodically samples fork ownership and raises the table's sticky
/// deadlock flag. This is a sampling heuristic: a cyclic wait that forms and
/// dissolves between two samples goes unnoticed.
#[derive(Debug)]
pub struct DeadlockMonitor {
    table: Arc<Table>,
    period: Duration,
}

impl DeadlockMonitor {
    pub fn new(table: Arc<Table>, period: Duration) -> Self {
        DeadlockMonitor { table, period }
    }

    pub fn run(self) {
        self.table.wait_gate();
        while self.table.nap(self.period) {
            self.sample();
        }
        debug!("deadlock monitor stopped");
    }

    // 1 回分の観測。新たにデッドロックを検出したら true
    pub fn sample(&self) -> bool {
        let owners = self.table.fork_owners();
        let cyclic = circular_wait(&owners);
        // Naive 以外は構造的にデッドロックしないので警報は出さない
        if !cyclic || !self.table.strategy().may_deadlock() {
            return false;
        }
        if !self.table.raise_deadlock() {
            return false;
        }
        warn!(
            philosophers = owners.len(),
            strategy = %self.table.strategy(),
            "deadlock detected: every philosopher holds its left fork"
        );
        self.table.publish(Transition::Deadlock);
        true
    }
}
