use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Condvar, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use crate::{
    event::{ForkView, Notification, PhilosopherView, Snapshot, Transition},
    fork::Fork,
    philosopher::Status,
    strategy::Strategy,
    ForkId, PhilosopherId,
};

// 哲学者 i の左は i 番、右は (i + 1) mod n 番のフォーク
pub fn neighbours(id: PhilosopherId, n: usize) -> (ForkId, ForkId) {
    (id, (id + 1) % n)
}

/// Everything a session shares between its threads: the forks, every
/// philosopher's observable status and the session-wide flags.
#[derive(Debug)]
pub struct Table {
    strategy: Strategy,
    forks: Vec<Fork>,
    seats: Vec<Status>,
    epoch: Instant,
    running: AtomicBool,
    deadlock: AtomicBool,
    // 開始ゲート。停止通知と同じ Condvar を使う
    gate: Mutex<bool>,
    bell: Condvar,
    events: Mutex<Option<Sender<Notification>>>,
}

impl Table {
    pub(crate) fn new(n: usize, strategy: Strategy, events: Sender<Notification>) -> Self {
        Table {
            strategy,
            forks: (0..n).map(Fork::new).collect(),
            seats: (0..n).map(|_| Status::default()).collect(),
            epoch: Instant::now(),
            running: AtomicBool::new(true),
            deadlock: AtomicBool::new(false),
            gate: Mutex::new(false),
            bell: Condvar::new(),
            events: Mutex::new(Some(events)),
        }
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn philosopher_count(&self) -> usize {
        self.seats.len()
    }

    pub fn forks(&self) -> &[Fork] {
        &self.forks
    }

    pub fn seats(&self) -> &[Status] {
        &self.seats
    }

    pub fn elapsed(&self) -> Duration {
        self.epoch.elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn deadlock_detected(&self) -> bool {
        self.deadlock.load(Ordering::Acquire)
    }

    // 一度立てたらリセットまで下ろさない。新たに立てた場合だけ true
    pub(crate) fn raise_deadlock(&self) -> bool {
        !self.deadlock.swap(true, Ordering::AcqRel)
    }

    // 停止を通知する。既に止まっていれば false
    pub(crate) fn stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        // ロックを取ってから起こすことで nap 側の見逃しを防ぐ
        let _gate = self.gate();
        self.bell.notify_all();
        was_running
    }

    pub(crate) fn open_gate(&self) {
        let mut open = self.gate();
        *open = true;
        self.bell.notify_all();
    }

    pub(crate) fn wait_gate(&self) {
        let open = self.gate();
        let _open = self
            .bell
            .wait_while(open, |open| !*open)
            .unwrap_or_else(PoisonError::into_inner);
    }

    // 最大 d だけ眠る。停止が来たら即座に起きる
    // 起きた時点でまだ動いていれば true
    pub(crate) fn nap(&self, d: Duration) -> bool {
        let gate = self.gate();
        let _gate = self
            .bell
            .wait_timeout_while(gate, d, |_| self.is_running())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_running()
    }

    pub fn fork_owners(&self) -> Vec<Option<PhilosopherId>> {
        self.forks.iter().map(Fork::owner).collect()
    }

    pub fn snapshot(&self) -> Snapshot {
        let n = self.philosopher_count();
        Snapshot {
            strategy: Some(self.strategy),
            running: self.is_running(),
            deadlock_detected: self.deadlock_detected(),
            elapsed: self.elapsed(),
            philosophers: self
                .seats
                .iter()
                .enumerate()
                .map(|(id, status)| PhilosopherView::observe(id, n, status))
                .collect(),
            forks: self.forks.iter().map(ForkView::from).collect(),
        }
    }

    pub(crate) fn publish(&self, transition: Transition) {
        let snapshot = self.snapshot();
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = events.as_ref() {
            // 配信スレッドが先に終わっていても哲学者は止めない
            let _ = tx.send(Notification {
                transition,
                snapshot,
            });
        }
    }

    pub(crate) fn close_events(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn gate(&self) -> MutexGuard<'_, bool> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
