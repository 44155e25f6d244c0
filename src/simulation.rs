use std::{
    mem,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info};

use crate::{
    config::{validate_philosophers, SimulationConfig, Timing},
    error::SimError,
    event::{Notification, Snapshot},
    monitor::DeadlockMonitor,
    philosopher::Philosopher,
    stats::{LatestReport, StatsAggregator, StatsReport},
    strategy::{Strategy, StrategyPolicy},
    table::Table,
};

type Subscribers = Arc<Mutex<Vec<Sender<Notification>>>>;

/// Owns the lifecycle of one table of philosophers at a time and hands out
/// snapshots and notification streams to renderers.
#[derive(Debug)]
pub struct Simulation {
    timing: Timing,
    session: Mutex<Option<Session>>,
    subscribers: Subscribers,
}

// 1 回分のセッション。フォークと哲学者はまとめて作られ、まとめて破棄される
#[derive(Debug)]
struct Session {
    table: Arc<Table>,
    philosophers: Vec<JoinHandle<Result<(), SimError>>>,
    observers: Vec<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    latest: LatestReport,
}

impl Default for Simulation {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulation {
    pub fn new() -> Self {
        Self::with_timing(Timing::default())
    }

    pub fn with_timing(timing: Timing) -> Self {
        Simulation {
            timing,
            session: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    // 設定ファイルの待ち時間でセッションを始める
    pub fn start_with(&self, config: &SimulationConfig) -> Result<(), SimError> {
        self.launch(config.philosophers, config.strategy, config.timing)
    }

    pub fn start(&self, philosophers: usize, strategy: Strategy) -> Result<(), SimError> {
        self.launch(philosophers, strategy, self.timing)
    }

    fn launch(&self, philosophers: usize, strategy: Strategy, timing: Timing) -> Result<(), SimError> {
        validate_philosophers(philosophers)?;

        let mut slot = self.session();
        if slot.as_ref().is_some_and(|s| s.table.is_running()) {
            return Err(SimError::AlreadyRunning);
        }
        // 止まっているだけの前回のセッションはここで片付ける
        if let Some(stale) = slot.take() {
            stale.shutdown();
        }

        *slot = Some(Session::launch(
            philosophers,
            strategy,
            timing,
            self.subscribers.clone(),
        )?);
        info!(philosophers, %strategy, "simulation started");
        Ok(())
    }

    // 何度呼んでもよい。哲学者はフォークを持っていない所で止まる
    pub fn stop(&self) {
        if let Some(session) = self.session().as_ref() {
            if session.table.stop() {
                info!("simulation stopping");
            }
        }
    }

    pub fn reset(&self) {
        let session = self.session().take();
        if let Some(session) = session {
            session.shutdown();
            info!("simulation reset");
        }
    }

    pub fn is_running(&self) -> bool {
        self.session()
            .as_ref()
            .is_some_and(|s| s.table.is_running())
    }

    pub fn deadlock_detected(&self) -> bool {
        self.session()
            .as_ref()
            .is_some_and(|s| s.table.deadlock_detected())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.session()
            .as_ref()
            .map_or_else(Snapshot::empty, |s| s.table.snapshot())
    }

    // その場で集計する
    pub fn stats(&self) -> Result<StatsReport, SimError> {
        self.session()
            .as_ref()
            .map(|s| StatsReport::collect(&s.table))
            .ok_or(SimError::NotRunning)
    }

    // 集計スレッドが最後に作ったレポート
    pub fn latest_report(&self) -> Option<StatsReport> {
        let slot = self.session();
        let session = slot.as_ref()?;
        let latest = session.latest.lock().unwrap_or_else(PoisonError::into_inner);
        latest.clone()
    }

    /// Every state change of every philosopher is delivered to the returned
    /// receiver, together with a snapshot taken right after it. Subscriptions
    /// survive resets; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.reset();
    }
}

impl Session {
    fn launch(
        n: usize,
        strategy: Strategy,
        timing: Timing,
        subscribers: Subscribers,
    ) -> Result<Self, SimError> {
        let (tx, rx) = mpsc::channel();
        let table = Arc::new(Table::new(n, strategy, tx));
        let policy = strategy.policy(n, &timing);
        let latest = LatestReport::default();

        let mut session = Session {
            table: table.clone(),
            philosophers: Vec::with_capacity(n),
            observers: Vec::with_capacity(2),
            dispatcher: Some(spawn("dispatcher", move || dispatch(rx, subscribers))?),
            latest,
        };

        // 途中で失敗したら、それまでに作ったスレッドを止めてから返す
        if let Err(e) = session.seat_everyone(policy, timing) {
            session.shutdown();
            return Err(e);
        }

        // 全員そろってから一斉に開始する
        table.open_gate();
        Ok(session)
    }

    fn seat_everyone(
        &mut self,
        policy: Arc<dyn StrategyPolicy>,
        timing: Timing,
    ) -> Result<(), SimError> {
        for id in 0..self.table.philosopher_count() {
            let philosopher = Philosopher::new(id, self.table.clone(), policy.clone(), timing);
            self.philosophers
                .push(spawn(&format!("philosopher-{id}"), move || philosopher.run())?);
        }

        let monitor = DeadlockMonitor::new(self.table.clone(), timing.monitor_period);
        self.observers
            .push(spawn("deadlock-monitor", move || monitor.run())?);

        let aggregator =
            StatsAggregator::new(self.table.clone(), timing.stats_period, self.latest.clone());
        self.observers
            .push(spawn("stats-aggregator", move || aggregator.run())?);
        Ok(())
    }

    // 停止を通知し、全スレッドの終了を待ってから破棄する
    fn shutdown(mut self) {
        self.table.stop();
        // 開始前に失敗した場合でもゲート待ちのスレッドを起こす
        self.table.open_gate();

        for (id, handle) in mem::take(&mut self.philosophers).into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(philosopher = id, error = %e, "philosopher failed"),
                Err(_) => error!(philosopher = id, "philosopher thread panicked"),
            }
        }
        for handle in mem::take(&mut self.observers) {
            if handle.join().is_err() {
                error!("observer thread panicked");
            }
        }

        self.table.close_events();
        if let Some(dispatcher) = self.dispatcher.take() {
            if dispatcher.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
        debug!(deadlock = self.table.deadlock_detected(), "session torn down");
    }
}

fn spawn<T, F>(name: &str, f: F) -> Result<JoinHandle<T>, SimError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| SimError::Spawn {
            name: name.to_string(),
            source,
        })
}

// 哲学者から来た通知を購読者に配る。受信側が居なくなった購読者は外す
fn dispatch(rx: Receiver<Notification>, subscribers: Subscribers) {
    for notification in rx {
        let mut subs = subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subs.retain(|tx| tx.send(notification.clone()).is_ok());
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    fn quick() -> Timing {
        Timing {
            think_base: Duration::from_millis(5),
            think_step: Duration::from_millis(1),
            eat: Duration::from_millis(5),
            naive_skew: Duration::from_millis(1),
            naive_timeout: Duration::from_millis(50),
            naive_backoff: Duration::from_millis(5),
            monitor_period: Duration::from_millis(5),
            stats_period: Duration::from_millis(10),
            ..Timing::default()
        }
    }

    #[test]
    fn test_invalid_configuration_rejected() {
        let sim = Simulation::with_timing(quick());
        for n in [0, 2, 11] {
            assert!(matches!(
                sim.start(n, Strategy::Ordering),
                Err(SimError::InvalidConfiguration { .. })
            ));
        }
        assert!(!sim.is_running());
        assert_eq!(sim.snapshot(), Snapshot::empty());
        assert!(matches!(sim.stats(), Err(SimError::NotRunning)));
    }

    #[test]
    fn test_already_running() {
        let sim = Simulation::with_timing(quick());
        sim.start(3, Strategy::Asymmetric).unwrap();
        assert!(matches!(
            sim.start(4, Strategy::Ordering),
            Err(SimError::AlreadyRunning)
        ));
        // 失敗した start はセッションに触らない
        let snap = sim.snapshot();
        assert_eq!(snap.philosophers.len(), 3);
        assert_eq!(snap.strategy, Some(Strategy::Asymmetric));
        sim.reset();
    }

    #[test]
    fn test_stop_is_idempotent_and_reset_clears() {
        let sim = Simulation::with_timing(quick());
        sim.stop();
        sim.start(5, Strategy::Limit).unwrap();
        assert!(sim.is_running());
        sim.stop();
        sim.stop();
        assert!(!sim.is_running());

        // reset 前ならまだテーブルを観測できる
        assert_eq!(sim.snapshot().forks.len(), 5);
        assert!(sim.stats().is_ok());

        sim.reset();
        let snap = sim.snapshot();
        assert!(snap.philosophers.is_empty());
        assert!(!snap.deadlock_detected);
        assert!(matches!(sim.stats(), Err(SimError::NotRunning)));
    }

    #[test]
    fn test_restart_after_stop() {
        let sim = Simulation::with_timing(quick());
        sim.start(3, Strategy::Ordering).unwrap();
        sim.stop();
        sim.start(6, Strategy::Asymmetric).unwrap();
        let snap = sim.snapshot();
        assert_eq!(snap.forks.len(), 6);
        assert!(snap.running);
        sim.reset();
    }

    #[test]
    fn test_reset_releases_every_fork() {
        let sim = Simulation::with_timing(quick());
        sim.start(4, Strategy::Naive).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let table = sim.session().as_ref().map(|s| s.table.clone()).unwrap();
        sim.reset();
        // reset は全員がテーブルを離れるまで待つ
        assert!(table.forks().iter().all(|f| f.is_available()));
        assert!(table
            .seats()
            .iter()
            .all(|s| s.state() == crate::philosopher::PhilosopherState::Thinking));
    }

    #[test]
    fn test_subscription_receives_transitions() {
        let sim = Simulation::with_timing(quick());
        let rx = sim.subscribe();
        sim.start(3, Strategy::Ordering).unwrap();
        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first.snapshot.philosophers.len(), 3);
        sim.reset();
    }

    #[test]
    fn test_latest_report_published() {
        let sim = Simulation::with_timing(quick());
        sim.start(3, Strategy::Asymmetric).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while sim.latest_report().is_none() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let report = sim.latest_report().unwrap();
        assert_eq!(report.strategy, Strategy::Asymmetric);
        sim.reset();
        assert!(sim.latest_report().is_none());
    }
}
