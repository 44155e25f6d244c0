use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tracing::debug;

use crate::{
    event::{seconds, PhilosopherView},
    philosopher::PhilosopherState,
    strategy::Strategy,
    table::Table,
    PhilosopherId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Efficiency {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Efficiency {
    // 1 人あたりの平均食事回数で分類する
    pub fn classify(average_meals: f64) -> Self {
        if average_meals > 10.0 {
            Efficiency::Excellent
        } else if average_meals > 5.0 {
            Efficiency::Good
        } else if average_meals > 2.0 {
            Efficiency::Fair
        } else {
            Efficiency::Poor
        }
    }
}

impl fmt::Display for Efficiency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Efficiency::Excellent => "EXCELLENT",
            Efficiency::Good => "GOOD",
            Efficiency::Fair => "FAIR",
            Efficiency::Poor => "POOR",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhilosopherRow {
    pub id: PhilosopherId,
    pub state: PhilosopherState,
    pub eat_count: u64,
    pub think_count: u64,
    pub wait_count: u64,
    #[serde(serialize_with = "seconds")]
    pub max_wait: Duration,
}

impl From<&PhilosopherView> for PhilosopherRow {
    fn from(v: &PhilosopherView) -> Self {
        PhilosopherRow {
            id: v.id,
            state: v.state,
            eat_count: v.eat_count,
            think_count: v.think_count,
            wait_count: v.wait_count,
            max_wait: v.max_wait,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    pub strategy: Strategy,
    pub philosophers: Vec<PhilosopherRow>,
    pub total_meals: u64,
    pub total_waits: u64,
    #[serde(serialize_with = "seconds")]
    pub max_wait: Duration,
    pub average_meals: f64,
    pub efficiency: Efficiency,
    pub deadlock_detected: bool,
}

impl StatsReport {
    pub fn collect(table: &Table) -> Self {
        let snapshot = table.snapshot();
        Self::from_rows(
            table.strategy(),
            snapshot.philosophers.iter().map(PhilosopherRow::from).collect(),
            snapshot.deadlock_detected,
        )
    }

    pub fn from_rows(
        strategy: Strategy,
        philosophers: Vec<PhilosopherRow>,
        deadlock_detected: bool,
    ) -> Self {
        let total_meals = philosophers.iter().map(|p| p.eat_count).sum::<u64>();
        let total_waits = philosophers.iter().map(|p| p.wait_count).sum();
        let max_wait = philosophers
            .iter()
            .map(|p| p.max_wait)
            .max()
            .unwrap_or_default();
        let average_meals = if philosophers.is_empty() {
            0.0
        } else {
            total_meals as f64 / philosophers.len() as f64
        };

        StatsReport {
            strategy,
            philosophers,
            total_meals,
            total_waits,
            max_wait,
            average_meals,
            efficiency: Efficiency::classify(average_meals),
            deadlock_detected,
        }
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(60);
        writeln!(f, "{rule}")?;
        writeln!(f, "  SOLUTION: {}", self.strategy.name().to_uppercase())?;
        writeln!(f, "  PHILOSOPHERS: {}", self.philosophers.len())?;
        writeln!(f, "{rule}")?;
        writeln!(
            f,
            "{:<5} {:<11} {:<5} {:<6} {:<5} {:<8}",
            "Phil", "State", "Ate", "Think", "Wait", "MaxWait"
        )?;
        writeln!(f, "{}", "-".repeat(60))?;
        for p in &self.philosophers {
            writeln!(
                f,
                "P{:<4} {:<11} {:<5} {:<6} {:<5} {:.2}s",
                p.id,
                p.state,
                p.eat_count,
                p.think_count,
                p.wait_count,
                p.max_wait.as_secs_f64()
            )?;
        }
        writeln!(f, "{rule}")?;
        writeln!(f, "Total meals served: {}", self.total_meals)?;
        writeln!(f, "Total wait events:  {}", self.total_waits)?;
        writeln!(f, "Max wait time:      {:.2}s", self.max_wait.as_secs_f64())?;
        if self.deadlock_detected {
            writeln!(f, "{}", "!".repeat(40))?;
            writeln!(f, "DEADLOCK DETECTED! System is stuck.")?;
            writeln!(f, "{}", "!".repeat(40))?;
        }
        writeln!(f, "Avg meals/phil:     {:.2}", self.average_meals)?;
        writeln!(f, "Efficiency:         {}", self.efficiency)?;
        write!(
            f,
            "Deadlock:           {}",
            if self.deadlock_detected {
                "YES - SYSTEM STUCK"
            } else {
                "NO - RUNNING SMOOTHLY"
            }
        )
    }
}

// 最新の集計結果。集計スレッドが書き、コントローラが読む
pub type LatestReport = Arc<Mutex<Option<StatsReport>>>;

#[derive(Debug)]
pub struct StatsAggregator {
    table: Arc<Table>,
    period: Duration,
    latest: LatestReport,
}

impl StatsAggregator {
    pub fn new(table: Arc<Table>, period: Duration, latest: LatestReport) -> Self {
        StatsAggregator {
            table,
            period,
            latest,
        }
    }

    pub fn run(self) {
        self.table.wait_gate();
        while self.table.nap(self.period) {
            self.tick();
        }
        // 止まった直後の値も残しておく
        self.tick();
        debug!("stats aggregator stopped");
    }

    pub fn tick(&self) -> StatsReport {
        let report = StatsReport::collect(&self.table);
        debug!(
            meals = report.total_meals,
            waits = report.total_waits,
            max_wait_ms = report.max_wait.as_millis(),
            deadlock = report.deadlock_detected,
            "stats"
        );
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }
}
