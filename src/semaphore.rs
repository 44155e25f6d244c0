use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

// 計数セマフォ
// cnt は現在許可を持っているスレッド数。max まで同時に入れる
#[derive(Debug)]
pub struct Semaphore {
    mutex: Mutex<usize>,
    cond: Condvar,
    max: usize,
}

// 許可証。drop で post される
#[must_use = "dropping the permit releases the admission slot"]
#[derive(Debug)]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Semaphore {
    pub fn new(max: usize) -> Self {
        Semaphore {
            mutex: Mutex::new(0),
            cond: Condvar::new(),
            max,
        }
    }

    pub fn in_use(&self) -> usize {
        *self.count()
    }

    pub fn wait(&self) {
        let cnt = self.count();
        let mut cnt = self
            .cond
            .wait_while(cnt, |cnt| *cnt >= self.max)
            .unwrap_or_else(PoisonError::into_inner);
        *cnt += 1;
    }

    pub fn try_wait(&self) -> bool {
        let mut cnt = self.count();
        if *cnt >= self.max {
            return false;
        }
        *cnt += 1;
        true
    }

    pub fn post(&self) {
        let mut cnt = self.count();
        // 許可を持たないスレッドからの post は呼び出し側の誤り
        debug_assert!(*cnt > 0, "post without a matching wait");
        *cnt = cnt.saturating_sub(1);
        drop(cnt);
        self.cond.notify_one();
    }

    pub fn permit(&self) -> Permit<'_> {
        self.wait();
        Permit { semaphore: self }
    }

    pub fn try_permit(&self) -> Option<Permit<'_>> {
        self.try_wait().then(|| Permit { semaphore: self })
    }

    fn count(&self) -> MutexGuard<'_, usize> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.post();
    }
}
