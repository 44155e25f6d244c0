use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tracing::error;

use crate::{error::SimError, ForkId, PhilosopherId};

// フォーク 1 本
// ロック状態と所有者は同じ Mutex で守る。所有者が Some ならロック中
#[derive(Debug)]
pub struct Fork {
    id: ForkId,
    owner: Mutex<Option<PhilosopherId>>,
    released: Condvar,
}

// フォークを持っている間だけ存在する型
// drop されると所有者をクリアしてフォークを解放する
#[must_use = "dropping the guard puts the fork back on the table"]
#[derive(Debug)]
pub struct ForkGuard<'a> {
    fork: &'a Fork,
    holder: PhilosopherId,
}

impl Fork {
    pub fn new(id: ForkId) -> Self {
        Fork {
            id,
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    pub fn id(&self) -> ForkId {
        self.id
    }

    pub fn owner(&self) -> Option<PhilosopherId> {
        *self.slot()
    }

    pub fn is_available(&self) -> bool {
        self.owner().is_none()
    }

    // ブロックしない。取れなければ None
    pub fn try_acquire(&self, holder: PhilosopherId) -> Option<ForkGuard<'_>> {
        let mut owner = self.slot();
        if owner.is_some() {
            return None;
        }
        *owner = Some(holder);
        Some(self.guard(holder))
    }

    // 取れるまで待つ
    pub fn acquire(&self, holder: PhilosopherId) -> ForkGuard<'_> {
        let owner = self.slot();
        let mut owner = self
            .released
            .wait_while(owner, |o| o.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        *owner = Some(holder);
        self.guard(holder)
    }

    /// Waits at most `timeout` for the fork. Sleeps on the condition variable
    /// until the deadline, never spins.
    pub fn try_acquire_for(
        &self,
        holder: PhilosopherId,
        timeout: Duration,
    ) -> Option<ForkGuard<'_>> {
        let owner = self.slot();
        let (mut owner, _) = self
            .released
            .wait_timeout_while(owner, timeout, |o| o.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        if owner.is_some() {
            return None;
        }
        *owner = Some(holder);
        Some(self.guard(holder))
    }

    // 所有者本人以外が解放しようとした場合はフォークに触らずエラー
    pub fn release(&self, holder: PhilosopherId) -> Result<(), SimError> {
        let mut owner = self.slot();
        if *owner != Some(holder) {
            return Err(SimError::OwnershipViolation {
                fork: self.id,
                holder,
                owner: *owner,
            });
        }
        *owner = None;
        drop(owner);
        // 待っているのは両隣の 2 人だけ
        self.released.notify_all();
        Ok(())
    }

    fn guard(&self, holder: PhilosopherId) -> ForkGuard<'_> {
        ForkGuard { fork: self, holder }
    }

    fn slot(&self) -> MutexGuard<'_, Option<PhilosopherId>> {
        // Option しか守っていないので poison されても中身は壊れていない
        self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ForkGuard<'_> {
    pub fn fork_id(&self) -> ForkId {
        self.fork.id
    }

    pub fn holder(&self) -> PhilosopherId {
        self.holder
    }
}

impl Drop for ForkGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.fork.release(self.holder) {
            error!(error = %e, "fork guard dropped without ownership");
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::Instant,
    };

    use super::*;

    #[test]
    fn test_try_acquire_denied_while_held() {
        let fork = Fork::new(0);
        let g = fork.try_acquire(1).unwrap();
        assert_eq!(fork.owner(), Some(1));
        assert!(fork.try_acquire(2).is_none());
        drop(g);
        assert!(fork.is_available());
        assert!(fork.try_acquire(2).is_some());
    }

    #[test]
    fn test_release_by_non_owner() {
        let fork = Fork::new(3);
        let g = fork.acquire(0);
        let err = fork.release(1).unwrap_err();
        assert!(matches!(
            err,
            SimError::OwnershipViolation {
                fork: 3,
                holder: 1,
                owner: Some(0)
            }
        ));
        // 所有者は変わらない
        assert_eq!(fork.owner(), Some(0));
        drop(g);
        assert!(matches!(
            fork.release(0),
            Err(SimError::OwnershipViolation { owner: None, .. })
        ));
    }

    #[test]
    fn test_bounded_wait_expires() {
        let fork = Fork::new(0);
        let _g = fork.acquire(0);
        let start = Instant::now();
        assert!(fork.try_acquire_for(1, Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(fork.owner(), Some(0));
    }

    #[test]
    fn test_bounded_wait_granted_on_release() {
        let fork = Arc::new(Fork::new(0));
        let fork0 = fork.clone();
        let g = fork.acquire(0);

        let t = thread::spawn(move || {
            let granted = fork0.try_acquire_for(1, Duration::from_secs(5));
            granted.map(|g| g.holder())
        });

        thread::sleep(Duration::from_millis(20));
        drop(g);
        assert_eq!(t.join().unwrap(), Some(1));
        assert!(fork.is_available());
    }

    #[test]
    fn test_exclusive_under_contention() {
        const NUM_THREADS: usize = 4;
        const NUM_LOOP: usize = 2000;

        let fork = Arc::new(Fork::new(0));
        let inside = Arc::new(AtomicUsize::new(0));
        let mut v = Vec::new();

        for i in 0..NUM_THREADS {
            let fork0 = fork.clone();
            let inside0 = inside.clone();
            let t = thread::spawn(move || {
                for _ in 0..NUM_LOOP {
                    let g = fork0.acquire(i);
                    assert_eq!(inside0.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(fork0.owner(), Some(i));
                    inside0.fetch_sub(1, Ordering::SeqCst);
                    drop(g);
                }
            });
            v.push(t);
        }

        for t in v {
            t.join().unwrap();
        }
        assert!(fork.is_available());
    }
}
