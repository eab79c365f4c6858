use crate::prelude::*;

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard, Notify};

/// Everything that needs exclusive access while an exchange is in flight.
#[derive(Default)]
pub struct Link {
    pub session: Option<Session>,
    // consecutive failed reads on the current session
    pub failures: u32,
}

/// Serialises every exchange on one inverter. Writers register themselves
/// before waiting so a poll cycle that hasn't started yet steps aside.
#[derive(Default)]
pub struct Gate {
    link: Mutex<Link>,
    pending_writes: AtomicUsize,
    writes_done: Notify,
}

pub struct WriteLock<'a> {
    link: MutexGuard<'a, Link>,
    _pending: PendingWrite<'a>,
}

impl Deref for WriteLock<'_> {
    type Target = Link;

    fn deref(&self) -> &Link {
        &self.link
    }
}

impl DerefMut for WriteLock<'_> {
    fn deref_mut(&mut self) -> &mut Link {
        &mut self.link
    }
}

struct PendingWrite<'a>(&'a Gate);

impl<'a> PendingWrite<'a> {
    fn new(gate: &'a Gate) -> Self {
        gate.pending_writes.fetch_add(1, Ordering::SeqCst);
        Self(gate)
    }
}

impl Drop for PendingWrite<'_> {
    fn drop(&mut self) {
        if self.0.pending_writes.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.writes_done.notify_waiters();
        }
    }
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_writes(&self) -> usize {
        self.pending_writes.load(Ordering::SeqCst)
    }

    pub async fn lock_for_write(&self) -> WriteLock<'_> {
        // registered before queueing on the mutex, dropped after releasing it
        let pending = PendingWrite::new(self);
        let link = self.link.lock().await;

        WriteLock {
            link,
            _pending: pending,
        }
    }

    /// Waits for queued writes to drain before taking the lock. A write
    /// that arrives after this returns waits for the whole cycle.
    pub async fn lock_for_poll(&self) -> MutexGuard<'_, Link> {
        loop {
            let notified = self.writes_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_writes() == 0 {
                break;
            }

            notified.await;
        }

        self.link.lock().await
    }
}
