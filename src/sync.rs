// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Synchronization primitives shared by the buffer pools.
//!
//! [`Mutex`] and [`Condvar`] wrap their standard library counterparts, but panic instead of
//! returning an error when poisoned: a panic while one of the pool locks is held means the pool
//! bookkeeping can no longer be trusted, and there is nothing sensible a caller could do with the
//! error.
//!
//! [`Abortable`] is the state every blocking pool keeps under its lock so that waiters can be
//! cancelled. Aborting bumps an epoch and moves the pool out of [`RunState::Running`]; waiters
//! re-check the epoch under the same lock, so an abort can never be missed, even if it is cleared
//! again before the waiter gets scheduled.

use std::fmt;
use std::fmt::Debug;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Condvar as StdCondvar;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use thiserror::Error;

static MUTEX_POISONED: &str = "mutex is poisoned";
static CONDVAR_POISONED: &str = "condvar is poisoned";

/// A mutual exclusion primitive that panics if poisoned.
#[derive(Default)]
pub struct Mutex<T: ?Sized> {
    std: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Mutex<T> {
        Mutex {
            std: StdMutex::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.std.into_inner().expect(MUTEX_POISONED)
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, blocking the current thread until it is able to do so.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.std.lock().expect(MUTEX_POISONED)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.std.get_mut().expect(MUTEX_POISONED)
    }
}

impl<T: ?Sized + Debug> Debug for Mutex<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, formatter)
    }
}

/// A condition variable that panics if poisoned.
#[derive(Default)]
pub struct Condvar {
    std: StdCondvar,
}

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar {
            std: StdCondvar::new(),
        }
    }

    /// Blocks the current thread until this condition variable receives a notification and the
    /// provided condition is false.
    pub fn wait_while<'a, T, F>(&self, guard: MutexGuard<'a, T>, condition: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        self.std
            .wait_while(guard, condition)
            .expect(CONDVAR_POISONED)
    }

    pub fn notify_one(&self) {
        self.std.notify_one();
    }

    pub fn notify_all(&self) {
        self.std.notify_all();
    }
}

impl Debug for Condvar {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, formatter)
    }
}

/// Cancellation status of a pool.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum RunState {
    /// Normal operation, blocking calls wait for their condition.
    #[default]
    Running,
    /// An abort was requested while some threads were blocked, and not all of them have returned
    /// yet.
    Aborting,
    /// An abort was requested and no thread is blocked anymore. Stays until cleared.
    Aborted,
}

/// Returned by blocking operations interrupted by an abort, and by any operation attempted on an
/// aborted pool.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("operation aborted")]
pub struct Aborted;

/// Pool state `T` together with its cancellation status. Meant to live inside a [`Mutex`].
#[derive(Debug, Default)]
pub struct Abortable<T> {
    data: T,
    state: RunState,
    epoch: u64,
    waiters: usize,
}

impl<T> Abortable<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            state: Default::default(),
            epoch: 0,
            waiters: 0,
        }
    }

    pub fn run_state(&self) -> RunState {
        self.state
    }

    pub fn is_aborted(&self) -> bool {
        self.state != RunState::Running
    }

    /// Fails with [`Aborted`] if the pool is not running.
    pub fn check_running(&self) -> Result<(), Aborted> {
        match self.state {
            RunState::Running => Ok(()),
            _ => Err(Aborted),
        }
    }

    /// Number of threads currently blocked on this state.
    pub fn waiters(&self) -> usize {
        self.waiters
    }

    /// Requests an abort. The caller must broadcast every condvar waiting on this state before
    /// releasing the lock.
    pub fn abort(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.state = if self.waiters > 0 {
            RunState::Aborting
        } else {
            RunState::Aborted
        };
    }

    /// Resumes normal operation. Threads that were blocked when the abort happened still return
    /// [`Aborted`].
    pub fn clear_abort(&mut self) {
        self.state = RunState::Running;
    }
}

impl<T> Deref for Abortable<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for Abortable<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// Blocks on `condvar` while `condition` holds for the pool data.
///
/// Returns [`Aborted`] right away if the pool is not running, or as soon as an abort is requested
/// while waiting.
pub fn wait_while<'a, T, F>(
    condvar: &Condvar,
    mut guard: MutexGuard<'a, Abortable<T>>,
    mut condition: F,
) -> Result<MutexGuard<'a, Abortable<T>>, Aborted>
where
    F: FnMut(&T) -> bool,
{
    guard.check_running()?;

    let epoch = guard.epoch;
    guard.waiters += 1;
    let mut guard = condvar.wait_while(guard, |s| s.epoch == epoch && condition(&s.data));
    guard.waiters -= 1;

    if guard.epoch != epoch {
        if guard.waiters == 0 && guard.state == RunState::Aborting {
            guard.state = RunState::Aborted;
        }
        return Err(Aborted);
    }

    Ok(guard)
}
