// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! This module provides a way to
//!   * spawn worker threads that can be halted
//!   * signal halt to all of them at once
//!   * wait until every worker has finished, with a timeout
//!
//! Workers are expected to poll: they check the halt condition between iterations and sleep
//! through [`Receiver::sleep`], which returns early once halt has been signalled.

use crate::error::{self, ErrorKind};

use failure::ResultExt;

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct State {
    halted: bool,
    running: usize,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Decrements the number of running workers even if the worker panics
struct RunningGuard(Arc<Inner>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.0.state.lock() {
            state.running -= 1;
        }
        self.0.cond.notify_all();
    }
}

/// Halt side owned by whoever controls worker lifetime
pub struct Sender {
    inner: Arc<Inner>,
}

/// Worker side, cloned into each worker
#[derive(Clone)]
pub struct Receiver {
    inner: Arc<Inner>,
}

pub fn make_pair() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            halted: false,
            running: 0,
        }),
        cond: Condvar::new(),
        handles: Mutex::new(Vec::new()),
    });
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

impl Receiver {
    pub fn is_halted(&self) -> bool {
        self.inner.state.lock().expect("halt lock").halted
    }

    /// Sleep for `duration` or until halt, returns true when halted
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut state = self.inner.state.lock().expect("halt lock");
        while !state.halted {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .expect("halt lock")
                .0;
        }
        state.halted
    }

    /// Spawn named worker thread running `f` with its own receiver
    pub fn spawn<F>(&self, name: String, f: F) -> error::Result<()>
    where
        F: FnOnce(Receiver) + Send + 'static,
    {
        self.inner.state.lock().expect("halt lock").running += 1;
        let guard = RunningGuard(self.inner.clone());
        let receiver = self.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = guard;
                f(receiver);
            })
            .with_context(|_| format!("cannot spawn worker {}", name))?;
        self.inner.handles.lock().expect("halt lock").push(handle);
        Ok(())
    }
}

impl Sender {
    /// Signal halt and wait until all workers finish
    pub fn send_halt(&self, timeout: Duration) -> error::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().expect("halt lock");
        state.halted = true;
        self.inner.cond.notify_all();

        while state.running > 0 {
            let now = Instant::now();
            if now >= deadline {
                Err(ErrorKind::Halt(format!(
                    "{} workers still running after {:?}",
                    state.running, timeout
                )))?
            }
            state = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .expect("halt lock")
                .0;
        }
        drop(state);

        let handles: Vec<_> = self.inner.handles.lock().expect("halt lock").drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                Err(ErrorKind::Halt("worker panicked".to_string()))?
            }
        }
        Ok(())
    }
}
