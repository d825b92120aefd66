// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::Handler;

/// Data-ready flag bridging a notification handler and a normally scheduled task.
///
/// The handler only calls [`Latch::set`]; draining happens in whoever waits on
/// the latch. Repeated sets before a [`Latch::take`] coalesce into one.
#[derive(Default)]
pub struct Latch {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    /// Creates a cleared latch.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks data ready and wakes waiters.
    pub fn set(&self) {
        *self.ready.lock() = true;
        self.cond.notify_all();
    }

    /// Clears the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        std::mem::take(&mut *self.ready.lock())
    }

    /// Waits up to `timeout` for the flag, then clears it. Returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.lock();
        if !*ready {
            let _ = self.cond.wait_for(&mut ready, timeout);
        }
        std::mem::take(&mut *ready)
    }

    /// Handler that sets this latch; suitable for [`crate::EventChannel::bind_handler`].
    pub fn handler(self: &Arc<Self>) -> Handler {
        let latch = Arc::clone(self);
        Arc::new(move || latch.set())
    }
}
