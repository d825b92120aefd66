// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Drain task for the consuming side of a ring.
//!
//! The notification handler only sets the endpoint's latch. This worker is
//! the normally scheduled task that waits on it, drains the ring, logs each
//! record and forwards it to a channel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, info};
use nexus_evtchn::Latch;

use crate::endpoint::Endpoint;
use crate::record::Message;

const IDLE_WAIT: Duration = Duration::from_millis(50);

/// Thread draining one endpoint's ring. Stops when dropped.
pub struct DrainWorker {
    stop: Arc<AtomicBool>,
    latch: Arc<Latch>,
    join: Option<thread::JoinHandle<()>>,
}

impl DrainWorker {
    /// Starts draining `endpoint` into `sink`.
    pub fn spawn(endpoint: &Arc<Endpoint>, sink: Sender<Message>) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let latch = endpoint.latch();
        let weak: Weak<Endpoint> = Arc::downgrade(endpoint);
        let join = thread::Builder::new()
            .name(format!("drain-{}", endpoint.identity().devid))
            .spawn({
                let stop = Arc::clone(&stop);
                let latch = Arc::clone(&latch);
                move || drain_loop(weak, latch, stop, sink)
            })?;
        Ok(Self { stop, latch, join: Some(join) })
    }

    /// Stops the worker and waits for it. Records still on the ring stay there.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.latch.set();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for DrainWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn drain_loop(endpoint: Weak<Endpoint>, latch: Arc<Latch>, stop: Arc<AtomicBool>, sink: Sender<Message>) {
    while !stop.load(Ordering::Acquire) {
        if !latch.wait_timeout(IDLE_WAIT) {
            continue;
        }
        let Some(endpoint) = endpoint.upgrade() else {
            break;
        };
        for msg in endpoint.drain() {
            info!("{}: received {:?}", endpoint.identity(), msg.text());
            if sink.send(msg).is_err() {
                debug!("{}: drain sink closed", endpoint.identity());
                return;
            }
        }
    }
}
