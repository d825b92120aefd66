// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-memory directory store for host builds and tests
//!
//! OWNERS: @runtime
//!
//! Watch events are queued on per-watch channels rather than delivered by
//! callback, so a writer never re-enters the code that consumes its own
//! notifications.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};

use log::trace;
use parking_lot::Mutex;

use crate::{Directory, DirectoryError, DomainId, Result, Transaction, TxnOp, Watch, WatchEvent};

struct WatchEntry {
    token: u64,
    path: String,
    tx: Sender<WatchEvent>,
}

#[derive(Default)]
struct StoreInner {
    nodes: BTreeMap<String, String>,
    owners: BTreeMap<String, DomainId>,
    watches: Vec<WatchEntry>,
    next_token: u64,
}

fn validate(path: &str) -> Result<()> {
    if path.is_empty() || path.split('/').any(|segment| segment.is_empty()) {
        return Err(DirectoryError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn is_within(path: &str, prefix: &str) -> bool {
    path == prefix || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

impl StoreInner {
    fn owner_of(&self, path: &str) -> Option<DomainId> {
        self.owners
            .iter()
            .filter(|(prefix, _)| is_within(path, prefix))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, owner)| *owner)
    }

    fn check_write(&self, domain: DomainId, path: &str) -> Result<()> {
        validate(path)?;
        if domain == DomainId::CONTROL || self.owner_of(path) == Some(domain) {
            Ok(())
        } else {
            Err(DirectoryError::PermissionDenied { domain, path: path.to_string() })
        }
    }

    fn apply(&mut self, op: TxnOp, events: &mut Vec<WatchEvent>) {
        match op {
            TxnOp::Write(path, value) => {
                self.nodes.insert(path.clone(), value.clone());
                events.push(WatchEvent { path, value: Some(value) });
            }
            TxnOp::Remove(path) => {
                let doomed: Vec<String> =
                    self.nodes.keys().filter(|node| is_within(node, &path)).cloned().collect();
                for node in doomed {
                    self.nodes.remove(&node);
                    events.push(WatchEvent { path: node, value: None });
                }
            }
        }
    }

    fn fire(&mut self, events: Vec<WatchEvent>) {
        for event in events {
            self.watches.retain(|watch| {
                if !is_within(&event.path, &watch.path) {
                    return true;
                }
                trace!("watch {} fired for {}", watch.path, event.path);
                watch.tx.send(event.clone()).is_ok()
            });
        }
    }
}

/// Directory store shared by all domains of one host.
#[derive(Default)]
pub struct HostStore {
    inner: Mutex<StoreInner>,
}

impl HostStore {
    /// Creates an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the client through which `domain` uses the store.
    pub fn for_domain(self: &Arc<Self>, domain: DomainId) -> DomainDirectory {
        DomainDirectory { store: Arc::clone(self), domain }
    }

    /// Gives `domain` write access to `prefix` and everything below it.
    pub fn set_owner(&self, prefix: &str, domain: DomainId) -> Result<()> {
        validate(prefix)?;
        self.inner.lock().owners.insert(prefix.to_string(), domain);
        Ok(())
    }

    /// Number of registered watches.
    pub fn watch_count(&self) -> usize {
        self.inner.lock().watches.len()
    }

    /// Copy of every node below `prefix`.
    pub fn dump(&self, prefix: &str) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .nodes
            .iter()
            .filter(|(path, _)| is_within(path, prefix))
            .map(|(path, value)| (path.clone(), value.clone()))
            .collect()
    }

    fn commit(&self, domain: DomainId, ops: Vec<TxnOp>) -> Result<()> {
        let mut inner = self.inner.lock();
        for op in &ops {
            let (TxnOp::Write(path, _) | TxnOp::Remove(path)) = op;
            inner.check_write(domain, path)?;
        }
        let mut events = Vec::new();
        for op in ops {
            inner.apply(op, &mut events);
        }
        inner.fire(events);
        Ok(())
    }

    fn watch(self: &Arc<Self>, path: &str) -> Result<Watch> {
        validate(path)?;
        let (tx, rx) = mpsc::channel();
        let mut inner = self.inner.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        let current = inner.nodes.get(path).cloned();
        let _ = tx.send(WatchEvent { path: path.to_string(), value: current });
        inner.watches.push(WatchEntry { token, path: path.to_string(), tx });
        let store: Weak<HostStore> = Arc::downgrade(self);
        Ok(Watch::new(
            path,
            rx,
            Box::new(move || {
                if let Some(store) = store.upgrade() {
                    store.inner.lock().watches.retain(|watch| watch.token != token);
                }
            }),
        ))
    }
}

/// View of a [`HostStore`] bound to one domain.
#[derive(Clone)]
pub struct DomainDirectory {
    store: Arc<HostStore>,
    domain: DomainId,
}

impl Directory for DomainDirectory {
    fn domain(&self) -> DomainId {
        self.domain
    }

    fn read(&self, path: &str) -> Result<Option<String>> {
        validate(path)?;
        Ok(self.store.inner.lock().nodes.get(path).cloned())
    }

    fn write(&self, path: &str, value: &str) -> Result<()> {
        self.store.commit(self.domain, vec![TxnOp::Write(path.to_string(), value.to_string())])
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.store.commit(self.domain, vec![TxnOp::Remove(path.to_string())])
    }

    fn commit(&self, txn: Transaction) -> Result<()> {
        self.store.commit(self.domain, txn.ops)
    }

    fn watch(&self, path: &str) -> Result<Watch> {
        self.store.watch(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_parsed;

    const FRONT: DomainId = DomainId(1);
    const BACK: DomainId = DomainId(2);

    fn store() -> Arc<HostStore> {
        let store = HostStore::new();
        store.set_owner("device/vif/0", FRONT).unwrap();
        store.set_owner("backend/vif/1/0", BACK).unwrap();
        store
    }

    #[test]
    fn owners_write_and_everyone_reads() {
        let store = store();
        let front = store.for_domain(FRONT);
        let back = store.for_domain(BACK);
        front.write("device/vif/0/state", "1").unwrap();
        assert_eq!(back.read("device/vif/0/state").unwrap().as_deref(), Some("1"));
        assert!(matches!(
            back.write("device/vif/0/state", "6"),
            Err(DirectoryError::PermissionDenied { .. })
        ));
        assert!(front.write("device/vif/00/state", "1").is_err(), "prefix match respects segments");
        store.for_domain(DomainId::CONTROL).write("device/vif/0/online", "1").unwrap();
    }

    #[test]
    fn transaction_is_all_or_nothing() {
        let store = store();
        let front = store.for_domain(FRONT);
        let mut txn = Transaction::new();
        txn.write("device/vif/0/ring-ref", 8).write("backend/vif/1/0/state", 4);
        assert!(front.commit(txn).is_err());
        assert_eq!(front.read("device/vif/0/ring-ref").unwrap(), None);

        let mut txn = Transaction::new();
        txn.write("device/vif/0/ring-ref", 8).write("device/vif/0/event-channel", 3);
        front.commit(txn).unwrap();
        assert_eq!(read_parsed::<u32>(&front, "device/vif/0/event-channel").unwrap(), 3);
    }

    #[test]
    fn watch_delivers_initial_value_then_changes_in_order() {
        let store = store();
        let front = store.for_domain(FRONT);
        let back = store.for_domain(BACK);
        let watch = back.watch("device/vif/0/state").unwrap();
        for state in ["1", "4", "4", "5"] {
            front.write("device/vif/0/state", state).unwrap();
        }
        front.write("device/vif/0/other", "x").unwrap();
        let values: Vec<Option<String>> = watch.drain().into_iter().map(|event| event.value).collect();
        assert_eq!(
            values,
            vec![None, Some("1".into()), Some("4".into()), Some("4".into()), Some("5".into())]
        );
    }

    #[test]
    fn remove_notifies_and_drop_unregisters() {
        let store = store();
        let front = store.for_domain(FRONT);
        front.write("device/vif/0/state", "1").unwrap();
        let watch = front.watch("device/vif/0").unwrap();
        front.remove("device/vif/0").unwrap();
        let events = watch.drain();
        assert_eq!(events.last().map(|event| event.value.clone()), Some(None));
        assert_eq!(store.watch_count(), 1);
        drop(watch);
        assert_eq!(store.watch_count(), 0);
    }

    #[test]
    fn read_parsed_reports_missing_and_malformed() {
        let store = store();
        let front = store.for_domain(FRONT);
        assert_eq!(
            read_parsed::<u32>(&front, "device/vif/0/ring-ref"),
            Err(DirectoryError::Missing("device/vif/0/ring-ref".into()))
        );
        front.write("device/vif/0/ring-ref", "eight").unwrap();
        assert!(matches!(
            read_parsed::<u32>(&front, "device/vif/0/ring-ref"),
            Err(DirectoryError::Malformed { .. })
        ));
        assert!(front.read("device//state").is_err());
    }
}
