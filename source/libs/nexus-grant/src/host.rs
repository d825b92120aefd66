// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process grant table emulating the hypervisor for host builds
//!
//! OWNERS: @runtime
//!
//! The table is shared by every domain on the host; each domain talks to it
//! through a [`DomainGrants`] view. Besides enforcing the grant rules it keeps
//! an ordered log of operations and live counters so tests can check call
//! order and leaks.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{DomainId, GrantError, GrantRef, GrantTable, MapHandle, MappedPage, Page, Result};

/// First reference handed out per domain; lower values stay reserved.
const FIRST_REF: u32 = 8;

/// One entry of the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOp {
    /// `owner` granted `gref` to `grantee`.
    Grant { owner: DomainId, grantee: DomainId, gref: GrantRef },
    /// `mapper` mapped `gref` of `owner`.
    Map { mapper: DomainId, owner: DomainId, gref: GrantRef },
    /// `mapper` released its mapping of `gref`.
    Unmap { mapper: DomainId, owner: DomainId, gref: GrantRef },
    /// `owner` revoked `gref`.
    Revoke { owner: DomainId, gref: GrantRef },
    /// A revoke was refused because the page was still mapped.
    RevokeRefused { owner: DomainId, gref: GrantRef },
    /// A revoke was parked until the last unmap.
    RevokeDeferred { owner: DomainId, gref: GrantRef },
    /// A parked revoke completed on unmap.
    DeferredRelease { owner: DomainId, gref: GrantRef },
}

struct Entry {
    grantee: DomainId,
    page: Page,
    mappings: u32,
    revoke_pending: bool,
}

struct Mapping {
    mapper: DomainId,
    owner: DomainId,
    gref: GrantRef,
}

#[derive(Default)]
struct Faults {
    alloc: bool,
    grant: bool,
    map: bool,
}

#[derive(Default)]
struct TableInner {
    entries: BTreeMap<(DomainId, GrantRef), Entry>,
    next_ref: BTreeMap<DomainId, u32>,
    mappings: BTreeMap<MapHandle, Mapping>,
    next_handle: u32,
    log: Vec<GrantOp>,
    faults: Faults,
}

impl TableInner {
    fn grants_of(&self, owner: DomainId) -> usize {
        self.entries.keys().filter(|(dom, _)| *dom == owner).count()
    }
}

/// Grant table shared by all domains of one host.
pub struct HostGrantTable {
    limit: usize,
    inner: Mutex<TableInner>,
}

impl HostGrantTable {
    /// Creates a table allowing `limit` live grants per domain.
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self { limit, inner: Mutex::new(TableInner::default()) })
    }

    /// Returns the view through which `domain` uses the table.
    pub fn for_domain(self: &Arc<Self>, domain: DomainId) -> DomainGrants {
        DomainGrants { table: Arc::clone(self), domain }
    }

    /// Ordered log of every grant operation so far.
    pub fn operations(&self) -> Vec<GrantOp> {
        self.inner.lock().log.clone()
    }

    /// Number of grants not yet revoked, across all domains.
    pub fn live_grants(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Number of mappings not yet released, across all domains.
    pub fn live_mappings(&self) -> usize {
        self.inner.lock().mappings.len()
    }

    /// Page behind a live grant of `owner`.
    pub fn granted_page(&self, owner: DomainId, gref: GrantRef) -> Option<Page> {
        self.inner.lock().entries.get(&(owner, gref)).map(|entry| entry.page.clone())
    }

    /// Page `mapper` currently maps for grant `gref` of `owner`.
    pub fn mapped_page(&self, mapper: DomainId, owner: DomainId, gref: GrantRef) -> Option<Page> {
        let inner = self.inner.lock();
        inner
            .mappings
            .values()
            .find(|m| m.mapper == mapper && m.owner == owner && m.gref == gref)
            .and_then(|_| inner.entries.get(&(owner, gref)))
            .map(|entry| entry.page.clone())
    }

    /// Makes the next page allocation fail with [`GrantError::NoMemory`].
    pub fn fail_next_alloc(&self) {
        self.inner.lock().faults.alloc = true;
    }

    /// Makes the next grant fail as if the table were exhausted.
    pub fn fail_next_grant(&self) {
        self.inner.lock().faults.grant = true;
    }

    /// Makes the next map attempt fail with [`GrantError::NotFound`].
    pub fn fail_next_map(&self) {
        self.inner.lock().faults.map = true;
    }

    fn alloc_page(&self, _domain: DomainId) -> Result<Page> {
        let mut inner = self.inner.lock();
        if std::mem::take(&mut inner.faults.alloc) {
            return Err(GrantError::NoMemory);
        }
        Ok(Page::zeroed())
    }

    fn grant(&self, owner: DomainId, grantee: DomainId, page: &Page) -> Result<GrantRef> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if std::mem::take(&mut inner.faults.grant) || inner.grants_of(owner) >= self.limit {
            return Err(GrantError::Exhausted(owner));
        }
        let next = inner.next_ref.entry(owner).or_insert(FIRST_REF);
        let gref = GrantRef(*next);
        *next += 1;
        inner.entries.insert(
            (owner, gref),
            Entry { grantee, page: page.clone(), mappings: 0, revoke_pending: false },
        );
        inner.log.push(GrantOp::Grant { owner, grantee, gref });
        debug!("{owner} granted {gref} to {grantee}");
        Ok(gref)
    }

    fn map(&self, mapper: DomainId, owner: DomainId, gref: GrantRef) -> Result<MappedPage> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if std::mem::take(&mut inner.faults.map) {
            return Err(GrantError::NotFound { owner, gref });
        }
        let entry = inner
            .entries
            .get_mut(&(owner, gref))
            .filter(|entry| !entry.revoke_pending)
            .ok_or(GrantError::NotFound { owner, gref })?;
        if entry.grantee != mapper {
            return Err(GrantError::PermissionDenied { caller: mapper, owner, gref });
        }
        entry.mappings += 1;
        let page = entry.page.clone();
        inner.next_handle += 1;
        let handle = MapHandle(inner.next_handle);
        inner.mappings.insert(handle, Mapping { mapper, owner, gref });
        inner.log.push(GrantOp::Map { mapper, owner, gref });
        debug!("{mapper} mapped grant {gref} of {owner}");
        Ok(MappedPage { owner, gref, handle, page })
    }

    fn unmap(&self, mapper: DomainId, mapped: MappedPage) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.mappings.get(&mapped.handle) {
            Some(mapping) if mapping.mapper == mapper => {}
            _ => return Err(GrantError::UnknownMapping),
        }
        let Some(Mapping { owner, gref, .. }) = inner.mappings.remove(&mapped.handle) else {
            return Err(GrantError::UnknownMapping);
        };
        inner.log.push(GrantOp::Unmap { mapper, owner, gref });
        let release = match inner.entries.get_mut(&(owner, gref)) {
            Some(entry) => {
                entry.mappings -= 1;
                entry.mappings == 0 && entry.revoke_pending
            }
            None => false,
        };
        if release {
            inner.entries.remove(&(owner, gref));
            inner.log.push(GrantOp::DeferredRelease { owner, gref });
            debug!("deferred revoke of {gref} ({owner}) completed");
        }
        Ok(())
    }

    fn revoke(&self, owner: DomainId, gref: GrantRef, defer: bool) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let entry = inner
            .entries
            .get_mut(&(owner, gref))
            .ok_or(GrantError::NotFound { owner, gref })?;
        if entry.mappings > 0 {
            let mappings = entry.mappings;
            if defer {
                entry.revoke_pending = true;
                inner.log.push(GrantOp::RevokeDeferred { owner, gref });
                debug!("revoke of {gref} ({owner}) deferred until unmap");
                return Ok(());
            }
            inner.log.push(GrantOp::RevokeRefused { owner, gref });
            warn!("refusing to revoke {gref} ({owner}): still mapped");
            return Err(GrantError::StillMapped { gref, mappings });
        }
        inner.entries.remove(&(owner, gref));
        inner.log.push(GrantOp::Revoke { owner, gref });
        debug!("{owner} revoked {gref}");
        Ok(())
    }
}

/// View of a [`HostGrantTable`] bound to one domain.
#[derive(Clone)]
pub struct DomainGrants {
    table: Arc<HostGrantTable>,
    domain: DomainId,
}

impl GrantTable for DomainGrants {
    fn domain(&self) -> DomainId {
        self.domain
    }

    fn alloc_page(&self) -> Result<Page> {
        self.table.alloc_page(self.domain)
    }

    fn grant_page(&self, peer: DomainId, page: &Page) -> Result<GrantRef> {
        self.table.grant(self.domain, peer, page)
    }

    fn map_grant(&self, owner: DomainId, gref: GrantRef) -> Result<MappedPage> {
        self.table.map(self.domain, owner, gref)
    }

    fn unmap(&self, mapped: MappedPage) -> Result<()> {
        self.table.unmap(self.domain, mapped)
    }

    fn revoke(&self, gref: GrantRef) -> Result<()> {
        self.table.revoke(self.domain, gref, false)
    }

    fn defer_revoke(&self, gref: GrantRef) -> Result<()> {
        self.table.revoke(self.domain, gref, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRONT: DomainId = DomainId(1);
    const BACK: DomainId = DomainId(0);

    fn pair() -> (Arc<HostGrantTable>, DomainGrants, DomainGrants) {
        let table = HostGrantTable::new(4);
        let front = table.for_domain(FRONT);
        let back = table.for_domain(BACK);
        (table, front, back)
    }

    #[test]
    fn mapped_page_aliases_granted_page() {
        let (_table, front, back) = pair();
        let page = front.alloc_page().unwrap();
        let gref = front.grant_page(BACK, &page).unwrap();
        assert!(gref.value() >= FIRST_REF);
        let mapped = back.map_grant(FRONT, gref).unwrap();
        mapped.page().write_bytes(0, b"abcd").unwrap();
        assert_eq!(&page.snapshot()[..4], b"abcd");
        assert!(mapped.page().same_frame(&page));
    }

    #[test]
    fn only_grantee_may_map() {
        let (table, front, _back) = pair();
        let page = front.alloc_page().unwrap();
        let gref = front.grant_page(BACK, &page).unwrap();
        let intruder = table.for_domain(DomainId(7));
        let err = intruder.map_grant(FRONT, gref).unwrap_err();
        assert!(matches!(err, GrantError::PermissionDenied { .. }));
    }

    #[test]
    fn revoke_refused_while_mapped() {
        let (table, front, back) = pair();
        let page = front.alloc_page().unwrap();
        let gref = front.grant_page(BACK, &page).unwrap();
        let mapped = back.map_grant(FRONT, gref).unwrap();

        let err = front.revoke(gref).unwrap_err();
        assert_eq!(err, GrantError::StillMapped { gref, mappings: 1 });
        assert_eq!(table.live_grants(), 1);

        back.unmap(mapped).unwrap();
        front.revoke(gref).unwrap();
        assert_eq!(table.live_grants(), 0);
        assert_eq!(
            table.operations(),
            vec![
                GrantOp::Grant { owner: FRONT, grantee: BACK, gref },
                GrantOp::Map { mapper: BACK, owner: FRONT, gref },
                GrantOp::RevokeRefused { owner: FRONT, gref },
                GrantOp::Unmap { mapper: BACK, owner: FRONT, gref },
                GrantOp::Revoke { owner: FRONT, gref },
            ]
        );
    }

    #[test]
    fn deferred_revoke_completes_on_last_unmap() {
        let (table, front, back) = pair();
        let page = front.alloc_page().unwrap();
        let gref = front.grant_page(BACK, &page).unwrap();
        let mapped = back.map_grant(FRONT, gref).unwrap();

        front.defer_revoke(gref).unwrap();
        assert_eq!(table.live_grants(), 1);
        assert!(back.map_grant(FRONT, gref).is_err(), "pending revoke blocks new mappings");

        back.unmap(mapped).unwrap();
        assert_eq!(table.live_grants(), 0);
        assert_eq!(table.live_mappings(), 0);
        assert!(table.operations().contains(&GrantOp::DeferredRelease { owner: FRONT, gref }));
    }

    #[test]
    fn only_owner_may_revoke() {
        let (_table, front, back) = pair();
        let page = front.alloc_page().unwrap();
        let gref = front.grant_page(BACK, &page).unwrap();
        assert_eq!(back.revoke(gref), Err(GrantError::NotFound { owner: BACK, gref }));
        assert!(front.revoke(gref).is_ok());
    }

    #[test]
    fn table_exhaustion_and_fault_injection() {
        let (table, front, _back) = pair();
        let page = front.alloc_page().unwrap();
        for _ in 0..4 {
            front.grant_page(BACK, &page).unwrap();
        }
        assert_eq!(front.grant_page(BACK, &page), Err(GrantError::Exhausted(FRONT)));

        table.fail_next_alloc();
        assert_eq!(front.alloc_page().unwrap_err(), GrantError::NoMemory);
        assert!(front.alloc_page().is_ok());
    }

    #[test]
    fn references_are_not_reused() {
        let (_table, front, _back) = pair();
        let page = front.alloc_page().unwrap();
        let first = front.grant_page(BACK, &page).unwrap();
        front.revoke(first).unwrap();
        let second = front.grant_page(BACK, &page).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn unmap_by_other_domain_rejected() {
        let (table, front, back) = pair();
        let page = front.alloc_page().unwrap();
        let gref = front.grant_page(BACK, &page).unwrap();
        let mapped = back.map_grant(FRONT, gref).unwrap();
        let other = table.for_domain(DomainId(9));
        assert_eq!(other.unmap(mapped), Err(GrantError::UnknownMapping));
        assert_eq!(table.live_mappings(), 1);
    }
}
