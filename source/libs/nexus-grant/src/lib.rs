// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Grant/map resource manager for pages shared between domains
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (page accessors, host grant table ordering rules)
//!
//! PUBLIC API:
//!   - Page: shared frame handle with byte-offset accessors
//!   - GrantTable trait: domain-scoped grant / map / unmap / revoke
//!   - HostGrantTable: in-process hypervisor table used by host builds and tests
//!
//! SECURITY INVARIANTS:
//!   - Only the grantee named at grant time may map a reference
//!   - A grant is never revoked while a mapping of it exists
//!   - Grant references are never reused within one table

#![forbid(unsafe_code)]
#![deny(clippy::all)]

use core::fmt;

use thiserror::Error;

mod host;
mod page;

pub use host::{DomainGrants, GrantOp, HostGrantTable};
pub use page::{Page, PageRangeError, PAGE_SIZE};

/// Identifier of an isolated execution domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u16);

impl DomainId {
    /// The privileged control domain.
    pub const CONTROL: DomainId = DomainId(0);

    /// Returns the raw numeric identifier.
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dom{}", self.0)
    }
}

/// Opaque reference naming a granted page. Published to the peer as an unsigned integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GrantRef(u32);

impl GrantRef {
    /// Reserved value meaning "no grant".
    pub const INVALID: GrantRef = GrantRef(0);

    /// Wraps a raw reference read from the peer; `0` is rejected.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Returns the raw reference value.
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for GrantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of one established mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapHandle(u32);

/// A peer page mapped into the local domain. Consumed by [`GrantTable::unmap`].
#[derive(Debug)]
pub struct MappedPage {
    owner: DomainId,
    gref: GrantRef,
    handle: MapHandle,
    page: Page,
}

impl MappedPage {
    /// Domain that granted the page.
    pub fn owner(&self) -> DomainId {
        self.owner
    }

    /// Reference the mapping was created from.
    pub fn grant_ref(&self) -> GrantRef {
        self.gref
    }

    /// Mapping handle.
    pub fn handle(&self) -> MapHandle {
        self.handle
    }

    /// The mapped frame.
    pub fn page(&self) -> &Page {
        &self.page
    }
}

/// Result alias for grant operations.
pub type Result<T> = core::result::Result<T, GrantError>;

/// Errors produced by the grant/map resource manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GrantError {
    /// No free page could be allocated.
    #[error("out of memory allocating a shared page")]
    NoMemory,
    /// The domain has no free grant entries left.
    #[error("grant table of {0} exhausted")]
    Exhausted(DomainId),
    /// The reference does not name a live grant.
    #[error("grant {gref} of {owner} not found")]
    NotFound {
        /// Granting domain.
        owner: DomainId,
        /// Reference that was looked up.
        gref: GrantRef,
    },
    /// The caller is not the grantee of the reference.
    #[error("{caller} may not map grant {gref} of {owner}")]
    PermissionDenied {
        /// Domain attempting the operation.
        caller: DomainId,
        /// Granting domain.
        owner: DomainId,
        /// Reference involved.
        gref: GrantRef,
    },
    /// The peer still holds a mapping of the page.
    #[error("grant {gref} is still mapped by the peer ({mappings} mapping(s))")]
    StillMapped {
        /// Reference involved.
        gref: GrantRef,
        /// Outstanding mappings.
        mappings: u32,
    },
    /// The mapping handle is unknown to this domain.
    #[error("unknown mapping handle")]
    UnknownMapping,
}

/// Domain-scoped view of the grant/map primitive.
///
/// The granting side calls [`alloc_page`](Self::alloc_page) and
/// [`grant_page`](Self::grant_page), publishes the reference, and later
/// revokes it; the peer maps the reference and unmaps it during teardown.
pub trait GrantTable: Send + Sync {
    /// Domain this view acts as.
    fn domain(&self) -> DomainId;

    /// Allocates a zeroed page owned by this domain.
    fn alloc_page(&self) -> Result<Page>;

    /// Grants `peer` read/write access to `page`.
    fn grant_page(&self, peer: DomainId, page: &Page) -> Result<GrantRef>;

    /// Maps the page `owner` granted under `gref`.
    fn map_grant(&self, owner: DomainId, gref: GrantRef) -> Result<MappedPage>;

    /// Releases a mapping created by [`map_grant`](Self::map_grant).
    fn unmap(&self, mapped: MappedPage) -> Result<()>;

    /// Ends foreign access to a grant. Fails with [`GrantError::StillMapped`]
    /// while the peer holds a mapping; the grant stays intact in that case.
    fn revoke(&self, gref: GrantRef) -> Result<()>;

    /// Revokes now if unmapped, otherwise as soon as the last mapping is released.
    fn defer_revoke(&self, gref: GrantRef) -> Result<()>;
}
