// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Hypervisor transport primitives the backend relies on.
//!
//! Grant table mappings, event channels, shared rings and XenStore are
//! provided by the host; the backend only sees them through these traits.

pub mod mock;

use std::sync::Arc;

use vm_memory::VolatileSlice;

use crate::{
    sndif::{XenSndEvt, XenSndReq, XenSndResp},
    Error, Result,
};

pub type DomId = u16;
pub type GrantRef = u32;
pub type EventPort = u32;

/// A live mapping of granted guest pages. Dropping it unmaps the pages.
pub trait GrantMapping: Send {
    fn as_volatile_slice(&self) -> VolatileSlice<'_>;
}

/// Maps pages granted by one frontend domain.
pub trait GrantMapper: Send + Sync {
    /// Map a single page read-only.
    fn map_page(&self, gref: GrantRef) -> Result<Box<dyn GrantMapping>>;

    /// Map `grefs` read/write as one contiguous range, in order.
    fn map_grants(&self, grefs: &[GrantRef]) -> Result<Box<dyn GrantMapping>>;
}

/// Read access to the XenStore.
pub trait XenStore: Send + Sync {
    fn exists(&self, path: &str) -> bool;

    fn read_string(&self, path: &str) -> Result<String>;

    fn read_u32(&self, path: &str) -> Result<u32> {
        let val = self.read_string(path)?;
        val.trim()
            .parse()
            .map_err(|_| Error::XenStoreEntryInvalid(path.to_string(), val))
    }
}

/// Backend end of a request ring.
pub trait RequestRing: Send {
    /// Block until the frontend posts a request. `None` once the ring is
    /// torn down.
    fn next_request(&mut self) -> Option<XenSndReq>;

    fn send_response(&mut self, resp: &XenSndResp) -> Result<()>;
}

/// Backend end of an event ring.
pub trait EventSink: Send + Sync {
    fn send_event(&self, evt: &XenSndEvt) -> Result<()>;
}

/// Everything needed to serve the frontends of one host.
pub trait XenBus: Send + Sync {
    fn store(&self) -> &dyn XenStore;

    fn grant_mapper(&self, dom: DomId) -> Result<Arc<dyn GrantMapper>>;

    fn request_ring(
        &self,
        dom: DomId,
        port: EventPort,
        ring_ref: GrantRef,
    ) -> Result<Box<dyn RequestRing>>;

    fn event_sink(
        &self,
        dom: DomId,
        port: EventPort,
        ring_ref: GrantRef,
    ) -> Result<Box<dyn EventSink>>;
}
