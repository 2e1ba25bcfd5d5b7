// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! In-process implementation of the transport primitives.
//!
//! Guest memory is an anonymous mapping handed out page by page; grant
//! reference `n` names page `n - 1`. Ring references and event channel
//! ports are plain identifiers. The frontend halves of the rings are kept on
//! the bus so tests, or the binary, can drive the backend.

use std::{
    collections::{BTreeMap, HashMap},
    io::{Error as IoError, ErrorKind},
    mem::size_of,
    sync::{
        atomic::{fence, AtomicU32, AtomicUsize, Ordering},
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, RwLock,
    },
    thread,
    time::{Duration, Instant},
};

use vm_memory::{mmap::MmapRegion, Bytes, Le32, VolatileMemory, VolatileSlice};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

use super::{
    DomId, EventPort, EventSink, GrantMapper, GrantMapping, GrantRef, RequestRing, XenBus,
    XenStore,
};
use crate::{
    config::DeclaredStream,
    frontend::frontend_path,
    sndif::{
        XenSndEventPage, XenSndEvt, XenSndPageDirectoryHeader, XenSndReq, XenSndResp,
        XENSND_FIELD_EVT_CHNL, XENSND_FIELD_EVT_EVT_CHNL, XENSND_FIELD_EVT_RING_REF,
        XENSND_FIELD_RING_REF, XENSND_FIELD_TYPE, XENSND_FIELD_UNIQUE_ID,
        XENSND_GREFS_PER_DIR_PAGE, XENSND_IN_RING_LEN, XENSND_IN_RING_OFFS,
        XENSND_STREAM_TYPE_CAPTURE, XENSND_STREAM_TYPE_PLAYBACK, XEN_PAGE_SIZE,
    },
    Direction, Error, Result,
};

/// Guest memory available to every mock domain.
pub const DEFAULT_GUEST_PAGES: usize = 512;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

fn mmap_error<E: std::fmt::Display>(err: E) -> Error {
    Error::Io(IoError::new(ErrorKind::Other, err.to_string()))
}

#[derive(Debug, Default)]
pub struct MockXenStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MockXenStore {
    pub fn write(&self, path: &str, val: &str) {
        self.entries
            .write()
            .unwrap()
            .insert(path.to_string(), val.to_string());
    }
}

impl XenStore for MockXenStore {
    fn exists(&self, path: &str) -> bool {
        let dir = format!("{path}/");
        self.entries
            .read()
            .unwrap()
            .keys()
            .any(|key| key == path || key.starts_with(&dir))
    }

    fn read_string(&self, path: &str) -> Result<String> {
        self.entries
            .read()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::XenStoreEntryMissing(path.to_string()))
    }
}

/// Buffer built by the guest side of the mock: data pages and the head of
/// the page directory enumerating them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestBuffer {
    pub directory: GrantRef,
    pub grefs: Vec<GrantRef>,
}

/// Guest memory of one domain and its grant table.
#[derive(Debug)]
pub struct MockGrantTable {
    memory: Arc<MmapRegion>,
    pages: usize,
    next_free: Mutex<usize>,
    active_mappings: Arc<AtomicUsize>,
}

impl MockGrantTable {
    pub fn new(pages: usize) -> Result<Self> {
        let memory = MmapRegion::new(pages * XEN_PAGE_SIZE).map_err(mmap_error)?;
        Ok(Self {
            memory: Arc::new(memory),
            pages,
            next_free: Mutex::new(0),
            active_mappings: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Grant `count` physically contiguous guest pages.
    pub fn grant_pages(&self, count: usize) -> Result<Vec<GrantRef>> {
        let mut next_free = self.next_free.lock().unwrap();
        if *next_free + count > self.pages {
            return Err(Error::InvalidParameter(format!(
                "guest is out of memory: {count} pages requested, {} left",
                self.pages - *next_free
            )));
        }
        let first = *next_free;
        *next_free += count;
        Ok((first..first + count).map(|page| page as GrantRef + 1).collect())
    }

    /// Guest view of a granted page.
    pub fn page(&self, gref: GrantRef) -> Result<VolatileSlice<'_>> {
        let offset = self.page_offset(gref)?;
        Ok(self.memory.get_slice(offset, XEN_PAGE_SIZE)?)
    }

    /// Write the page directory enumerating `grefs` and return its first
    /// page.
    pub fn write_directory(&self, grefs: &[GrantRef]) -> Result<GrantRef> {
        let dir_pages = grefs.len().div_ceil(XENSND_GREFS_PER_DIR_PAGE).max(1);
        let directory = self.grant_pages(dir_pages)?;
        let entries_offset = size_of::<XenSndPageDirectoryHeader>();

        for (i, chunk) in grefs.chunks(XENSND_GREFS_PER_DIR_PAGE).enumerate() {
            let page = self.page(directory[i])?;
            let header = XenSndPageDirectoryHeader {
                gref_dir_next_page: directory.get(i + 1).copied().unwrap_or(0).into(),
            };
            page.write_obj(header, 0)?;
            for (j, gref) in chunk.iter().enumerate() {
                page.write_obj(Le32::from(*gref), entries_offset + j * size_of::<Le32>())?;
            }
        }
        Ok(directory[0])
    }

    /// Allocate a buffer of `size` bytes and describe it with a page
    /// directory, as a frontend does before `XENSND_OP_OPEN`.
    pub fn guest_buffer(&self, size: usize) -> Result<GuestBuffer> {
        let grefs = self.grant_pages(size.div_ceil(XEN_PAGE_SIZE))?;
        let directory = self.write_directory(&grefs)?;
        Ok(GuestBuffer { directory, grefs })
    }

    /// Number of mappings the backend currently holds.
    pub fn active_mappings(&self) -> usize {
        self.active_mappings.load(Ordering::SeqCst)
    }

    fn page_offset(&self, gref: GrantRef) -> Result<usize> {
        match gref as usize {
            0 => Err(Error::GrantMapFailed(gref)),
            page if page > self.pages => Err(Error::GrantMapFailed(gref)),
            page => Ok((page - 1) * XEN_PAGE_SIZE),
        }
    }

    fn map(&self, offset: usize, len: usize) -> Box<dyn GrantMapping> {
        self.active_mappings.fetch_add(1, Ordering::SeqCst);
        Box::new(MockMapping {
            memory: self.memory.clone(),
            offset,
            len,
            active_mappings: self.active_mappings.clone(),
        })
    }
}

impl GrantMapper for MockGrantTable {
    fn map_page(&self, gref: GrantRef) -> Result<Box<dyn GrantMapping>> {
        let offset = self.page_offset(gref)?;
        Ok(self.map(offset, XEN_PAGE_SIZE))
    }

    fn map_grants(&self, grefs: &[GrantRef]) -> Result<Box<dyn GrantMapping>> {
        let Some(first) = grefs.first() else {
            return Err(Error::InvalidParameter(
                "no grant references to map".to_string(),
            ));
        };
        let offset = self.page_offset(*first)?;
        // Only physically contiguous grants can be exposed as one range here.
        for (i, gref) in grefs.iter().enumerate() {
            self.page_offset(*gref)?;
            if *gref != first + i as GrantRef {
                return Err(Error::GrantMapFailed(*gref));
            }
        }
        Ok(self.map(offset, grefs.len() * XEN_PAGE_SIZE))
    }
}

struct MockMapping {
    memory: Arc<MmapRegion>,
    offset: usize,
    len: usize,
    active_mappings: Arc<AtomicUsize>,
}

impl GrantMapping for MockMapping {
    fn as_volatile_slice(&self) -> VolatileSlice<'_> {
        // SAFETY: `offset + len` was checked against the region when the
        // mapping was created and the region outlives `self`.
        unsafe { VolatileSlice::new(self.memory.as_ptr().add(self.offset), self.len) }
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        self.active_mappings.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend end of an in-process request ring.
pub struct MockRequestRing {
    requests: Receiver<XenSndReq>,
    responses: Sender<XenSndResp>,
}

impl RequestRing for MockRequestRing {
    fn next_request(&mut self) -> Option<XenSndReq> {
        self.requests.recv().ok()
    }

    fn send_response(&mut self, resp: &XenSndResp) -> Result<()> {
        self.responses.send(*resp).map_err(|_| Error::RingClosed)
    }
}

/// Frontend end of an in-process request ring. Dropping it closes the ring.
pub struct MockFrontendRing {
    requests: Sender<XenSndReq>,
    responses: Receiver<XenSndResp>,
}

impl MockFrontendRing {
    /// Post `req` and wait for its response.
    pub fn call(&self, req: XenSndReq) -> Result<XenSndResp> {
        self.requests.send(req).map_err(|_| Error::RingClosed)?;
        self.responses
            .recv_timeout(RESPONSE_TIMEOUT)
            .map_err(|err| match err {
                RecvTimeoutError::Timeout => Error::Timeout,
                RecvTimeoutError::Disconnected => Error::RingClosed,
            })
    }
}

/// Create a connected pair of request ring ends.
pub fn request_ring_pair() -> (MockRequestRing, MockFrontendRing) {
    let (req_tx, req_rx) = channel();
    let (resp_tx, resp_rx) = channel();
    (
        MockRequestRing {
            requests: req_rx,
            responses: resp_tx,
        },
        MockFrontendRing {
            requests: req_tx,
            responses: resp_rx,
        },
    )
}

struct EventRingInner {
    page: MmapRegion,
    notify: EventFd,
}

/// Shared event ring page laid out as `XenSndEventPage` followed by
/// `XENSND_IN_RING_LEN` event slots.
#[derive(Clone)]
pub struct MockEventRing {
    inner: Arc<EventRingInner>,
}

impl MockEventRing {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(EventRingInner {
                page: MmapRegion::new(XEN_PAGE_SIZE).map_err(mmap_error)?,
                notify: EventFd::new(EFD_NONBLOCK).map_err(Error::EventFdCreate)?,
            }),
        })
    }

    fn header(&self) -> Result<(u32, u32)> {
        let header: XenSndEventPage = self.inner.page.as_volatile_slice().read_obj(0)?;
        Ok((header.in_cons.into(), header.in_prod.into()))
    }

    const fn slot_offset(idx: u32) -> usize {
        XENSND_IN_RING_OFFS + (idx as usize % XENSND_IN_RING_LEN) * size_of::<XenSndEvt>()
    }

    /// Consume the oldest event, as the frontend does.
    pub fn pop_event(&self) -> Result<Option<XenSndEvt>> {
        let (cons, prod) = self.header()?;
        if cons == prod {
            return Ok(None);
        }
        let page = self.inner.page.as_volatile_slice();
        let evt: XenSndEvt = page.read_obj(Self::slot_offset(cons))?;
        page.write_obj(Le32::from(cons.wrapping_add(1)), 0)?;
        Ok(Some(evt))
    }

    /// Wait up to `timeout` for the next event.
    pub fn wait_event(&self, timeout: Duration) -> Result<Option<XenSndEvt>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(evt) = self.pop_event()? {
                return Ok(Some(evt));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    /// Number of notifications raised since the last call.
    pub fn take_notifications(&self) -> u64 {
        self.inner.notify.read().unwrap_or(0)
    }
}

impl EventSink for MockEventRing {
    fn send_event(&self, evt: &XenSndEvt) -> Result<()> {
        let (cons, prod) = self.header()?;
        if prod.wrapping_sub(cons) as usize >= XENSND_IN_RING_LEN {
            return Err(Error::EventRingFull);
        }
        let page = self.inner.page.as_volatile_slice();
        page.write_obj(*evt, Self::slot_offset(prod))?;
        // The event must be visible before the producer index moves.
        fence(Ordering::Release);
        page.write_obj(Le32::from(prod.wrapping_add(1)), size_of::<Le32>())?;
        self.inner.notify.write(1).map_err(Error::Io)
    }
}

/// XenStore references of a declared stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRefs {
    pub ring_ref: GrantRef,
    pub evt_ring_ref: GrantRef,
}

/// In-process bus hosting any number of mock frontends.
#[derive(Default)]
pub struct MockXenBus {
    store: MockXenStore,
    grant_tables: Mutex<HashMap<DomId, Arc<MockGrantTable>>>,
    backend_rings: Mutex<HashMap<(DomId, GrantRef), MockRequestRing>>,
    frontend_rings: Mutex<HashMap<(DomId, GrantRef), MockFrontendRing>>,
    event_rings: Mutex<HashMap<(DomId, GrantRef), MockEventRing>>,
    next_id: AtomicU32,
}

impl MockXenBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ..Default::default()
        }
    }

    pub const fn xenstore(&self) -> &MockXenStore {
        &self.store
    }

    pub fn grant_table(&self, dom: DomId) -> Result<Arc<MockGrantTable>> {
        let mut tables = self.grant_tables.lock().unwrap();
        if let Some(table) = tables.get(&dom) {
            return Ok(table.clone());
        }
        let table = Arc::new(MockGrantTable::new(DEFAULT_GUEST_PAGES)?);
        tables.insert(dom, table.clone());
        Ok(table)
    }

    /// Publish a stream in the XenStore area at `stream_path` and create its
    /// rings.
    pub fn declare_stream(
        &self,
        dom: DomId,
        stream_path: &str,
        stream: &DeclaredStream,
    ) -> Result<StreamRefs> {
        let ring_ref = self.next_id.fetch_add(1, Ordering::SeqCst);
        let evt_ring_ref = self.next_id.fetch_add(1, Ordering::SeqCst);
        let port: EventPort = self.next_id.fetch_add(1, Ordering::SeqCst);
        let evt_port: EventPort = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (backend, frontend) = request_ring_pair();
        self.backend_rings
            .lock()
            .unwrap()
            .insert((dom, ring_ref), backend);
        self.frontend_rings
            .lock()
            .unwrap()
            .insert((dom, ring_ref), frontend);
        self.event_rings
            .lock()
            .unwrap()
            .insert((dom, evt_ring_ref), MockEventRing::new()?);

        let stream_type = match stream.direction {
            Direction::Playback => XENSND_STREAM_TYPE_PLAYBACK,
            Direction::Capture => XENSND_STREAM_TYPE_CAPTURE,
        };
        let entries = [
            (XENSND_FIELD_UNIQUE_ID, stream.unique_id.clone()),
            (XENSND_FIELD_TYPE, stream_type.to_string()),
            (XENSND_FIELD_RING_REF, ring_ref.to_string()),
            (XENSND_FIELD_EVT_CHNL, port.to_string()),
            (XENSND_FIELD_EVT_RING_REF, evt_ring_ref.to_string()),
            (XENSND_FIELD_EVT_EVT_CHNL, evt_port.to_string()),
        ];
        for (field, val) in entries {
            self.store.write(&format!("{stream_path}/{field}"), &val);
        }

        Ok(StreamRefs {
            ring_ref,
            evt_ring_ref,
        })
    }

    /// Declare one card of a frontend, with one device per stream.
    pub fn declare_frontend(
        &self,
        dom: DomId,
        dev_id: u16,
        streams: &[DeclaredStream],
    ) -> Result<Vec<StreamRefs>> {
        let path = frontend_path(dom, dev_id);
        streams
            .iter()
            .enumerate()
            .map(|(device, stream)| self.declare_stream(dom, &format!("{path}/0/{device}/0"), stream))
            .collect()
    }

    /// Take the frontend end of a request ring.
    pub fn frontend_ring(&self, dom: DomId, ring_ref: GrantRef) -> Option<MockFrontendRing> {
        self.frontend_rings.lock().unwrap().remove(&(dom, ring_ref))
    }

    pub fn event_ring(&self, dom: DomId, evt_ring_ref: GrantRef) -> Option<MockEventRing> {
        self.event_rings
            .lock()
            .unwrap()
            .get(&(dom, evt_ring_ref))
            .cloned()
    }
}

impl XenBus for MockXenBus {
    fn store(&self) -> &dyn XenStore {
        &self.store
    }

    fn grant_mapper(&self, dom: DomId) -> Result<Arc<dyn GrantMapper>> {
        Ok(self.grant_table(dom)?)
    }

    fn request_ring(
        &self,
        dom: DomId,
        port: EventPort,
        ring_ref: GrantRef,
    ) -> Result<Box<dyn RequestRing>> {
        log::trace!("binding request ring {ring_ref} of domain {dom} on port {port}");
        let ring = self
            .backend_rings
            .lock()
            .unwrap()
            .remove(&(dom, ring_ref))
            .ok_or_else(|| {
                Error::InvalidParameter(format!("no request ring {ring_ref} in domain {dom}"))
            })?;
        Ok(Box::new(ring))
    }

    fn event_sink(
        &self,
        dom: DomId,
        port: EventPort,
        ring_ref: GrantRef,
    ) -> Result<Box<dyn EventSink>> {
        log::trace!("binding event ring {ring_ref} of domain {dom} on port {port}");
        let ring = self.event_ring(dom, ring_ref).ok_or_else(|| {
            Error::InvalidParameter(format!("no event ring {ring_ref} in domain {dom}"))
        })?;
        Ok(Box::new(ring))
    }
}
