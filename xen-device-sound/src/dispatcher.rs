// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Execution of frontend requests against a PCM device.

use std::sync::{Arc, Mutex};

use vm_memory::Bytes;

use crate::{
    audio_backends::{PcmDevice, PcmFormat, PcmParamRanges, PcmParams},
    buffer::GrantedBuffer,
    sndif::{
        XenSndEvt, XenSndOpenReq, XenSndQueryHwParam, XenSndReq, XenSndRwReq, XenSndTriggerReq,
        XENSND_OP_CLOSE, XENSND_OP_GET_VOLUME, XENSND_OP_HW_PARAM_QUERY, XENSND_OP_MUTE,
        XENSND_OP_OPEN, XENSND_OP_READ, XENSND_OP_SET_VOLUME, XENSND_OP_TRIGGER,
        XENSND_OP_TRIGGER_PAUSE, XENSND_OP_TRIGGER_RESUME, XENSND_OP_TRIGGER_START,
        XENSND_OP_TRIGGER_STOP, XENSND_OP_UNMUTE, XENSND_OP_WRITE,
    },
    stream::StreamState,
    xen::{EventSink, GrantMapper},
    Error, Result,
};

/// Request operations the backend serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Open,
    Close,
    Read,
    Write,
    Trigger,
    HwParamQuery,
}

impl TryFrom<u8> for RequestKind {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self> {
        Ok(match val {
            XENSND_OP_OPEN => Self::Open,
            XENSND_OP_CLOSE => Self::Close,
            XENSND_OP_READ => Self::Read,
            XENSND_OP_WRITE => Self::Write,
            XENSND_OP_TRIGGER => Self::Trigger,
            XENSND_OP_HW_PARAM_QUERY => Self::HwParamQuery,
            XENSND_OP_SET_VOLUME => return Err(Error::OperationNotSupported("XENSND_OP_SET_VOLUME")),
            XENSND_OP_GET_VOLUME => return Err(Error::OperationNotSupported("XENSND_OP_GET_VOLUME")),
            XENSND_OP_MUTE => return Err(Error::OperationNotSupported("XENSND_OP_MUTE")),
            XENSND_OP_UNMUTE => return Err(Error::OperationNotSupported("XENSND_OP_UNMUTE")),
            other => return Err(Error::UnknownOperation(other)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Start,
    Pause,
    Stop,
    Resume,
}

impl TryFrom<u8> for TriggerKind {
    type Error = Error;

    fn try_from(val: u8) -> Result<Self> {
        Ok(match val {
            XENSND_OP_TRIGGER_START => Self::Start,
            XENSND_OP_TRIGGER_PAUSE => Self::Pause,
            XENSND_OP_TRIGGER_STOP => Self::Stop,
            XENSND_OP_TRIGGER_RESUME => Self::Resume,
            other => return Err(Error::UnknownTrigger(other)),
        })
    }
}

#[derive(Debug, Default)]
struct EventState {
    next_id: u16,
    last_position: Option<u64>,
}

/// Turns position notifications into `XENSND_EVT_CUR_POS` events.
///
/// Event ids wrap around at `u16::MAX`. An id is only consumed by an event
/// that reached the ring.
pub struct EventSender {
    sink: Box<dyn EventSink>,
    state: Mutex<EventState>,
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(EventSender))
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl EventSender {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            sink,
            state: Mutex::new(EventState::default()),
        }
    }

    /// Id of the next event.
    pub fn next_id(&self) -> u16 {
        self.state.lock().unwrap().next_id
    }

    /// Forget the last position, a newly opened stream counts from zero.
    pub fn reset(&self) {
        self.state.lock().unwrap().last_position = None;
    }

    pub fn notify_position(&self, position: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(last) = state.last_position {
            if position < last {
                log::warn!("dropping stale position {position}, last reported {last}");
                return;
            }
        }
        let evt = XenSndEvt::cur_pos(state.next_id, position);
        match self.sink.send_event(&evt) {
            Ok(()) => {
                log::trace!("event {}: position {}", state.next_id, position);
                state.next_id = state.next_id.wrapping_add(1);
                state.last_position = Some(position);
            }
            Err(err) => log::warn!("dropping position event {position}: {err}"),
        }
    }
}

/// Outcome of one request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub status: i32,
    pub hw_param: Option<XenSndQueryHwParam>,
}

/// Negative status for `errno`. Non positive values become `-EINVAL`.
pub const fn status_from_errno(errno: i32) -> i32 {
    if errno > 0 {
        -errno
    } else {
        -libc::EINVAL
    }
}

/// Executes the requests of one stream.
///
/// Owns the PCM device bound to the stream and, between `XENSND_OP_OPEN` and
/// `XENSND_OP_CLOSE`, the mapping of the guest buffer.
pub struct CommandDispatcher {
    mapper: Arc<dyn GrantMapper>,
    device: Box<dyn PcmDevice>,
    buffer: Option<GrantedBuffer>,
    events: Arc<EventSender>,
    state: StreamState,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(CommandDispatcher))
            .field("buffer", &self.buffer)
            .field("events", &self.events)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    pub fn new(
        mapper: Arc<dyn GrantMapper>,
        mut device: Box<dyn PcmDevice>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let events = Arc::new(EventSender::new(sink));
        let progress = events.clone();
        device.set_progress_callback(Arc::new(move |position| {
            progress.notify_position(position)
        }));
        Self {
            mapper,
            device,
            buffer: None,
            events,
            state: StreamState::new(),
        }
    }

    pub const fn state(&self) -> StreamState {
        self.state
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Execute `req`. Errors are logged and reported as a negative errno.
    pub fn process(&mut self, req: &XenSndReq) -> Reply {
        match self.handle(req) {
            Ok(hw_param) => Reply {
                status: 0,
                hw_param,
            },
            Err(err) => {
                log::error!(
                    "request {} (operation {}) failed: {}",
                    u16::from(req.id),
                    req.operation,
                    err
                );
                if err.is_backend_fatal() {
                    log::debug!("closing stream after backend failure");
                    if let Err(close_err) = self.close() {
                        log::error!("could not close stream: {}", close_err);
                    }
                }
                Reply {
                    status: status_from_errno(err.errno()),
                    hw_param: None,
                }
            }
        }
    }

    fn handle(&mut self, req: &XenSndReq) -> Result<Option<XenSndQueryHwParam>> {
        match RequestKind::try_from(req.operation)? {
            RequestKind::Open => self.open(&req.payload())?,
            RequestKind::Close => self.close()?,
            RequestKind::Read => self.read(&req.payload())?,
            RequestKind::Write => self.write(&req.payload())?,
            RequestKind::Trigger => {
                let trigger: XenSndTriggerReq = req.payload();
                self.trigger(TriggerKind::try_from(trigger.type_)?)?
            }
            RequestKind::HwParamQuery => {
                let query: XenSndQueryHwParam = req.payload();
                let resp = self.device.query_hw_ranges(&PcmParamRanges::from(query))?;
                log::trace!("hw param query {:?} answered {:?}", query, resp);
                return Ok(Some(resp.into()));
            }
        }
        Ok(None)
    }

    fn open(&mut self, req: &XenSndOpenReq) -> Result<()> {
        if self.state.is_open() || self.buffer.is_some() {
            log::debug!("open on an open stream, closing it first");
            self.close()?;
        }
        let params = PcmParams {
            rate: req.pcm_rate.into(),
            format: PcmFormat::try_from(req.pcm_format)?,
            channels: req.pcm_channels,
            buffer_size: req.buffer_sz.into(),
            period_size: req.period_sz.into(),
        };
        params.validate()?;

        let buffer = GrantedBuffer::map(
            self.mapper.as_ref(),
            req.gref_directory.into(),
            params.buffer_size,
        )?;
        self.events.reset();
        // `buffer` is unmapped on the way out if the device refuses.
        self.device.open(&params)?;
        if let Some(achieved) = self.device.hw_params() {
            if achieved != params {
                log::debug!("requested {:?}, device achieved {:?}", params, achieved);
            }
        }
        self.buffer = Some(buffer);
        self.state.open()?;
        Ok(())
    }

    /// Release the guest buffer and close the device. Closing a closed
    /// stream does nothing.
    pub fn close(&mut self) -> Result<()> {
        self.buffer = None;
        self.state.close()?;
        self.device.close()
    }

    fn read(&mut self, req: &XenSndRwReq) -> Result<()> {
        let buffer = self.buffer.as_ref().ok_or(Error::NotOpen)?;
        let slice = buffer.slice(req.offset.into(), req.length.into())?;
        let mut data = vec![0; slice.len()];
        self.device.read(&mut data)?;
        slice.write_slice(&data, 0)?;
        Ok(())
    }

    fn write(&mut self, req: &XenSndRwReq) -> Result<()> {
        let buffer = self.buffer.as_ref().ok_or(Error::NotOpen)?;
        let slice = buffer.slice(req.offset.into(), req.length.into())?;
        let mut data = vec![0; slice.len()];
        slice.read_slice(&mut data, 0)?;
        self.device.write(&data)
    }

    fn trigger(&mut self, kind: TriggerKind) -> Result<()> {
        if !self.state.is_open() {
            return Err(Error::NotOpen);
        }
        // The state only moves once the device followed.
        let mut next = self.state;
        match kind {
            TriggerKind::Start => {
                next.start()?;
                self.device.start()?;
            }
            TriggerKind::Pause => {
                next.pause()?;
                self.device.pause()?;
            }
            TriggerKind::Stop => {
                next.stop()?;
                self.device.stop()?;
            }
            TriggerKind::Resume => {
                next.resume()?;
                self.device.resume()?;
            }
        }
        log::debug!("stream {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::error!("could not close stream: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{thread::sleep, time::Duration};

    use assert_matches::assert_matches;
    use rstest::*;
    use vm_memory::Bytes;

    use super::*;
    use crate::{
        audio_backends::{alloc_pcm_device, PcmDeviceConfig, ProgressCallback},
        sndif::*,
        xen::mock::{MockEventRing, MockGrantTable},
        BackendType, Direction,
    };

    #[derive(Debug, Default)]
    struct FakeLog {
        calls: Vec<&'static str>,
        written: Vec<u8>,
    }

    /// Device doing what the test scripted.
    #[derive(Default)]
    struct FakePcm {
        params: Option<PcmParams>,
        log: Arc<Mutex<FakeLog>>,
        open_errno: Option<i32>,
        write_errno: Option<i32>,
    }

    impl FakePcm {
        fn record(&self, call: &'static str) {
            self.log.lock().unwrap().calls.push(call);
        }
    }

    impl PcmDevice for FakePcm {
        fn open(&mut self, params: &PcmParams) -> Result<()> {
            self.record("open");
            if let Some(errno) = self.open_errno {
                return Err(Error::AudioBackendErrno("open".into(), errno));
            }
            self.params = Some(*params);
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            if self.params.take().is_some() {
                self.record("close");
            }
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<()> {
            self.params.ok_or(Error::NotOpen)?;
            buf.fill(0xab);
            Ok(())
        }

        fn write(&mut self, buf: &[u8]) -> Result<()> {
            self.params.ok_or(Error::NotOpen)?;
            if let Some(errno) = self.write_errno {
                return Err(Error::AudioBackendErrno("write".into(), errno));
            }
            self.log.lock().unwrap().written.extend_from_slice(buf);
            Ok(())
        }

        fn start(&mut self) -> Result<()> {
            self.record("start");
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            self.record("stop");
            Ok(())
        }

        fn pause(&mut self) -> Result<()> {
            self.record("pause");
            Ok(())
        }

        fn resume(&mut self) -> Result<()> {
            self.record("resume");
            Ok(())
        }

        fn query_hw_ranges(&mut self, req: &PcmParamRanges) -> Result<PcmParamRanges> {
            Ok(PcmParamRanges {
                channels: crate::audio_backends::ParamRange::new(2, 2),
                ..*req
            })
        }

        fn set_progress_callback(&mut self, _callback: ProgressCallback) {}

        fn hw_params(&self) -> Option<PcmParams> {
            self.params
        }

        fn direction(&self) -> Direction {
            Direction::Playback
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    #[derive(Clone, Default)]
    struct CollectSink {
        events: Arc<Mutex<Vec<XenSndEvt>>>,
        full: bool,
    }

    impl EventSink for CollectSink {
        fn send_event(&self, evt: &XenSndEvt) -> Result<()> {
            if self.full {
                return Err(Error::EventRingFull);
            }
            self.events.lock().unwrap().push(*evt);
            Ok(())
        }
    }

    struct Fixture {
        table: Arc<MockGrantTable>,
        events: MockEventRing,
        dispatcher: CommandDispatcher,
        buffer: crate::xen::mock::GuestBuffer,
    }

    impl Fixture {
        fn new(device: Box<dyn PcmDevice>) -> Self {
            let table = Arc::new(MockGrantTable::new(64).unwrap());
            let events = MockEventRing::new().unwrap();
            let dispatcher =
                CommandDispatcher::new(table.clone(), device, Box::new(events.clone()));
            let buffer = table.guest_buffer(32768).unwrap();
            Self {
                table,
                events,
                dispatcher,
                buffer,
            }
        }

        fn null() -> Self {
            Self::new(
                alloc_pcm_device(BackendType::Null, PcmDeviceConfig::new(Direction::Playback))
                    .unwrap(),
            )
        }

        fn fake() -> (Self, Arc<Mutex<FakeLog>>) {
            let device = FakePcm::default();
            let log = device.log.clone();
            (Self::new(Box::new(device)), log)
        }

        fn open_req(&self) -> XenSndOpenReq {
            XenSndOpenReq {
                pcm_rate: 48000.into(),
                pcm_format: XENSND_PCM_FORMAT_S16_LE,
                pcm_channels: 2,
                buffer_sz: 32768.into(),
                gref_directory: self.buffer.directory.into(),
                period_sz: 8192.into(),
                ..Default::default()
            }
        }

        fn call<T: vm_memory::ByteValued>(&mut self, operation: u8, payload: T) -> Reply {
            self.dispatcher
                .process(&XenSndReq::new(0, operation, payload))
        }

        fn open(&mut self) -> Reply {
            let req = self.open_req();
            self.call(XENSND_OP_OPEN, req)
        }

        fn trigger(&mut self, type_: u8) -> Reply {
            self.call(XENSND_OP_TRIGGER, XenSndTriggerReq { type_ })
        }
    }

    fn rw(offset: u32, length: u32) -> XenSndRwReq {
        XenSndRwReq {
            offset: offset.into(),
            length: length.into(),
        }
    }

    #[test]
    fn test_request_kind() {
        assert_eq!(RequestKind::try_from(0).unwrap(), RequestKind::Open);
        assert_eq!(RequestKind::try_from(9).unwrap(), RequestKind::HwParamQuery);
        assert_matches!(
            RequestKind::try_from(XENSND_OP_MUTE),
            Err(Error::OperationNotSupported("XENSND_OP_MUTE"))
        );
        assert_matches!(RequestKind::try_from(10), Err(Error::UnknownOperation(10)));
        assert_eq!(TriggerKind::try_from(3).unwrap(), TriggerKind::Resume);
        assert_matches!(TriggerKind::try_from(4), Err(Error::UnknownTrigger(4)));
    }

    #[test]
    fn test_status_from_errno() {
        assert_eq!(status_from_errno(libc::EBADF), -libc::EBADF);
        assert_eq!(status_from_errno(0), -libc::EINVAL);
        assert_eq!(status_from_errno(-libc::EIO), -libc::EINVAL);
    }

    #[test]
    fn test_playback_scenario() {
        crate::init_logger();
        let mut fixture = Fixture::null();
        _ = format!("{:?}", fixture.dispatcher);

        assert_eq!(fixture.open().status, 0);
        assert_eq!(fixture.dispatcher.state(), StreamState::Opened);
        assert_eq!(fixture.table.active_mappings(), 1);

        for _ in 0..8 {
            assert_eq!(fixture.call(XENSND_OP_WRITE, rw(0, 4096)).status, 0);
        }
        assert_eq!(fixture.trigger(XENSND_OP_TRIGGER_START).status, 0);
        assert_eq!(fixture.dispatcher.state(), StreamState::Running);

        let first = fixture
            .events
            .wait_event(Duration::from_secs(2))
            .unwrap()
            .expect("no position event");
        sleep(Duration::from_millis(150));
        let mut events = vec![first];
        while let Some(evt) = fixture.events.pop_event().unwrap() {
            events.push(evt);
        }

        for (i, evt) in events.iter().enumerate() {
            assert_eq!(evt.type_, XENSND_EVT_CUR_POS);
            assert_eq!(u16::from(evt.id), i as u16);
        }
        let positions: Vec<u64> = events
            .iter()
            .map(|evt| evt.payload::<XenSndCurPosEvt>().position.into())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] <= w[1]));
        assert!(positions.iter().all(|pos| *pos <= 32768));

        assert_eq!(fixture.call(XENSND_OP_CLOSE, rw(0, 0)).status, 0);
        assert_eq!(fixture.dispatcher.state(), StreamState::Closed);
        assert_eq!(fixture.table.active_mappings(), 0);
    }

    #[test]
    fn test_write_and_read_guest_data() {
        crate::init_logger();
        let (mut fixture, log) = Fixture::fake();
        let page = fixture.buffer.grefs[1];
        fixture
            .table
            .page(page)
            .unwrap()
            .write_slice(&[1, 2, 3, 4, 5, 6, 7, 8], 16)
            .unwrap();

        assert_eq!(fixture.open().status, 0);
        let offset = XEN_PAGE_SIZE as u32 + 16;
        assert_eq!(fixture.call(XENSND_OP_WRITE, rw(offset, 8)).status, 0);
        assert_eq!(log.lock().unwrap().written, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        assert_eq!(fixture.call(XENSND_OP_READ, rw(offset, 4)).status, 0);
        let mut data = [0u8; 8];
        fixture
            .table
            .page(page)
            .unwrap()
            .read_slice(&mut data, 16)
            .unwrap();
        assert_eq!(data, [0xab, 0xab, 0xab, 0xab, 5, 6, 7, 8]);
    }

    #[rstest]
    #[case::unknown(42, -libc::ENOTSUP)]
    #[case::set_volume(XENSND_OP_SET_VOLUME, -libc::ENOTSUP)]
    #[case::get_volume(XENSND_OP_GET_VOLUME, -libc::ENOTSUP)]
    #[case::mute(XENSND_OP_MUTE, -libc::ENOTSUP)]
    #[case::unmute(XENSND_OP_UNMUTE, -libc::ENOTSUP)]
    #[case::read_before_open(XENSND_OP_READ, -libc::EBADF)]
    #[case::write_before_open(XENSND_OP_WRITE, -libc::EBADF)]
    #[case::trigger_before_open(XENSND_OP_TRIGGER, -libc::EBADF)]
    fn test_rejected_requests(#[case] operation: u8, #[case] status: i32) {
        crate::init_logger();
        let (mut fixture, log) = Fixture::fake();
        let reply = fixture.call(operation, rw(0, 4));
        assert_eq!(reply.status, status);
        assert_eq!(reply.hw_param, None);
        assert_eq!(fixture.dispatcher.state(), StreamState::Closed);
        assert!(log.lock().unwrap().calls.is_empty());
    }

    #[test]
    fn test_unknown_operation_keeps_stream() {
        crate::init_logger();
        let (mut fixture, _log) = Fixture::fake();
        assert_eq!(fixture.open().status, 0);
        assert_eq!(fixture.call(42, rw(0, 4)).status, -libc::ENOTSUP);
        assert_eq!(fixture.dispatcher.state(), StreamState::Opened);
        assert_eq!(fixture.table.active_mappings(), 1);
    }

    #[test]
    fn test_triggers() {
        crate::init_logger();
        let (mut fixture, log) = Fixture::fake();
        assert_eq!(fixture.open().status, 0);

        assert_eq!(fixture.trigger(7).status, -libc::EINVAL);
        assert_eq!(fixture.trigger(XENSND_OP_TRIGGER_PAUSE).status, -libc::EINVAL);
        assert_eq!(fixture.dispatcher.state(), StreamState::Opened);

        for type_ in [
            XENSND_OP_TRIGGER_START,
            XENSND_OP_TRIGGER_PAUSE,
            XENSND_OP_TRIGGER_RESUME,
            XENSND_OP_TRIGGER_STOP,
            XENSND_OP_TRIGGER_START,
        ] {
            assert_eq!(fixture.trigger(type_).status, 0);
        }
        assert_eq!(fixture.dispatcher.state(), StreamState::Running);
        assert_eq!(
            log.lock().unwrap().calls,
            vec!["open", "start", "pause", "resume", "stop", "start"]
        );
    }

    #[test]
    fn test_open_failure_releases_buffer() {
        crate::init_logger();
        let device = FakePcm {
            open_errno: Some(libc::ENODEV),
            ..FakePcm::default()
        };
        let mut fixture = Fixture::new(Box::new(device));
        assert_eq!(fixture.open().status, -libc::ENODEV);
        assert_eq!(fixture.table.active_mappings(), 0);
        assert_eq!(fixture.dispatcher.state(), StreamState::Closed);
        assert_eq!(fixture.call(XENSND_OP_WRITE, rw(0, 4)).status, -libc::EBADF);
    }

    #[test]
    fn test_open_invalid_requests() {
        crate::init_logger();
        let (mut fixture, log) = Fixture::fake();

        let mut req = fixture.open_req();
        req.pcm_format = XENSND_PCM_FORMAT_GSM;
        assert_eq!(fixture.call(XENSND_OP_OPEN, req).status, -libc::EINVAL);

        let mut req = fixture.open_req();
        req.gref_directory = 0.into();
        assert_eq!(fixture.call(XENSND_OP_OPEN, req).status, -libc::EINVAL);

        let mut req = fixture.open_req();
        req.period_sz = 65536.into();
        assert_eq!(fixture.call(XENSND_OP_OPEN, req).status, -libc::EINVAL);

        assert_eq!(fixture.table.active_mappings(), 0);
        assert!(log.lock().unwrap().calls.is_empty());
    }

    #[test]
    fn test_reopen_closes_previous() {
        crate::init_logger();
        let (mut fixture, log) = Fixture::fake();
        assert_eq!(fixture.open().status, 0);
        assert_eq!(fixture.trigger(XENSND_OP_TRIGGER_START).status, 0);
        assert_eq!(fixture.open().status, 0);
        assert_eq!(fixture.dispatcher.state(), StreamState::Opened);
        assert_eq!(fixture.table.active_mappings(), 1);
        assert_eq!(
            log.lock().unwrap().calls,
            vec!["open", "start", "close", "open"]
        );
    }

    #[test]
    fn test_out_of_range_slice() {
        crate::init_logger();
        let (mut fixture, log) = Fixture::fake();
        assert_eq!(fixture.open().status, 0);
        assert_eq!(
            fixture.call(XENSND_OP_WRITE, rw(32000, 4096)).status,
            -libc::EINVAL
        );
        assert_eq!(
            fixture.call(XENSND_OP_READ, rw(u32::MAX, 2)).status,
            -libc::EINVAL
        );
        assert!(log.lock().unwrap().written.is_empty());
        assert_eq!(fixture.dispatcher.state(), StreamState::Opened);
    }

    #[rstest]
    #[case::io(libc::EIO, -libc::EIO)]
    #[case::zero(0, -libc::EINVAL)]
    fn test_fatal_write_closes_stream(#[case] errno: i32, #[case] status: i32) {
        crate::init_logger();
        let device = FakePcm {
            write_errno: Some(errno),
            ..FakePcm::default()
        };
        let log = device.log.clone();
        let mut fixture = Fixture::new(Box::new(device));
        assert_eq!(fixture.open().status, 0);
        assert_eq!(fixture.call(XENSND_OP_WRITE, rw(0, 4)).status, status);
        assert_eq!(fixture.dispatcher.state(), StreamState::Closed);
        assert_eq!(fixture.table.active_mappings(), 0);
        assert_eq!(log.lock().unwrap().calls, vec!["open", "close"]);
    }

    #[test]
    fn test_hw_param_query() {
        crate::init_logger();
        let (mut fixture, _log) = Fixture::fake();
        let query = XenSndQueryHwParam {
            formats: (1u64 << XENSND_PCM_FORMAT_S16_LE).into(),
            rates: XenSndRange {
                min: 8000.into(),
                max: 48000.into(),
            },
            channels: XenSndRange {
                min: 1.into(),
                max: 8.into(),
            },
            ..Default::default()
        };
        let reply = fixture.call(XENSND_OP_HW_PARAM_QUERY, query);
        assert_eq!(reply.status, 0);
        let resp = reply.hw_param.unwrap();
        assert_eq!(resp.rates, query.rates);
        assert_eq!(u32::from(resp.channels.min), 2);
        assert_eq!(u32::from(resp.channels.max), 2);
    }

    #[test]
    fn test_event_sender_positions() {
        crate::init_logger();
        let sink = CollectSink::default();
        let events = sink.events.clone();
        let sender = EventSender::new(Box::new(sink));
        _ = format!("{sender:?}");

        sender.notify_position(0);
        sender.notify_position(4096);
        sender.notify_position(4096);
        // stale
        sender.notify_position(1024);
        assert_eq!(sender.next_id(), 3);

        // A new stream counts from zero again, ids keep going.
        sender.reset();
        sender.notify_position(512);

        let events = events.lock().unwrap();
        let ids: Vec<u16> = events.iter().map(|evt| evt.id.into()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        let positions: Vec<u64> = events
            .iter()
            .map(|evt| evt.payload::<XenSndCurPosEvt>().position.into())
            .collect();
        assert_eq!(positions, vec![0, 4096, 4096, 512]);
    }

    #[test]
    fn test_event_sender_full_ring() {
        crate::init_logger();
        let sink = CollectSink {
            full: true,
            ..CollectSink::default()
        };
        let sender = EventSender::new(Box::new(sink));
        sender.notify_position(4096);
        // A dropped event does not consume an id or move the position.
        assert_eq!(sender.next_id(), 0);
        sender.reset();
    }

    #[test]
    fn test_event_id_wraps() {
        let sink = CollectSink::default();
        let events = sink.events.clone();
        let sender = EventSender::new(Box::new(sink));
        for position in 0..=u64::from(u16::MAX) + 1 {
            sender.notify_position(position);
        }
        assert_eq!(sender.next_id(), 1);
        let events = events.lock().unwrap();
        assert_eq!(u16::from(events[usize::from(u16::MAX)].id), u16::MAX);
        assert_eq!(u16::from(events[usize::from(u16::MAX) + 1].id), 0);
    }

    #[test]
    fn test_close_ignores_payload() {
        crate::init_logger();
        let mut fixture = Fixture::null();
        let reply = fixture.call(XENSND_OP_CLOSE, XenSndOpenReq::default());
        assert_matches!(reply, Reply { status: 0, hw_param: None });
    }
}
