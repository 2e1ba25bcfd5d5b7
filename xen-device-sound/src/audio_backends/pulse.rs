// PulseAudio backend device
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    cell::RefCell,
    rc::Rc,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::debug;
use pulse::{
    context::{self, Context},
    def::BufferAttr,
    error::PAErr,
    mainloop::threaded::Mainloop,
    operation::{self, Operation},
    proplist::Proplist,
    sample::{Format, Spec},
    stream::{self, PeekResult, SeekMode, Stream},
};

use super::{
    transfer_all, ParamRange, PcmDevice, PcmDeviceConfig, PcmFormat, PcmParamRanges, PcmParams,
    ProgressCallback, Transfer,
};
use crate::{timer::PositionTimer, Direction, Error, Result};

/// Longest a transfer or a stream operation waits for the server.
const STREAM_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
/// `PA_CHANNELS_MAX`
const CHANNELS_MAX: u32 = 32;
/// `PA_RATE_MAX`
const RATE_MAX: u32 = 48000 * 8;

fn sample_format(format: PcmFormat) -> Result<Format> {
    Ok(match format {
        PcmFormat::U8 => Format::U8,
        PcmFormat::S16Le => Format::S16le,
        PcmFormat::S16Be => Format::S16be,
        PcmFormat::S24Le => Format::S24_32le,
        PcmFormat::S24Be => Format::S24_32be,
        PcmFormat::S32Le => Format::S32le,
        PcmFormat::S32Be => Format::S32be,
        PcmFormat::ALaw => Format::ALaw,
        PcmFormat::MuLaw => Format::ULaw,
        PcmFormat::F32Le => Format::F32le,
        PcmFormat::F32Be => Format::F32be,
        other => return Err(Error::InvalidFormat(other as u8)),
    })
}

fn native_ranges() -> PcmParamRanges {
    PcmParamRanges {
        formats: PcmFormat::ALL
            .iter()
            .filter(|format| sample_format(**format).is_ok())
            .fold(0, |mask, format| mask | format.mask()),
        rates: ParamRange::new(1, RATE_MAX),
        channels: ParamRange::new(1, CHANNELS_MAX),
        buffer: ParamRange::new(64, 1 << 20),
        period: ParamRange::new(32, 1 << 19),
    }
}

fn pa_error(op: &'static str) -> impl Fn(PAErr) -> Error {
    move |err| {
        log::error!("{}: {:?}", op, err);
        Error::UnexpectedAudioBackendError(format!("{op}: {err:?}"))
    }
}

fn context_error(context: &RefCell<Context>, op: &'static str) -> Error {
    pa_error(op)(context.borrow().errno())
}

type SharedMainloop = Rc<RefCell<Mainloop>>;

/// Wake up the thread waiting on the mainloop. Only called from callbacks,
/// which run on the mainloop thread with the loop lock held.
fn signal(mainloop: &SharedMainloop) {
    // SAFETY: the waiting thread is parked in `pa_threaded_mainloop_wait` and
    // does not touch the loop until it is signalled.
    unsafe { (*mainloop.as_ptr()).signal(false) };
}

fn signal_done(mainloop: &SharedMainloop) -> Option<Box<dyn FnMut(bool) + 'static>> {
    let mainloop = mainloop.clone();
    Some(Box::new(move |success| {
        if !success {
            debug!("pulse stream operation failed");
        }
        signal(&mainloop);
    }))
}

/// Holds the mainloop lock until dropped.
struct LoopLock(SharedMainloop);

impl LoopLock {
    fn new(mainloop: &SharedMainloop) -> Self {
        mainloop.borrow_mut().lock();
        Self(mainloop.clone())
    }

    /// Release the lock until a callback signals the mainloop.
    fn wait(&self) {
        self.0.borrow_mut().wait();
    }
}

impl Drop for LoopLock {
    fn drop(&mut self) {
        self.0.borrow_mut().unlock();
    }
}

fn check_status(context: &RefCell<Context>, stream: &Stream) -> Result<()> {
    if context.borrow().get_state().is_good() && stream.get_state().is_good() {
        Ok(())
    } else {
        Err(context_error(context, "pulse stream"))
    }
}

fn wait_operation<C: ?Sized>(
    lock: &LoopLock,
    context: &RefCell<Context>,
    stream: &Stream,
    op: &mut Operation<C>,
) -> Result<()> {
    let deadline = Instant::now() + STREAM_WAIT_TIMEOUT;
    while matches!(op.get_state(), operation::State::Running) {
        check_status(context, stream)?;
        if Instant::now() >= deadline {
            op.cancel();
            return Err(Error::Timeout);
        }
        lock.wait();
    }
    Ok(())
}

struct PulseConnection {
    context: Rc<RefCell<Context>>,
    mainloop: SharedMainloop,
}

impl Drop for PulseConnection {
    fn drop(&mut self) {
        {
            let _lock = LoopLock::new(&self.mainloop);
            let mut context = self.context.borrow_mut();
            context.set_state_callback(None);
            context.disconnect();
        }
        self.mainloop.borrow_mut().stop();
    }
}

#[derive(Debug, Default)]
struct PulseShared {
    /// Bytes handed to or taken from the server since open
    transferred: u64,
    running: bool,
}

/// A stream of a PulseAudio server, on a threaded mainloop owned by the
/// device. The server is contacted on the first open.
pub struct PulsePcm {
    config: PcmDeviceConfig,
    params: Option<PcmParams>,
    // Declared before `connection` so it is released first.
    stream: Option<Stream>,
    connection: Option<PulseConnection>,
    /// Captured bytes peeked from the server but not handed out yet
    pending: Vec<u8>,
    shared: Arc<Mutex<PulseShared>>,
    timer: PositionTimer,
    progress: Option<ProgressCallback>,
}

// SAFETY: Safe as the PulseAudio objects are only used with the mainloop lock
// held, and the callbacks only signal the mainloop.
unsafe impl Send for PulsePcm {}

impl std::fmt::Debug for PulsePcm {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(PulsePcm))
            .field("config", &self.config)
            .field("params", &self.params)
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

impl PulsePcm {
    pub fn new(config: PcmDeviceConfig) -> Self {
        Self {
            timer: PositionTimer::new(format!("pulse-{}", config.direction)),
            config,
            params: None,
            stream: None,
            connection: None,
            pending: Vec::new(),
            shared: Arc::new(Mutex::new(PulseShared::default())),
            progress: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        let mainloop = Mainloop::new().ok_or_else(|| {
            Error::UnexpectedAudioBackendError("could not create pulse mainloop".to_string())
        })?;
        let mainloop = Rc::new(RefCell::new(mainloop));
        let context = Context::new(&*mainloop.borrow(), "xen-sound").ok_or_else(|| {
            Error::UnexpectedAudioBackendError("could not create pulse context".to_string())
        })?;
        let context = Rc::new(RefCell::new(context));

        let state_mainloop = mainloop.clone();
        context
            .borrow_mut()
            .set_state_callback(Some(Box::new(move || signal(&state_mainloop))));
        let connected = context
            .borrow_mut()
            .connect(None, context::FlagSet::NOFLAGS, None);
        connected.map_err(pa_error("pa_context_connect"))?;

        let connection = PulseConnection { context, mainloop };
        {
            let lock = LoopLock::new(&connection.mainloop);
            let started = connection.mainloop.borrow_mut().start();
            started.map_err(pa_error("pa_threaded_mainloop_start"))?;
            loop {
                let state = connection.context.borrow().get_state();
                match state {
                    context::State::Ready => break,
                    state if !state.is_good() => {
                        return Err(context_error(&connection.context, "pa_context_connect"))
                    }
                    _ => lock.wait(),
                }
            }
        }
        log::trace!("pulse connection established");
        self.connection = Some(connection);
        Ok(())
    }

    fn check_direction(&self, op: &'static str, direction: Direction) -> Result<()> {
        if self.config.direction == direction {
            Ok(())
        } else {
            Err(Error::WrongDirection(op, self.config.direction))
        }
    }

    fn new_stream(
        &self,
        lock: &LoopLock,
        context: &RefCell<Context>,
        params: &PcmParams,
    ) -> Result<Stream> {
        let spec = Spec {
            format: sample_format(params.format)?,
            rate: params.rate,
            channels: params.channels,
        };
        if !spec.is_valid() {
            return Err(Error::InvalidParameter(format!(
                "unsupported sample spec {params:?}"
            )));
        }
        let mut proplist = Proplist::new().ok_or_else(|| {
            Error::UnexpectedAudioBackendError("could not create pulse proplist".to_string())
        })?;
        if !self.config.prop_name.is_empty() {
            proplist
                .set_str(&self.config.prop_name, &self.config.prop_value)
                .map_err(|()| {
                    Error::InvalidParameter(format!(
                        "invalid stream property {}",
                        self.config.prop_name
                    ))
                })?;
        }

        let stream =
            Stream::new_with_proplist(&mut context.borrow_mut(), "xen-sound", &spec, None, &mut proplist);
        let mut stream = stream.ok_or_else(|| context_error(context, "pa_stream_new"))?;

        let mainloop = &lock.0;
        let state_mainloop = mainloop.clone();
        stream.set_state_callback(Some(Box::new(move || signal(&state_mainloop))));
        // Timing updates wake up waiters regularly, so deadlines are honored.
        let latency_mainloop = mainloop.clone();
        stream.set_latency_update_callback(Some(Box::new(move || signal(&latency_mainloop))));
        let request_mainloop = mainloop.clone();
        let request: Box<dyn FnMut(usize) + 'static> =
            Box::new(move |_| signal(&request_mainloop));

        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: params.buffer_size,
            prebuf: u32::MAX,
            minreq: params.period_size,
            fragsize: params.period_size,
        };
        let flags = stream::FlagSet::INTERPOLATE_TIMING
            | stream::FlagSet::ADJUST_LATENCY
            | stream::FlagSet::AUTO_TIMING_UPDATE;
        let device =
            (!self.config.device_name.is_empty()).then_some(self.config.device_name.as_str());
        match self.config.direction {
            Direction::Playback => {
                stream.set_write_callback(Some(request));
                stream
                    .connect_playback(device, Some(&attr), flags, None, None)
                    .map_err(pa_error("pa_stream_connect_playback"))?;
            }
            Direction::Capture => {
                stream.set_read_callback(Some(request));
                stream
                    .connect_record(device, Some(&attr), flags)
                    .map_err(pa_error("pa_stream_connect_record"))?;
            }
        }

        loop {
            match stream.get_state() {
                stream::State::Ready => break,
                state if !state.is_good() => {
                    return Err(context_error(context, "pa_stream_connect"))
                }
                _ => lock.wait(),
            }
        }
        Ok(stream)
    }

    /// Cork or uncork the stream, dropping queued data when `flush` is set.
    fn cork(&mut self, cork: bool, flush: bool) -> Result<()> {
        let (Some(connection), Some(stream)) = (self.connection.as_ref(), self.stream.as_mut())
        else {
            return Err(Error::NotOpen);
        };
        {
            let lock = LoopLock::new(&connection.mainloop);
            let mut op = if cork {
                stream.cork(signal_done(&connection.mainloop))
            } else {
                stream.uncork(signal_done(&connection.mainloop))
            };
            wait_operation(&lock, &connection.context, stream, &mut op)?;
            if flush {
                let mut op = stream.flush(signal_done(&connection.mainloop));
                wait_operation(&lock, &connection.context, stream, &mut op)?;
            }
        }
        self.shared.lock().unwrap().running = !cork;
        Ok(())
    }

    fn arm_timer(&mut self) -> Result<()> {
        let (Some(progress), Some(params)) = (self.progress.clone(), self.params) else {
            return Ok(());
        };
        let shared = self.shared.clone();
        self.timer.start(params.period_duration()?, move || {
            let position = {
                let state = shared.lock().unwrap();
                if !state.running {
                    return;
                }
                state.transferred
            };
            progress(position);
        })
    }
}

impl PcmDevice for PulsePcm {
    fn open(&mut self, params: &PcmParams) -> Result<()> {
        params.validate()?;
        if self.params.is_some() {
            return Err(Error::AlreadyOpen);
        }
        sample_format(params.format)?;
        debug!("pulse open {:?}", params);

        self.connect()?;
        let connection = self.connection.as_ref().ok_or(Error::NotOpen)?;
        let stream = {
            let lock = LoopLock::new(&connection.mainloop);
            self.new_stream(&lock, &connection.context, params)
        };

        self.stream = Some(stream?);
        self.pending.clear();
        // The stream plays once the server buffer is filled.
        *self.shared.lock().unwrap() = PulseShared {
            running: self.config.direction == Direction::Playback,
            ..PulseShared::default()
        };
        self.params = Some(*params);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.timer.stop();
        self.params = None;
        self.pending.clear();
        let running = std::mem::take(&mut *self.shared.lock().unwrap()).running;
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        debug!("pulse close");
        if let Some(connection) = self.connection.as_ref() {
            let lock = LoopLock::new(&connection.mainloop);
            // A corked stream never drains.
            if running && self.config.direction == Direction::Playback {
                let mut op = stream.drain(signal_done(&connection.mainloop));
                if let Err(err) = wait_operation(&lock, &connection.context, &stream, &mut op) {
                    debug!("could not drain pulse stream: {}", err);
                }
            }
            if let Err(err) = stream.disconnect() {
                log::error!("could not disconnect stream: {:?}", err);
            }
            stream.set_state_callback(None);
            stream.set_latency_update_callback(None);
            stream.set_write_callback(None);
            stream.set_read_callback(None);
            drop(stream);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_direction("read", Direction::Capture)?;
        let frame_size = self.params.ok_or(Error::NotOpen)?.frame_size()? as usize;
        let (Some(connection), Some(stream)) = (self.connection.as_ref(), self.stream.as_mut())
        else {
            return Err(Error::NotOpen);
        };
        let pending = &mut self.pending;
        let context = &connection.context;
        let len = buf.len();
        {
            let lock = LoopLock::new(&connection.mainloop);
            transfer_all(
                len,
                frame_size,
                |offset| {
                    let deadline = Instant::now() + STREAM_WAIT_TIMEOUT;
                    while pending.len() < frame_size {
                        if let Err(err) = check_status(context, stream) {
                            return Transfer::Failed(err);
                        }
                        match stream.peek() {
                            Err(err) => return Transfer::Failed(pa_error("pa_stream_peek")(err)),
                            Ok(PeekResult::Empty) => {
                                if Instant::now() >= deadline {
                                    log::error!("capture stream timed out waiting for the server");
                                    return Transfer::Failed(Error::Timeout);
                                }
                                lock.wait();
                                continue;
                            }
                            Ok(PeekResult::Hole(size)) => {
                                log::trace!("skipping a {} bytes capture hole", size);
                            }
                            Ok(PeekResult::Data(data)) => pending.extend_from_slice(data),
                        }
                        if let Err(err) = stream.discard() {
                            return Transfer::Failed(pa_error("pa_stream_drop")(err));
                        }
                    }
                    let count = pending.len().min(len - offset);
                    let count = count - count % frame_size;
                    buf[offset..offset + count].copy_from_slice(&pending[..count]);
                    pending.drain(..count);
                    Transfer::Frames(count / frame_size)
                },
                || Ok(()),
            )?;
        }
        self.shared.lock().unwrap().transferred += len as u64;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_direction("write", Direction::Playback)?;
        let frame_size = self.params.ok_or(Error::NotOpen)?.frame_size()? as usize;
        let (Some(connection), Some(stream)) = (self.connection.as_ref(), self.stream.as_mut())
        else {
            return Err(Error::NotOpen);
        };
        let context = &connection.context;
        {
            let lock = LoopLock::new(&connection.mainloop);
            transfer_all(
                buf.len(),
                frame_size,
                |offset| {
                    let deadline = Instant::now() + STREAM_WAIT_TIMEOUT;
                    loop {
                        if let Err(err) = check_status(context, stream) {
                            return Transfer::Failed(err);
                        }
                        match stream.writable_size() {
                            None => {
                                return Transfer::Failed(context_error(
                                    context,
                                    "pa_stream_writable_size",
                                ))
                            }
                            Some(size) if size >= frame_size => {
                                let count = size.min(buf.len() - offset);
                                let count = count - count % frame_size;
                                if let Err(err) = stream.write(
                                    &buf[offset..offset + count],
                                    None,
                                    0,
                                    SeekMode::Relative,
                                ) {
                                    return Transfer::Failed(pa_error("pa_stream_write")(err));
                                }
                                return Transfer::Frames(count / frame_size);
                            }
                            Some(_) if Instant::now() >= deadline => {
                                log::error!("playback stream timed out waiting for the server");
                                return Transfer::Failed(Error::Timeout);
                            }
                            Some(_) => lock.wait(),
                        }
                    }
                },
                || Ok(()),
            )?;
        }
        self.shared.lock().unwrap().transferred += buf.len() as u64;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        debug!("pulse start");
        self.cork(false, false)?;
        self.arm_timer()
    }

    fn stop(&mut self) -> Result<()> {
        debug!("pulse stop");
        self.timer.stop();
        self.cork(true, true)?;
        self.pending.clear();
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        debug!("pulse pause");
        self.timer.stop();
        self.cork(true, false)
    }

    fn resume(&mut self) -> Result<()> {
        debug!("pulse resume");
        self.cork(false, false)?;
        self.arm_timer()
    }

    fn query_hw_ranges(&mut self, req: &PcmParamRanges) -> Result<PcmParamRanges> {
        Ok(super::narrow_ranges(req, &native_ranges()))
    }

    fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    fn hw_params(&self) -> Option<PcmParams> {
        self.params
    }

    fn direction(&self) -> Direction {
        self.config.direction
    }

    #[cfg(test)]
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Drop for PulsePcm {
    fn drop(&mut self) {
        _ = self.close();
        self.connection.take();
    }
}
