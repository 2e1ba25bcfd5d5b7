// Pipewire backend device
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{io::Cursor, time::Duration};

use log::debug;
use pw::{
    context::Context, core::Core, properties::properties, spa, stream::StreamFlags,
    thread_loop::ThreadLoop,
};
use spa::{
    param::audio::{AudioFormat, AudioInfoRaw},
    pod::{serialize::PodSerializer, Object, Pod, Value},
    sys::{
        SPA_PARAM_EnumFormat, SPA_TYPE_OBJECT_Format, SPA_AUDIO_CHANNEL_FC, SPA_AUDIO_CHANNEL_FL,
        SPA_AUDIO_CHANNEL_FR, SPA_AUDIO_CHANNEL_LFE, SPA_AUDIO_CHANNEL_MONO, SPA_AUDIO_CHANNEL_RL,
        SPA_AUDIO_CHANNEL_RR, SPA_AUDIO_CHANNEL_SL, SPA_AUDIO_CHANNEL_SR,
        SPA_AUDIO_CHANNEL_UNKNOWN, SPA_AUDIO_FORMAT_ALAW, SPA_AUDIO_FORMAT_F32_BE,
        SPA_AUDIO_FORMAT_F32_LE, SPA_AUDIO_FORMAT_S16_BE, SPA_AUDIO_FORMAT_S16_LE,
        SPA_AUDIO_FORMAT_S24_32_BE, SPA_AUDIO_FORMAT_S24_32_LE, SPA_AUDIO_FORMAT_S32_BE,
        SPA_AUDIO_FORMAT_S32_LE, SPA_AUDIO_FORMAT_U8, SPA_AUDIO_FORMAT_ULAW,
        SPA_AUDIO_MAX_CHANNELS,
    },
};

use super::{
    ParamRange, PcmDevice, PcmDeviceConfig, PcmFormat, PcmParamRanges, PcmParams,
    ProgressCallback,
};
use crate::{
    ring_buffer::{self, shared_ring, ByteRing, SharedRing},
    timer::PositionTimer,
    Direction, Error, Result,
};

/// Longest a transfer waits for the graph to make room or provide data.
const RING_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

fn audio_format(format: PcmFormat) -> Result<AudioFormat> {
    let raw = match format {
        PcmFormat::U8 => SPA_AUDIO_FORMAT_U8,
        PcmFormat::S16Le => SPA_AUDIO_FORMAT_S16_LE,
        PcmFormat::S16Be => SPA_AUDIO_FORMAT_S16_BE,
        PcmFormat::S24Le => SPA_AUDIO_FORMAT_S24_32_LE,
        PcmFormat::S24Be => SPA_AUDIO_FORMAT_S24_32_BE,
        PcmFormat::S32Le => SPA_AUDIO_FORMAT_S32_LE,
        PcmFormat::S32Be => SPA_AUDIO_FORMAT_S32_BE,
        PcmFormat::ALaw => SPA_AUDIO_FORMAT_ALAW,
        PcmFormat::MuLaw => SPA_AUDIO_FORMAT_ULAW,
        PcmFormat::F32Le => SPA_AUDIO_FORMAT_F32_LE,
        PcmFormat::F32Be => SPA_AUDIO_FORMAT_F32_BE,
        other => return Err(Error::InvalidFormat(other as u8)),
    };
    Ok(AudioFormat::from_raw(raw))
}

fn channel_positions(channels: u8) -> [u32; SPA_AUDIO_MAX_CHANNELS as usize] {
    let mut pos = [SPA_AUDIO_CHANNEL_UNKNOWN; SPA_AUDIO_MAX_CHANNELS as usize];
    let layout: &[u32] = match channels {
        1 => &[SPA_AUDIO_CHANNEL_MONO],
        _ => &[
            SPA_AUDIO_CHANNEL_FL,
            SPA_AUDIO_CHANNEL_FR,
            SPA_AUDIO_CHANNEL_FC,
            SPA_AUDIO_CHANNEL_LFE,
            SPA_AUDIO_CHANNEL_RL,
            SPA_AUDIO_CHANNEL_RR,
            SPA_AUDIO_CHANNEL_SL,
            SPA_AUDIO_CHANNEL_SR,
        ],
    };
    for (slot, channel) in pos
        .iter_mut()
        .zip(layout.iter())
        .take(usize::from(channels))
    {
        *slot = *channel;
    }
    pos
}

fn native_ranges() -> PcmParamRanges {
    PcmParamRanges {
        formats: PcmFormat::ALL
            .iter()
            .filter(|format| audio_format(**format).is_ok())
            .fold(0, |mask, format| mask | format.mask()),
        rates: ParamRange::new(8000, 384000),
        channels: ParamRange::new(1, SPA_AUDIO_MAX_CHANNELS),
        buffer: ParamRange::new(64, 1 << 20),
        period: ParamRange::new(32, 1 << 19),
    }
}

fn pw_error(op: &'static str) -> impl Fn(pw::Error) -> Error {
    move |err| {
        log::error!("{}: {}", op, err);
        Error::UnexpectedAudioBackendError(format!("{op}: {err}"))
    }
}

struct PwConnection {
    core: Core,
    _context: Context,
    thread_loop: ThreadLoop,
}

struct PwStream {
    stream: pw::stream::Stream,
    _listener: pw::stream::StreamListener<()>,
}

/// A stream of the PipeWire graph. The daemon is contacted on the first open
/// and the connection is kept until the device is dropped.
pub struct PwPcm {
    config: PcmDeviceConfig,
    params: Option<PcmParams>,
    // Declared before `connection` so it is released first.
    stream: Option<PwStream>,
    connection: Option<PwConnection>,
    shared: SharedRing,
    timer: PositionTimer,
    progress: Option<ProgressCallback>,
}

// SAFETY: Safe as the PipeWire objects are only used with the thread loop
// lock held, and the callback only touches the locked shared state.
unsafe impl Send for PwPcm {}

impl std::fmt::Debug for PwPcm {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(PwPcm))
            .field("config", &self.config)
            .field("params", &self.params)
            .field("connected", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

impl PwPcm {
    pub fn new(config: PcmDeviceConfig) -> Self {
        Self {
            timer: PositionTimer::new(format!("pw-{}", config.direction)),
            config,
            params: None,
            stream: None,
            connection: None,
            shared: shared_ring(config.ring_buffer_size),
            progress: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.connection.is_none() {
            pw::init();
            let thread_loop = unsafe { ThreadLoop::new(Some("Pipewire thread loop"), None) }
                .map_err(pw_error("pw_thread_loop_new"))?;
            let lock_guard = thread_loop.lock();
            let context = Context::new(&thread_loop).map_err(pw_error("pw_context_new"))?;
            thread_loop.start();
            let core = context
                .connect(None)
                .map_err(pw_error("pw_context_connect"))?;

            // Create new reference for the variable so that it can be moved into the
            // closure.
            let thread_clone = thread_loop.clone();

            // The answer is only processed once we wait on the loop, so the
            // listener can be registered after the sync.
            let pending = core.sync(0).map_err(pw_error("pw_core_sync"))?;
            let _listener_core = core
                .add_listener_local()
                .done(move |id, seq| {
                    if id == pw::sys::PW_ID_CORE && seq == pending {
                        thread_clone.signal(false);
                    }
                })
                .register();

            thread_loop.wait();
            lock_guard.unlock();
            log::trace!("pipewire connection established");

            self.connection = Some(PwConnection {
                core,
                _context: context,
                thread_loop,
            });
        }
        Ok(())
    }

    fn check_direction(&self, op: &'static str, direction: Direction) -> Result<()> {
        if self.config.direction == direction {
            Ok(())
        } else {
            Err(Error::WrongDirection(op, self.config.direction))
        }
    }

    fn set_active(&self, active: bool) -> Result<()> {
        let (Some(connection), Some(stream)) = (self.connection.as_ref(), self.stream.as_ref())
        else {
            return Err(Error::NotOpen);
        };
        let lock_guard = connection.thread_loop.lock();
        stream
            .stream
            .set_active(active)
            .map_err(pw_error("pw_stream_set_active"))?;
        lock_guard.unlock();
        let (lock, cvar) = &*self.shared;
        lock.lock().unwrap().running = active;
        cvar.notify_all();
        Ok(())
    }

    fn arm_timer(&mut self) -> Result<()> {
        let (Some(progress), Some(params)) = (self.progress.clone(), self.params) else {
            return Ok(());
        };
        let shared = self.shared.clone();
        self.timer.start(params.period_duration()?, move || {
            let position = {
                let state = shared.0.lock().unwrap();
                if !state.running {
                    return;
                }
                state.processed
            };
            progress(position);
        })
    }

    fn new_stream(&self, connection: &PwConnection, params: &PcmParams) -> Result<PwStream> {
        let frame_size = params.frame_size()?;
        let mut audio_info = AudioInfoRaw::new();
        audio_info.set_format(audio_format(params.format)?);
        audio_info.set_rate(params.rate);
        audio_info.set_channels(params.channels.into());
        audio_info.set_position(channel_positions(params.channels));

        let values: Vec<u8> = PodSerializer::serialize(
            Cursor::new(Vec::new()),
            &Value::Object(Object {
                type_: SPA_TYPE_OBJECT_Format,
                id: SPA_PARAM_EnumFormat,
                properties: audio_info.into(),
            }),
        )
        .map_err(|err| {
            Error::UnexpectedAudioBackendError(format!("could not serialize format: {err:?}"))
        })?
        .0
        .into_inner();
        let mut param = [Pod::from_bytes(&values).ok_or_else(|| {
            Error::UnexpectedAudioBackendError("invalid format pod".to_string())
        })?];

        let (category, pw_direction) = match self.config.direction {
            Direction::Playback => ("Playback", spa::utils::Direction::Output),
            Direction::Capture => ("Capture", spa::utils::Direction::Input),
        };
        let mut props = properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_CATEGORY => category,
            *pw::keys::NODE_LATENCY => format!("{}/{}", params.period_frames()?, params.rate),
        };
        if !self.config.prop_name.is_empty() {
            props.insert(
                self.config.prop_name.clone(),
                self.config.prop_value.clone(),
            );
        }

        let stream = pw::stream::Stream::new(&connection.core, "xen-sound", props)
            .map_err(pw_error("pw_stream_new"))?;

        let shared = self.shared.clone();
        let direction = self.config.direction;
        let listener = stream
            .add_local_listener_with_user_data(())
            .state_changed(|_, _, old, new| {
                debug!("State changed: {:?} -> {:?}", old, new);
            })
            .process(move |stream, _| {
                let Some(mut buffer) = stream.dequeue_buffer() else {
                    debug!("No buffer received");
                    return;
                };
                let datas = buffer.datas_mut();
                let data = &mut datas[0];
                match direction {
                    Direction::Playback => {
                        let n_bytes = if let Some(slice) = data.data() {
                            let n_bytes = slice.len() - slice.len() % frame_size as usize;
                            ring_buffer::fill_playback(&shared, &mut slice[..n_bytes]);
                            n_bytes
                        } else {
                            0
                        };
                        let chunk = data.chunk_mut();
                        *chunk.offset_mut() = 0;
                        *chunk.stride_mut() = frame_size as _;
                        *chunk.size_mut() = n_bytes as _;
                    }
                    Direction::Capture => {
                        let (offset, size) = {
                            let chunk = data.chunk();
                            (chunk.offset() as usize, chunk.size() as usize)
                        };
                        if let Some(slice) = data.data() {
                            let end = (offset + size).min(slice.len());
                            ring_buffer::drain_capture(&shared, &slice[offset.min(end)..end]);
                        }
                    }
                }
            })
            .register()
            .map_err(pw_error("pw_stream_add_listener"))?;

        stream
            .connect(
                pw_direction,
                Some(pw::constants::ID_ANY),
                StreamFlags::RT_PROCESS
                    | StreamFlags::AUTOCONNECT
                    | StreamFlags::INACTIVE
                    | StreamFlags::MAP_BUFFERS,
                &mut param,
            )
            .map_err(pw_error("pw_stream_connect"))?;

        Ok(PwStream {
            stream,
            _listener: listener,
        })
    }
}

impl PcmDevice for PwPcm {
    fn open(&mut self, params: &PcmParams) -> Result<()> {
        params.validate()?;
        if self.params.is_some() {
            return Err(Error::AlreadyOpen);
        }
        audio_format(params.format)?;
        debug!("pipewire open {:?}", params);

        {
            let (lock, _) = &*self.shared;
            let mut state = lock.lock().unwrap();
            let capacity = self.config.ring_buffer_size.max(params.buffer_size);
            if state.ring.capacity() != capacity as usize {
                state.ring = ByteRing::new(capacity);
            }
            state.ring.clear();
            state.processed = 0;
            state.running = false;
        }

        self.connect()?;
        let connection = self.connection.as_ref().ok_or(Error::NotOpen)?;
        let lock_guard = connection.thread_loop.lock();
        let stream = self.new_stream(connection, params);
        lock_guard.unlock();

        self.stream = Some(stream?);
        self.params = Some(*params);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.timer.stop();
        self.params = None;
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        debug!("pipewire close");
        if let Some(connection) = self.connection.as_ref() {
            let lock_guard = connection.thread_loop.lock();
            if let Err(err) = stream.stream.disconnect() {
                log::error!("could not disconnect stream: {}", err);
            }
            drop(stream);
            lock_guard.unlock();
        }
        let (lock, cvar) = &*self.shared;
        {
            let mut state = lock.lock().unwrap();
            state.ring.clear();
            state.running = false;
        }
        cvar.notify_all();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_direction("read", Direction::Capture)?;
        let frame_size = self.params.ok_or(Error::NotOpen)?.frame_size()? as usize;
        ring_buffer::read_exact(&self.shared, buf, frame_size, RING_WAIT_TIMEOUT)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_direction("write", Direction::Playback)?;
        let frame_size = self.params.ok_or(Error::NotOpen)?.frame_size()? as usize;
        ring_buffer::write_all(&self.shared, buf, frame_size, RING_WAIT_TIMEOUT)
    }

    fn start(&mut self) -> Result<()> {
        debug!("pipewire start");
        self.set_active(true)?;
        self.arm_timer()
    }

    fn stop(&mut self) -> Result<()> {
        debug!("pipewire stop");
        self.timer.stop();
        self.set_active(false)?;
        self.shared.0.lock().unwrap().ring.clear();
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        debug!("pipewire pause");
        self.timer.stop();
        self.set_active(false)
    }

    fn resume(&mut self) -> Result<()> {
        debug!("pipewire resume");
        self.set_active(true)?;
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

impl Drop for PwPcm {
    fn drop(&mut self) {
        _ = self.close();
        if let Some(connection) = self.connection.take() {
            connection.thread_loop.stop();
        }
    }
}
