/// Alsa backend
//
// Manos Pitsidianakis <manos.pitsidianakis@linaro.org>
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
use std::sync::{Arc, Mutex};

use alsa::{
    pcm::{Access, Format, HwParams, State, PCM},
    ValueOr,
};

use super::{
    transfer_all, ParamRange, PcmDevice, PcmDeviceConfig, PcmFormat, PcmParamRanges, PcmParams,
    ProgressCallback, Transfer,
};
use crate::{timer::PositionTimer, Direction, Error, Result};

impl From<Direction> for alsa::Direction {
    fn from(val: Direction) -> Self {
        match val {
            Direction::Playback => Self::Playback,
            Direction::Capture => Self::Capture,
        }
    }
}

impl From<PcmFormat> for Format {
    fn from(val: PcmFormat) -> Self {
        match val {
            PcmFormat::S8 => Self::S8,
            PcmFormat::U8 => Self::U8,
            PcmFormat::S16Le => Self::S16LE,
            PcmFormat::S16Be => Self::S16BE,
            PcmFormat::U16Le => Self::U16LE,
            PcmFormat::U16Be => Self::U16BE,
            PcmFormat::S24Le => Self::S24LE,
            PcmFormat::S24Be => Self::S24BE,
            PcmFormat::U24Le => Self::U24LE,
            PcmFormat::U24Be => Self::U24BE,
            PcmFormat::S32Le => Self::S32LE,
            PcmFormat::S32Be => Self::S32BE,
            PcmFormat::U32Le => Self::U32LE,
            PcmFormat::U32Be => Self::U32BE,
            PcmFormat::F32Le => Self::FloatLE,
            PcmFormat::F32Be => Self::FloatBE,
            PcmFormat::F64Le => Self::Float64LE,
            PcmFormat::F64Be => Self::Float64BE,
            PcmFormat::Iec958SubframeLe => Self::IEC958SubframeLE,
            PcmFormat::Iec958SubframeBe => Self::IEC958SubframeBE,
            PcmFormat::MuLaw => Self::MuLaw,
            PcmFormat::ALaw => Self::ALaw,
            PcmFormat::ImaAdpcm => Self::ImaAdPCM,
            PcmFormat::Mpeg => Self::MPEG,
            PcmFormat::Gsm => Self::GSM,
        }
    }
}

type AResult<T> = std::result::Result<T, alsa::Error>;

fn alsa_error(op: &'static str) -> impl Fn(alsa::Error) -> Error {
    move |err| {
        log::error!("{}: {}", op, err);
        Error::AudioBackendErrno(op.to_string(), err.errno() as std::os::raw::c_int)
    }
}

fn clamp_frames(frames: alsa::pcm::Frames) -> u32 {
    u32::try_from(frames.max(0)).unwrap_or(u32::MAX)
}

#[derive(Default)]
struct AlsaState {
    pcm: Option<PCM>,
    params: Option<PcmParams>,
    /// Bytes handed to or taken from ALSA since open
    transferred: u64,
    running: bool,
}

impl AlsaState {
    fn position(&self, direction: Direction) -> Option<u64> {
        let (pcm, params) = (self.pcm.as_ref()?, self.params?);
        let frame_size = u64::from(params.frame_size().ok()?);
        let delay = match pcm.delay() {
            Ok(frames) => u64::try_from(frames.max(0)).unwrap_or_default() * frame_size,
            Err(err) => {
                log::trace!("could not query the pcm delay: {}", err);
                0
            }
        };
        Some(match direction {
            Direction::Playback => self.transferred.saturating_sub(delay),
            Direction::Capture => self.transferred + delay,
        })
    }
}

/// Negotiate the hardware parameters and return the ones ALSA settled on.
fn configure_pcm(pcm: &PCM, params: &PcmParams) -> Result<PcmParams> {
    let frame_size = params.frame_size()?;
    let buffer_frames = alsa::pcm::Frames::from(params.buffer_frames()?);
    let period_frames = alsa::pcm::Frames::from(params.period_frames()?);
    let achieved = || -> AResult<PcmParams> {
        {
            let hwp = HwParams::any(pcm)?;
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_format(params.format.into())?;
            hwp.set_rate_near(params.rate, ValueOr::Nearest)?;
            hwp.set_channels(params.channels.into())?;
            hwp.set_buffer_size_near(buffer_frames)?;
            hwp.set_period_size_near(period_frames, ValueOr::Nearest)?;
            pcm.hw_params(&hwp)?;
        }
        let hwp = pcm.hw_params_current()?;
        let buffer_frames = hwp.get_buffer_size()?;
        // Only start on an explicit trigger, unless the guest fills the whole
        // buffer first.
        let swp = pcm.sw_params_current()?;
        swp.set_start_threshold(buffer_frames)?;
        pcm.sw_params(&swp)?;
        Ok(PcmParams {
            rate: hwp.get_rate()?,
            format: params.format,
            channels: u8::try_from(hwp.get_channels()?).unwrap_or(params.channels),
            buffer_size: clamp_frames(buffer_frames) * frame_size,
            period_size: clamp_frames(hwp.get_period_size()?) * frame_size,
        })
    };
    achieved().map_err(alsa_error("snd_pcm_hw_params"))
}

/// Capabilities of `pcm`, regardless of its current configuration.
fn native_ranges(pcm: &PCM) -> AResult<PcmParamRanges> {
    let hwp = HwParams::any(pcm)?;
    let formats = PcmFormat::ALL
        .iter()
        .filter(|format| hwp.test_format((**format).into()).is_ok())
        .fold(0, |mask, format| mask | format.mask());
    Ok(PcmParamRanges {
        formats,
        rates: ParamRange::new(hwp.get_rate_min()?, hwp.get_rate_max()?),
        channels: ParamRange::new(hwp.get_channels_min()?, hwp.get_channels_max()?),
        buffer: ParamRange::new(
            clamp_frames(hwp.get_buffer_size_min()?),
            clamp_frames(hwp.get_buffer_size_max()?),
        ),
        period: ParamRange::new(
            clamp_frames(hwp.get_period_size_min()?),
            clamp_frames(hwp.get_period_size_max()?),
        ),
    })
}

fn write_frames(pcm: &PCM, buf: &[u8], frame_size: usize) -> Result<()> {
    let io = pcm.io_bytes();
    transfer_all(
        buf.len(),
        frame_size,
        |offset| match io.writei(&buf[offset..]) {
            Ok(frames) => Transfer::Frames(frames),
            Err(err) if err.errno() == libc::EPIPE => Transfer::Xrun,
            Err(err) => Transfer::Failed(alsa_error("snd_pcm_writei")(err)),
        },
        || pcm.prepare().map_err(alsa_error("snd_pcm_prepare")),
    )
}

/// A capture xrun stops the stream, so a running one is restarted after
/// recovery.
fn read_frames(pcm: &PCM, buf: &mut [u8], frame_size: usize, running: bool) -> Result<()> {
    let io = pcm.io_bytes();
    transfer_all(
        buf.len(),
        frame_size,
        |offset| match io.readi(&mut buf[offset..]) {
            Ok(frames) => Transfer::Frames(frames),
            Err(err) if err.errno() == libc::EPIPE => Transfer::Xrun,
            Err(err) => Transfer::Failed(alsa_error("snd_pcm_readi")(err)),
        },
        || {
            pcm.prepare().map_err(alsa_error("snd_pcm_prepare"))?;
            if running {
                pcm.start().map_err(alsa_error("snd_pcm_start"))?;
            }
            Ok(())
        },
    )
}

/// A stream on an ALSA PCM device, using blocking interleaved transfers.
pub struct AlsaPcm {
    direction: Direction,
    device_name: String,
    state: Arc<Mutex<AlsaState>>,
    timer: PositionTimer,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for AlsaPcm {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(AlsaPcm))
            .field("direction", &self.direction)
            .field("device_name", &self.device_name)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl AlsaPcm {
    pub fn new(config: PcmDeviceConfig) -> Self {
        let device_name = if config.device_name.is_empty() {
            "default".to_string()
        } else {
            config.device_name
        };
        Self {
            direction: config.direction,
            timer: PositionTimer::new(format!("alsa-{}", config.direction)),
            device_name,
            state: Arc::new(Mutex::new(AlsaState::default())),
            progress: None,
        }
    }

    fn new_pcm(&self) -> Result<PCM> {
        PCM::new(&self.device_name, self.direction.into(), false).map_err(|err| {
            log::error!("could not open pcm device {}: {}", self.device_name, err);
            Error::AudioBackendErrno(
                format!("snd_pcm_open {}", self.device_name),
                err.errno() as std::os::raw::c_int,
            )
        })
    }

    fn check_direction(&self, op: &'static str, direction: Direction) -> Result<()> {
        if self.direction == direction {
            Ok(())
        } else {
            Err(Error::WrongDirection(op, self.direction))
        }
    }

    fn arm_timer(&mut self) -> Result<()> {
        let Some(progress) = self.progress.clone() else {
            return Ok(());
        };
        let period = {
            let state = self.state.lock().unwrap();
            state.params.ok_or(Error::NotOpen)?.period_duration()?
        };
        let state = self.state.clone();
        let direction = self.direction;
        self.timer.start(period, move || {
            let position = {
                let state = state.lock().unwrap();
                if !state.running {
                    return;
                }
                state.position(direction)
            };
            if let Some(position) = position {
                progress(position);
            }
        })
    }
}

impl PcmDevice for AlsaPcm {
    fn open(&mut self, params: &PcmParams) -> Result<()> {
        params.validate()?;
        if self.is_open() {
            return Err(Error::AlreadyOpen);
        }
        log::debug!("open pcm device {}: {:?}", self.device_name, params);
        // The handle is closed when dropped on failure.
        let pcm = self.new_pcm()?;
        let achieved = configure_pcm(&pcm, params)?;
        pcm.prepare().map_err(alsa_error("snd_pcm_prepare"))?;
        if achieved != *params {
            log::debug!(
                "pcm device {} settled on {:?}",
                self.device_name,
                achieved
            );
        }
        *self.state.lock().unwrap() = AlsaState {
            pcm: Some(pcm),
            params: Some(achieved),
            ..AlsaState::default()
        };
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.timer.stop();
        let Some(pcm) = ({
            let mut state = self.state.lock().unwrap();
            let pcm = state.pcm.take();
            *state = AlsaState::default();
            pcm
        }) else {
            return Ok(());
        };
        log::debug!("close pcm device {}", self.device_name);
        if self.direction == Direction::Playback {
            if let Err(err) = pcm.drain() {
                log::debug!("could not drain pcm device {}: {}", self.device_name, err);
            }
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.check_direction("read", Direction::Capture)?;
        let mut state = self.state.lock().unwrap();
        let frame_size = state.params.ok_or(Error::NotOpen)?.frame_size()? as usize;
        let pcm = state.pcm.as_ref().ok_or(Error::NotOpen)?;
        read_frames(pcm, buf, frame_size, state.running)?;
        state.transferred += buf.len() as u64;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_direction("write", Direction::Playback)?;
        let mut state = self.state.lock().unwrap();
        let frame_size = state.params.ok_or(Error::NotOpen)?.frame_size()? as usize;
        let pcm = state.pcm.as_ref().ok_or(Error::NotOpen)?;
        write_frames(pcm, buf, frame_size)?;
        state.transferred += buf.len() as u64;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            let pcm = state.pcm.as_ref().ok_or(Error::NotOpen)?;
            // A full buffer may have started the stream already.
            if pcm.state() != State::Running {
                pcm.start().map_err(alsa_error("snd_pcm_start"))?;
            }
            state.running = true;
        }
        self.arm_timer()
    }

    fn stop(&mut self) -> Result<()> {
        self.timer.stop();
        let mut state = self.state.lock().unwrap();
        let pcm = state.pcm.as_ref().ok_or(Error::NotOpen)?;
        pcm.drop().map_err(alsa_error("snd_pcm_drop"))?;
        pcm.prepare().map_err(alsa_error("snd_pcm_prepare"))?;
        state.running = false;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        let can_pause = {
            let state = self.state.lock().unwrap();
            let pcm = state.pcm.as_ref().ok_or(Error::NotOpen)?;
            pcm.hw_params_current()
                .map(|hwp| hwp.can_pause())
                .unwrap_or(false)
        };
        if !can_pause {
            log::debug!(
                "pcm device {} can not pause, stopping instead",
                self.device_name
            );
            return self.stop();
        }
        self.timer.stop();
        let mut state = self.state.lock().unwrap();
        let pcm = state.pcm.as_ref().ok_or(Error::NotOpen)?;
        pcm.pause(true).map_err(alsa_error("snd_pcm_pause"))?;
        state.running = false;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let paused = {
            let state = self.state.lock().unwrap();
            state.pcm.as_ref().ok_or(Error::NotOpen)?.state() == State::Paused
        };
        if !paused {
            return self.start();
        }
        {
            let mut state = self.state.lock().unwrap();
            let pcm = state.pcm.as_ref().ok_or(Error::NotOpen)?;
            pcm.pause(false).map_err(alsa_error("snd_pcm_pause"))?;
            state.running = true;
        }
        self.arm_timer()
    }

    fn query_hw_ranges(&mut self, req: &PcmParamRanges) -> Result<PcmParamRanges> {
        let native = {
            let state = self.state.lock().unwrap();
            match state.pcm.as_ref() {
                Some(pcm) => native_ranges(pcm),
                None => native_ranges(&self.new_pcm()?),
            }
        }
        .map_err(alsa_error("snd_pcm_hw_params_any"))?;
        log::trace!("pcm device {} supports {:?}", self.device_name, native);
        Ok(super::narrow_ranges(req, &native))
    }

    fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    fn hw_params(&self) -> Option<PcmParams> {
        self.state.lock().unwrap().params
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    #[cfg(test)]
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Drop for AlsaPcm {
    fn drop(&mut self) {
        _ = self.close();
    }
}

#[cfg(test)]
/// Utilities for temporarily setting a test-specific alsa config.
pub mod test_utils;
