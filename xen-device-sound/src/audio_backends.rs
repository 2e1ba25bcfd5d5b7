// Manos Pitsidianakis <manos.pitsidianakis@linaro.org>
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
mod alsa;
mod null;

#[cfg(all(feature = "pw-backend", target_env = "gnu"))]
mod pipewire;
#[cfg(all(feature = "pulse-backend", target_env = "gnu"))]
mod pulse;

use std::{convert::TryFrom, sync::Arc, time::Duration};

#[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
use self::alsa::AlsaPcm;
use self::null::NullPcm;
#[cfg(all(feature = "pw-backend", target_env = "gnu"))]
use self::pipewire::PwPcm;
#[cfg(all(feature = "pulse-backend", target_env = "gnu"))]
use self::pulse::PulsePcm;
use crate::{
    sndif::{self, XenSndQueryHwParam, XenSndRange},
    BackendType, Direction, Error, Result,
};

/// Bound on the xrun recoveries a single read or write may perform.
pub const MAX_XRUN_RECOVERIES: u32 = 3;

/// Sample formats of the sound interface, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PcmFormat {
    S8 = sndif::XENSND_PCM_FORMAT_S8,
    U8 = sndif::XENSND_PCM_FORMAT_U8,
    S16Le = sndif::XENSND_PCM_FORMAT_S16_LE,
    S16Be = sndif::XENSND_PCM_FORMAT_S16_BE,
    U16Le = sndif::XENSND_PCM_FORMAT_U16_LE,
    U16Be = sndif::XENSND_PCM_FORMAT_U16_BE,
    S24Le = sndif::XENSND_PCM_FORMAT_S24_LE,
    S24Be = sndif::XENSND_PCM_FORMAT_S24_BE,
    U24Le = sndif::XENSND_PCM_FORMAT_U24_LE,
    U24Be = sndif::XENSND_PCM_FORMAT_U24_BE,
    S32Le = sndif::XENSND_PCM_FORMAT_S32_LE,
    S32Be = sndif::XENSND_PCM_FORMAT_S32_BE,
    U32Le = sndif::XENSND_PCM_FORMAT_U32_LE,
    U32Be = sndif::XENSND_PCM_FORMAT_U32_BE,
    F32Le = sndif::XENSND_PCM_FORMAT_F32_LE,
    F32Be = sndif::XENSND_PCM_FORMAT_F32_BE,
    F64Le = sndif::XENSND_PCM_FORMAT_F64_LE,
    F64Be = sndif::XENSND_PCM_FORMAT_F64_BE,
    Iec958SubframeLe = sndif::XENSND_PCM_FORMAT_IEC958_SUBFRAME_LE,
    Iec958SubframeBe = sndif::XENSND_PCM_FORMAT_IEC958_SUBFRAME_BE,
    MuLaw = sndif::XENSND_PCM_FORMAT_MU_LAW,
    ALaw = sndif::XENSND_PCM_FORMAT_A_LAW,
    ImaAdpcm = sndif::XENSND_PCM_FORMAT_IMA_ADPCM,
    Mpeg = sndif::XENSND_PCM_FORMAT_MPEG,
    Gsm = sndif::XENSND_PCM_FORMAT_GSM,
}

impl PcmFormat {
    pub const ALL: [Self; 25] = [
        Self::S8,
        Self::U8,
        Self::S16Le,
        Self::S16Be,
        Self::U16Le,
        Self::U16Be,
        Self::S24Le,
        Self::S24Be,
        Self::U24Le,
        Self::U24Be,
        Self::S32Le,
        Self::S32Be,
        Self::U32Le,
        Self::U32Be,
        Self::F32Le,
        Self::F32Be,
        Self::F64Le,
        Self::F64Be,
        Self::Iec958SubframeLe,
        Self::Iec958SubframeBe,
        Self::MuLaw,
        Self::ALaw,
        Self::ImaAdpcm,
        Self::Mpeg,
        Self::Gsm,
    ];

    /// Bit of this format in a query format mask.
    pub const fn mask(self) -> u64 {
        1 << self as u8
    }

    /// Bytes per sample, `None` for formats without a fixed sample width.
    ///
    /// 24 bit formats are stored in a 4 byte container.
    pub const fn bytes_per_sample(self) -> Option<u32> {
        match self {
            Self::S8 | Self::U8 | Self::MuLaw | Self::ALaw => Some(1),
            Self::S16Le | Self::S16Be | Self::U16Le | Self::U16Be => Some(2),
            Self::S24Le
            | Self::S24Be
            | Self::U24Le
            | Self::U24Be
            | Self::S32Le
            | Self::S32Be
            | Self::U32Le
            | Self::U32Be
            | Self::F32Le
            | Self::F32Be
            | Self::Iec958SubframeLe
            | Self::Iec958SubframeBe => Some(4),
            Self::F64Le | Self::F64Be => Some(8),
            Self::ImaAdpcm | Self::Mpeg | Self::Gsm => None,
        }
    }

    /// Formats of `mask` in ascending wire order.
    pub fn from_mask(mask: u64) -> impl Iterator<Item = Self> {
        Self::ALL
            .into_iter()
            .filter(move |format| mask & format.mask() != 0)
    }
}

impl TryFrom<u8> for PcmFormat {
    type Error = Error;

    fn try_from(val: u8) -> std::result::Result<Self, Self::Error> {
        Self::ALL
            .get(usize::from(val))
            .copied()
            .ok_or(Error::InvalidFormat(val))
    }
}

/// Parameters of an open stream. Buffer and period sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmParams {
    pub rate: u32,
    pub format: PcmFormat,
    pub channels: u8,
    pub buffer_size: u32,
    pub period_size: u32,
}

impl PcmParams {
    pub fn frame_size(&self) -> Result<u32> {
        let bytes = self
            .format
            .bytes_per_sample()
            .ok_or(Error::InvalidFormat(self.format as u8))?;
        Ok(bytes * u32::from(self.channels))
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate == 0 {
            return Err(Error::InvalidParameter("rate must not be zero".to_string()));
        }
        if self.channels == 0 {
            return Err(Error::InvalidParameter(
                "channel count must not be zero".to_string(),
            ));
        }
        let frame_size = self.frame_size()?;
        if self.period_size < frame_size || self.period_size > self.buffer_size {
            return Err(Error::InvalidParameter(format!(
                "period of {} bytes does not fit a frame of {} bytes or the {} bytes buffer",
                self.period_size, frame_size, self.buffer_size
            )));
        }
        Ok(())
    }

    pub fn buffer_frames(&self) -> Result<u32> {
        Ok(self.buffer_size / self.frame_size()?)
    }

    pub fn period_frames(&self) -> Result<u32> {
        Ok(self.period_size / self.frame_size()?)
    }

    /// Time it takes to play one period, never less than a millisecond.
    pub fn period_duration(&self) -> Result<Duration> {
        let micros = u64::from(self.period_frames()?) * 1_000_000 / u64::from(self.rate.max(1));
        Ok(Duration::from_micros(micros.max(1000)))
    }
}

/// Closed interval of a hardware parameter.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ParamRange {
    pub min: u32,
    pub max: u32,
}

impl ParamRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// Overlap of both ranges, `None` when they are disjoint.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let min = self.min.max(other.min);
        let max = self.max.min(other.max);
        (min <= max).then_some(Self { min, max })
    }

    pub const fn contains(&self, other: &Self) -> bool {
        self.min <= other.min && other.max <= self.max
    }
}

impl From<XenSndRange> for ParamRange {
    fn from(val: XenSndRange) -> Self {
        Self::new(val.min.into(), val.max.into())
    }
}

impl From<ParamRange> for XenSndRange {
    fn from(val: ParamRange) -> Self {
        Self {
            min: val.min.into(),
            max: val.max.into(),
        }
    }
}

/// Hardware parameter space of `XENSND_OP_HW_PARAM_QUERY`. Buffer and period
/// ranges are in frames.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PcmParamRanges {
    pub formats: u64,
    pub rates: ParamRange,
    pub channels: ParamRange,
    pub buffer: ParamRange,
    pub period: ParamRange,
}

impl From<XenSndQueryHwParam> for PcmParamRanges {
    fn from(val: XenSndQueryHwParam) -> Self {
        Self {
            formats: val.formats.into(),
            rates: val.rates.into(),
            channels: val.channels.into(),
            buffer: val.buffer.into(),
            period: val.period.into(),
        }
    }
}

impl From<PcmParamRanges> for XenSndQueryHwParam {
    fn from(val: PcmParamRanges) -> Self {
        Self {
            formats: val.formats.into(),
            rates: val.rates.into(),
            channels: val.channels.into(),
            buffer: val.buffer.into(),
            period: val.period.into(),
        }
    }
}

fn narrow_range(name: &str, req: &ParamRange, native: &ParamRange) -> ParamRange {
    req.intersect(native).unwrap_or_else(|| {
        log::warn!(
            "could not narrow {} {:?} to {:?}, answering the hardware range",
            name,
            req,
            native
        );
        *native
    })
}

/// Narrow every dimension of `req` to what `native` supports. A dimension
/// that cannot be narrowed answers the native capability instead.
pub fn narrow_ranges(req: &PcmParamRanges, native: &PcmParamRanges) -> PcmParamRanges {
    let formats = match req.formats & native.formats {
        0 => {
            log::warn!(
                "none of the formats {:#x} are supported, answering {:#x}",
                req.formats,
                native.formats
            );
            native.formats
        }
        formats => formats,
    };
    PcmParamRanges {
        formats,
        rates: narrow_range("rates", &req.rates, &native.rates),
        channels: narrow_range("channels", &req.channels, &native.channels),
        buffer: narrow_range("buffer", &req.buffer, &native.buffer),
        period: narrow_range("period", &req.period, &native.period),
    }
}

/// Called with the stream position in bytes.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// A PCM stream of a host audio backend.
///
/// Transfers are all or nothing: `read` and `write` move the whole buffer or
/// fail.
pub trait PcmDevice: Send {
    /// Negotiate `params` with the backend. On failure the device stays
    /// closed.
    fn open(&mut self, params: &PcmParams) -> Result<()>;

    /// Drain, stop the position timer and release the backend. Closing a
    /// closed device does nothing.
    fn close(&mut self) -> Result<()>;

    fn read(&mut self, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Start the stream and arm the position timer.
    fn start(&mut self) -> Result<()>;

    /// Stop the stream, leaving it ready for another `start`.
    fn stop(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    fn query_hw_ranges(&mut self, req: &PcmParamRanges) -> Result<PcmParamRanges>;

    fn set_progress_callback(&mut self, callback: ProgressCallback);

    /// Parameters achieved by the backend, `None` while closed.
    fn hw_params(&self) -> Option<PcmParams>;

    fn is_open(&self) -> bool {
        self.hw_params().is_some()
    }

    fn direction(&self) -> Direction;

    #[cfg(test)]
    fn as_any(&self) -> &dyn std::any::Any;
}

/// What a backend needs to know about the stream it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmDeviceConfig {
    pub direction: Direction,
    pub device_name: String,
    pub prop_name: String,
    pub prop_value: String,
    /// Capacity of the ring of callback driven backends, in bytes.
    pub ring_buffer_size: u32,
}

impl PcmDeviceConfig {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            device_name: String::new(),
            prop_name: String::new(),
            prop_value: String::new(),
            ring_buffer_size: crate::config::DEFAULT_RING_BUFFER_SIZE,
        }
    }
}

pub fn alloc_pcm_device(
    backend: BackendType,
    config: PcmDeviceConfig,
) -> Result<Box<dyn PcmDevice>> {
    log::trace!("allocating {:?} pcm device {:?}", backend, config);
    match backend {
        BackendType::Null => Ok(Box::new(NullPcm::new(config))),
        #[cfg(all(feature = "pw-backend", target_env = "gnu"))]
        BackendType::Pipewire => Ok(Box::new(PwPcm::new(config))),
        #[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
        BackendType::Alsa => Ok(Box::new(AlsaPcm::new(config))),
        #[cfg(all(feature = "pulse-backend", target_env = "gnu"))]
        BackendType::Pulse => Ok(Box::new(PulsePcm::new(config))),
    }
}

/// Outcome of one backend transfer attempt.
#[derive(Debug)]
pub enum Transfer {
    /// Number of frames moved, possibly fewer than asked for.
    Frames(usize),
    /// The stream under or overran and must be recovered.
    Xrun,
    Failed(Error),
}

/// Move `total_bytes` through `step`, which is given the byte offset to
/// continue from.
///
/// Every xrun is followed by one call to `recover`; more than
/// [`MAX_XRUN_RECOVERIES`] xruns fail the transfer.
pub fn transfer_all<S, R>(
    total_bytes: usize,
    frame_size: usize,
    mut step: S,
    mut recover: R,
) -> Result<()>
where
    S: FnMut(usize) -> Transfer,
    R: FnMut() -> Result<()>,
{
    if frame_size == 0 || total_bytes % frame_size != 0 {
        return Err(Error::InvalidParameter(format!(
            "transfer of {total_bytes} bytes is not a whole number of {frame_size} bytes frames"
        )));
    }
    let mut done = 0;
    let mut recoveries = 0;
    while done < total_bytes {
        match step(done) {
            Transfer::Frames(frames) => done += frames * frame_size,
            Transfer::Xrun => {
                recoveries += 1;
                if recoveries > MAX_XRUN_RECOVERIES {
                    return Err(Error::XrunRecoveryExhausted(MAX_XRUN_RECOVERIES));
                }
                log::warn!(
                    "xrun after {} of {} bytes, recovering ({}/{})",
                    done,
                    total_bytes,
                    recoveries,
                    MAX_XRUN_RECOVERIES
                );
                recover()?;
            }
            Transfer::Failed(err) => return Err(err),
        }
    }
    Ok(())
}
