// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use super::{
    transfer_all, ParamRange, PcmDevice, PcmDeviceConfig, PcmFormat, PcmParamRanges, PcmParams,
    ProgressCallback, Transfer,
};
use crate::{timer::PositionTimer, Direction, Error, Result};

/// Parameter space of the null device: every fixed width format.
fn native_ranges() -> PcmParamRanges {
    PcmParamRanges {
        formats: PcmFormat::ALL
            .iter()
            .filter(|format| format.bytes_per_sample().is_some())
            .fold(0, |mask, format| mask | format.mask()),
        rates: ParamRange::new(5512, 384000),
        channels: ParamRange::new(1, 8),
        buffer: ParamRange::new(64, 1 << 24),
        period: ParamRange::new(32, 1 << 23),
    }
}

#[derive(Debug, Default)]
struct NullState {
    params: Option<PcmParams>,
    running: bool,
    /// Clock bytes accumulated by previous runs
    clock_base: u64,
    run_started: Option<Instant>,
    transferred: u64,
}

impl NullState {
    fn clock_bytes(&self) -> u64 {
        let Some(params) = self.params else {
            return 0;
        };
        let bytes_per_sec = u64::from(params.rate) * u64::from(params.frame_size().unwrap_or(0));
        let elapsed = self
            .run_started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let run_bytes = elapsed.as_micros() * u128::from(bytes_per_sec) / 1_000_000;
        self.clock_base + u64::try_from(run_bytes).unwrap_or(u64::MAX)
    }

    /// Playback can not get ahead of what was written.
    fn position(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Playback => self.clock_bytes().min(self.transferred),
            Direction::Capture => self.clock_bytes(),
        }
    }

    fn halt(&mut self) {
        self.clock_base = self.clock_bytes();
        self.run_started = None;
        self.running = false;
    }
}

/// A device discarding playback and capturing silence, paced by the system
/// clock.
pub struct NullPcm {
    config: PcmDeviceConfig,
    state: Arc<Mutex<NullState>>,
    timer: PositionTimer,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for NullPcm {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(NullPcm))
            .field("config", &self.config)
            .field("state", &self.state)
            .field("timer", &self.timer)
            .finish_non_exhaustive()
    }
}

impl NullPcm {
    pub fn new(config: PcmDeviceConfig) -> Self {
        let timer = PositionTimer::new(format!("null-pcm-{}", config.direction));
        Self {
            config,
            state: Arc::new(Mutex::new(NullState::default())),
            timer,
            progress: None,
        }
    }

    fn open_params(&self) -> Result<PcmParams> {
        self.state.lock().unwrap().params.ok_or(Error::NotOpen)
    }

    fn arm_timer(&mut self, period: Duration) -> Result<()> {
        let Some(progress) = self.progress.clone() else {
            return Ok(());
        };
        let state = self.state.clone();
        let direction = self.config.direction;
        self.timer.start(period, move || {
            let position = {
                let state = state.lock().unwrap();
                if !state.running {
                    return;
                }
                state.position(direction)
            };
            progress(position);
        })
    }

    fn transfer(&mut self, op: &'static str, direction: Direction, len: usize) -> Result<()> {
        if self.config.direction != direction {
            return Err(Error::WrongDirection(op, self.config.direction));
        }
        let params = self.open_params()?;
        let frame_size = params.frame_size()? as usize;
        transfer_all(
            len,
            frame_size,
            |offset| Transfer::Frames((len - offset) / frame_size),
            || Ok(()),
        )?;
        self.state.lock().unwrap().transferred += len as u64;
        Ok(())
    }
}

impl PcmDevice for NullPcm {
    fn open(&mut self, params: &PcmParams) -> Result<()> {
        params.validate()?;
        let mut state = self.state.lock().unwrap();
        if state.params.is_some() {
            return Err(Error::AlreadyOpen);
        }
        log::debug!("null pcm {}: open {:?}", self.config.direction, params);
        *state = NullState {
            params: Some(*params),
            ..NullState::default()
        };
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.timer.stop();
        let mut state = self.state.lock().unwrap();
        if state.params.is_some() {
            log::debug!("null pcm {}: close", self.config.direction);
        }
        *state = NullState::default();
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.transfer("read", Direction::Capture, buf.len())?;
        buf.fill(0);
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.transfer("write", Direction::Playback, buf.len())
    }

    fn start(&mut self) -> Result<()> {
        let params = self.open_params()?;
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.run_started = Some(Instant::now());
        }
        self.arm_timer(params.period_duration()?)
    }

    fn stop(&mut self) -> Result<()> {
        self.open_params()?;
        self.timer.stop();
        self.state.lock().unwrap().halt();
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.stop()
    }

    fn resume(&mut self) -> Result<()> {
        self.start()
    }

    fn query_hw_ranges(&mut self, req: &PcmParamRanges) -> Result<PcmParamRanges> {
        Ok(super::narrow_ranges(req, &native_ranges()))
    }

    fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress = Some(callback);
    }

    fn hw_params(&self) -> Option<PcmParams> {
        self.state.lock().unwrap().params
    }

    fn direction(&self) -> Direction {
        self.config.direction
    }

    #[cfg(test)]
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Drop for NullPcm {
    fn drop(&mut self) {
        _ = self.close();
    }
}
