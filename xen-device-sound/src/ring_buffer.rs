// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Byte ring decoupling guest requests from callback driven backends.

use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use crate::{
    audio_backends::{transfer_all, Transfer},
    Error, Result,
};

#[derive(Debug)]
pub struct ByteRing {
    /// Storage shared by producer and consumer
    buf: Vec<u8>,
    /// Index from which data is consumed, always below the capacity
    head: usize,
    /// Amount of data in the ring
    len: usize,
}

impl ByteRing {
    pub fn new(capacity: u32) -> Self {
        Self {
            buf: vec![0; capacity as usize],
            head: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Amount of data in the ring.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Discard all buffered data.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Add as much of `data` as fits and return the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.free());
        if count < data.len() {
            log::debug!(
                "ring overrun: {} of {} bytes accepted",
                count,
                data.len()
            );
        }
        if count == 0 {
            return 0;
        }

        let tail = (self.head + self.len) % self.capacity();
        // Fill up to the end of the storage, then wrap around.
        let first = count.min(self.capacity() - tail);
        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        self.buf[..count - first].copy_from_slice(&data[first..count]);

        self.len += count;
        count
    }

    /// Move up to `out.len()` bytes into `out` and return how many were
    /// available.
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len);
        if count < out.len() {
            log::debug!("ring underrun: {} of {} bytes available", count, out.len());
        }
        if count == 0 {
            return 0;
        }

        let first = count.min(self.capacity() - self.head);
        out[..first].copy_from_slice(&self.buf[self.head..self.head + first]);
        out[first..count].copy_from_slice(&self.buf[..count - first]);

        self.head = (self.head + count) % self.capacity();
        self.len -= count;
        count
    }
}

/// State shared between guest transfers and the realtime callback of a
/// backend.
#[derive(Debug)]
pub struct RingState {
    pub ring: ByteRing,
    /// Bytes consumed by the backend for playback, produced by it for capture
    pub processed: u64,
    pub running: bool,
}

pub type SharedRing = Arc<(Mutex<RingState>, Condvar)>;

pub fn shared_ring(capacity: u32) -> SharedRing {
    Arc::new((
        Mutex::new(RingState {
            ring: ByteRing::new(capacity),
            processed: 0,
            running: false,
        }),
        Condvar::new(),
    ))
}

/// Fill `out` with queued playback data, padding the rest with silence.
/// Returns the number of bytes taken from the ring.
pub fn fill_playback(shared: &SharedRing, out: &mut [u8]) -> usize {
    let (lock, cvar) = &**shared;
    let popped = {
        let mut state = lock.lock().unwrap();
        let popped = state.ring.pop(out);
        state.processed += popped as u64;
        popped
    };
    out[popped..].fill(0);
    cvar.notify_all();
    popped
}

/// Queue captured `data`, dropping what does not fit. Returns the number of
/// bytes queued.
pub fn drain_capture(shared: &SharedRing, data: &[u8]) -> usize {
    let (lock, cvar) = &**shared;
    let pushed = {
        let mut state = lock.lock().unwrap();
        let pushed = state.ring.push(data);
        state.processed += pushed as u64;
        pushed
    };
    cvar.notify_all();
    pushed
}

/// Run `step` on the shared state once `ready` holds, failing with
/// [`Error::Timeout`] if the backend does not get there in time.
fn wait_ring<R, S>(shared: &SharedRing, timeout: Duration, ready: R, step: S) -> Transfer
where
    R: Fn(&RingState) -> bool,
    S: FnOnce(&mut RingState) -> usize,
{
    let (lock, cvar) = &**shared;
    let state = lock.lock().unwrap();
    let (mut state, wait) = cvar
        .wait_timeout_while(state, timeout, |state| !ready(state))
        .unwrap();
    if wait.timed_out() {
        log::error!("timed out waiting for the audio backend");
        return Transfer::Failed(Error::Timeout);
    }
    Transfer::Frames(step(&mut state))
}

/// Queue all of `buf` for playback, waiting for the backend to make room.
pub fn write_all(
    shared: &SharedRing,
    buf: &[u8],
    frame_size: usize,
    timeout: Duration,
) -> Result<()> {
    transfer_all(
        buf.len(),
        frame_size,
        |offset| {
            wait_ring(
                shared,
                timeout,
                |state| state.ring.free() >= frame_size,
                |state| {
                    let count = state.ring.free().min(buf.len() - offset);
                    let count = count - count % frame_size;
                    state.ring.push(&buf[offset..offset + count]) / frame_size
                },
            )
        },
        || Ok(()),
    )
}

/// Fill all of `buf` with captured data, waiting for the backend to provide
/// it.
pub fn read_exact(
    shared: &SharedRing,
    buf: &mut [u8],
    frame_size: usize,
    timeout: Duration,
) -> Result<()> {
    let len = buf.len();
    transfer_all(
        len,
        frame_size,
        |offset| {
            wait_ring(
                shared,
                timeout,
                |state| state.ring.len() >= frame_size,
                |state| {
                    let count = state.ring.len().min(len - offset);
                    let count = count - count % frame_size;
                    state.ring.pop(&mut buf[offset..offset + count]) / frame_size
                },
            )
        },
        || Ok(()),
    )
}
