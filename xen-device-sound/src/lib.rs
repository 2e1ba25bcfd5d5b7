// Manos Pitsidianakis <manos.pitsidianakis@linaro.org>
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//
#![deny(
    /* groups */
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    clippy::style,
    clippy::nursery,
    //* restriction */
    clippy::dbg_macro,
    clippy::rc_buffer,
    clippy::as_underscore,
    clippy::assertions_on_result_states,
    //* pedantic */
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::ptr_as_ptr,
    clippy::bool_to_int_with_if,
    clippy::borrow_as_ptr,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_lossless,
    clippy::cast_ptr_alignment,
    clippy::naive_bytecount
)]
#![allow(
    clippy::significant_drop_in_scrutinee,
    clippy::significant_drop_tightening
)]

pub mod args;
pub mod audio_backends;
pub mod buffer;
pub mod config;
pub mod dispatcher;
pub mod frontend;
pub mod ring_buffer;
pub mod sndif;
pub mod stream;
pub mod timer;
pub mod xen;

use std::{
    convert::TryFrom,
    io::{Error as IoError, ErrorKind},
    sync::Arc,
};

use clap::ValueEnum;
pub use config::SoundConfig;
use sndif::{XENSND_STREAM_TYPE_CAPTURE, XENSND_STREAM_TYPE_PLAYBACK};
use thiserror::Error as ThisError;
use vm_memory::VolatileMemoryError;

use crate::{frontend::FrontendSession, xen::XenBus};

pub type Result<T> = std::result::Result<T, Error>;

/// Stream direction, as declared by the frontend in its `type` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Playback,
    Capture,
}

impl TryFrom<&str> for Direction {
    type Error = Error;

    fn try_from(val: &str) -> std::result::Result<Self, Self::Error> {
        Ok(match val {
            XENSND_STREAM_TYPE_PLAYBACK => Self::Playback,
            XENSND_STREAM_TYPE_CAPTURE => Self::Capture,
            other => return Err(Error::InvalidStreamType(other.to_string())),
        })
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Self::Playback => write!(fmt, "playback"),
            Self::Capture => write!(fmt, "capture"),
        }
    }
}

/// Custom error types
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Unknown request operation {0}")]
    UnknownOperation(u8),
    #[error("Request operation {0} is not supported")]
    OperationNotSupported(&'static str),
    #[error("Unknown trigger type {0}")]
    UnknownTrigger(u8),
    #[error("Stream is not open")]
    NotOpen,
    #[error("Stream is already open")]
    AlreadyOpen,
    #[error("Protocol or device error: {0}")]
    Stream(stream::Error),
    #[error("Page directory ended after {found} of {expected} grant references")]
    PageDirectoryTruncated { expected: usize, found: usize },
    #[error("Could not map grant reference {0}")]
    GrantMapFailed(u32),
    #[error("Range {offset}+{length} is out of the {size} bytes buffer")]
    BufferOutOfRange {
        offset: u32,
        length: u32,
        size: usize,
    },
    #[error("Guest memory access failed: {0}")]
    GuestMemory(VolatileMemoryError),
    #[error("Invalid PCM format {0}")]
    InvalidFormat(u8),
    #[error("Invalid PCM parameter: {0}")]
    InvalidParameter(String),
    #[error("Operation {0} is not valid for a {1} stream")]
    WrongDirection(&'static str, Direction),
    #[error("Stream did not recover after {0} xruns")]
    XrunRecoveryExhausted(u32),
    #[error("Timed out waiting for the audio backend")]
    Timeout,
    #[error("Audio backend not supported: {0}")]
    AudioBackendNotSupported(String),
    #[error("Audio backend unexpected error: {0}")]
    UnexpectedAudioBackendError(String),
    #[error("Audio backend error in {0}: errno {1}")]
    AudioBackendErrno(String, i32),
    #[error("Invalid stream unique id: {0}")]
    InvalidStreamId(String),
    #[error("Invalid stream type: {0}")]
    InvalidStreamType(String),
    #[error("XenStore entry {0} not found")]
    XenStoreEntryMissing(String),
    #[error("XenStore entry {0} has an invalid value: {1}")]
    XenStoreEntryInvalid(String, String),
    #[error("Event ring is full")]
    EventRingFull,
    #[error("Request ring is closed")]
    RingClosed,
    #[error("Failed to create a new EventFd")]
    EventFdCreate(IoError),
    #[error("Could not parse configuration: {0}")]
    ConfigParse(Box<figment::Error>),
    #[error("I/O error: {0}")]
    Io(IoError),
}

impl Error {
    /// Positive errno reported to the frontend for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::UnknownOperation(_)
            | Self::OperationNotSupported(_)
            | Self::AudioBackendNotSupported(_) => libc::ENOTSUP,
            Self::NotOpen => libc::EBADF,
            Self::AlreadyOpen => libc::EBUSY,
            Self::GrantMapFailed(_) => libc::ENOMEM,
            Self::GuestMemory(_) => libc::EFAULT,
            Self::XrunRecoveryExhausted(_) => libc::EPIPE,
            Self::Timeout => libc::ETIMEDOUT,
            Self::UnexpectedAudioBackendError(_) => libc::EIO,
            Self::AudioBackendErrno(_, errno) => *errno,
            Self::XenStoreEntryMissing(_) => libc::ENOENT,
            Self::EventRingFull => libc::EAGAIN,
            Self::RingClosed => libc::ENOTCONN,
            Self::EventFdCreate(err) | Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::UnknownTrigger(_)
            | Self::Stream(_)
            | Self::PageDirectoryTruncated { .. }
            | Self::BufferOutOfRange { .. }
            | Self::InvalidFormat(_)
            | Self::InvalidParameter(_)
            | Self::WrongDirection(..)
            | Self::InvalidStreamId(_)
            | Self::InvalidStreamType(_)
            | Self::XenStoreEntryInvalid(..)
            | Self::ConfigParse(_) => libc::EINVAL,
        }
    }

    /// Whether the error leaves the audio backend unusable until the next
    /// open.
    pub const fn is_backend_fatal(&self) -> bool {
        matches!(
            self,
            Self::XrunRecoveryExhausted(_)
                | Self::Timeout
                | Self::UnexpectedAudioBackendError(_)
                | Self::AudioBackendErrno(..)
        )
    }
}

impl From<Error> for IoError {
    fn from(e: Error) -> Self {
        Self::new(ErrorKind::Other, e)
    }
}

impl From<IoError> for Error {
    fn from(val: IoError) -> Self {
        Self::Io(val)
    }
}

impl From<stream::Error> for Error {
    fn from(val: stream::Error) -> Self {
        Self::Stream(val)
    }
}

impl From<VolatileMemoryError> for Error {
    fn from(val: VolatileMemoryError) -> Self {
        Self::GuestMemory(val)
    }
}

impl From<figment::Error> for Error {
    fn from(val: figment::Error) -> Self {
        Self::ConfigParse(Box::new(val))
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendType {
    Null,
    #[cfg(all(feature = "pw-backend", target_env = "gnu"))]
    Pipewire,
    #[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
    Alsa,
    #[cfg(all(feature = "pulse-backend", target_env = "gnu"))]
    Pulse,
}

impl Default for BackendType {
    fn default() -> Self {
        #[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
        let backend = Self::Alsa;
        #[cfg(not(all(feature = "alsa-backend", target_env = "gnu")))]
        let backend = Self::Null;
        backend
    }
}

impl BackendType {
    /// Resolve the backend tag of a stream unique id or of the configuration
    /// file, case insensitively.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "NULL" => Ok(Self::Null),
            #[cfg(all(feature = "pw-backend", target_env = "gnu"))]
            "PIPEWIRE" => Ok(Self::Pipewire),
            #[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
            "ALSA" => Ok(Self::Alsa),
            #[cfg(all(feature = "pulse-backend", target_env = "gnu"))]
            "PULSE" => Ok(Self::Pulse),
            _ => Err(Error::AudioBackendNotSupported(tag.to_string())),
        }
    }
}

/// This is the public API through which an external program starts the
/// xen-device-sound backend.
///
/// Serves the frontend named in `config` on `bus`, one worker thread per
/// stream, until every stream ring is closed.
pub fn start_backend_server(bus: Arc<dyn XenBus>, config: SoundConfig) -> Result<()> {
    log::trace!("Using config {:?}.", &config);
    let mut session = FrontendSession::new(
        bus,
        config.get_frontend_domid(),
        config.get_frontend_id(),
        config,
    );
    session.bind()?;

    log::trace!("Serving frontend {}.", session.path());
    session.join();
    Ok(())
}

#[cfg(test)]
pub fn init_logger() {
    std::env::set_var("RUST_LOG", "trace");
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::xen::mock::MockXenBus;

    #[test]
    fn test_direction_try_from() {
        assert_eq!(Direction::try_from("p").unwrap(), Direction::Playback);
        assert_eq!(Direction::try_from("c").unwrap(), Direction::Capture);
        assert_matches!(
            Direction::try_from("x"),
            Err(Error::InvalidStreamType(val)) if val == "x"
        );
    }

    #[test]
    fn test_backend_from_tag() {
        assert_eq!(BackendType::from_tag("null").unwrap(), BackendType::Null);
        assert_eq!(BackendType::from_tag("NULL").unwrap(), BackendType::Null);
        assert_matches!(
            BackendType::from_tag("OSS"),
            Err(Error::AudioBackendNotSupported(_))
        );
        #[cfg(all(feature = "pulse-backend", target_env = "gnu"))]
        assert_eq!(BackendType::from_tag("Pulse").unwrap(), BackendType::Pulse);
        #[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
        assert_eq!(BackendType::from_tag("alsa").unwrap(), BackendType::Alsa);
        #[cfg(all(feature = "pw-backend", target_env = "gnu"))]
        assert_eq!(
            BackendType::from_tag("PipeWire").unwrap(),
            BackendType::Pipewire
        );
    }

    #[test]
    fn test_errno() {
        assert_eq!(Error::UnknownOperation(42).errno(), libc::ENOTSUP);
        assert_eq!(Error::NotOpen.errno(), libc::EBADF);
        assert_eq!(Error::UnknownTrigger(9).errno(), libc::EINVAL);
        assert_eq!(
            Error::AudioBackendErrno("snd_pcm_writei".into(), libc::ENODEV).errno(),
            libc::ENODEV
        );
        assert_eq!(
            Error::Io(IoError::new(ErrorKind::Other, "no os error")).errno(),
            libc::EIO
        );
        assert!(Error::XrunRecoveryExhausted(3).is_backend_fatal());
        assert!(!Error::NotOpen.is_backend_fatal());
    }

    #[test]
    fn test_into_io_error() {
        let err: IoError = Error::RingClosed.into();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    fn server_config(streams: Vec<config::DeclaredStream>) -> SoundConfig {
        SoundConfig::new(
            4,
            0,
            BackendType::Null,
            streams,
            config::ConfigFile::default(),
        )
    }

    #[test]
    fn test_start_backend_server() {
        crate::init_logger();
        let bus = Arc::new(MockXenBus::new());
        let streams: Vec<config::DeclaredStream> = vec!["c:null".parse().unwrap()];
        let refs = bus.declare_frontend(4, 0, &streams).unwrap();
        let ring = bus.frontend_ring(4, refs[0].ring_ref).unwrap();

        let server = {
            let bus: Arc<dyn XenBus> = bus.clone();
            std::thread::spawn(move || start_backend_server(bus, server_config(streams)))
        };

        let resp = ring
            .call(sndif::XenSndReq::new(
                7,
                sndif::XENSND_OP_CLOSE,
                sndif::XenSndRwReq::default(),
            ))
            .unwrap();
        assert_eq!(u16::from(resp.id), 7);
        assert_eq!(resp.status(), 0);

        // The server returns once the only stream ring is closed.
        drop(ring);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_start_backend_server_invalid_backend() {
        crate::init_logger();
        let bus = Arc::new(MockXenBus::new());
        let streams: Vec<config::DeclaredStream> = vec!["p:oss<>".parse().unwrap()];
        bus.declare_frontend(4, 0, &streams).unwrap();

        assert_matches!(
            start_backend_server(bus, server_config(streams)),
            Err(Error::AudioBackendNotSupported(tag)) if tag == "oss"
        );
    }
}
