// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Backend configuration: command line arguments merged with an optional
//! YAML configuration file.

use std::path::Path;

use figment::{
    providers::{Format, Yaml},
    Figment,
};
use serde::Deserialize;

use crate::{args::SoundArgs, BackendType, Direction, Error, Result};

/// Capacity of the ring decoupling callback driven backends from requests.
pub const DEFAULT_RING_BUFFER_SIZE: u32 = 4 * 1024 * 1024;

/// Per direction defaults applied to stream ids leaving fields empty.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct DirectionDefaults {
    pub default_device: String,
    pub default_prop_name: String,
}

/// Contents of the configuration file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConfigFile {
    /// backend for stream ids without a backend tag
    pub sound_system: Option<String>,
    pub ring_buffer_size: u32,
    pub playback: DirectionDefaults,
    pub capture: DirectionDefaults,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            sound_system: None,
            ring_buffer_size: DEFAULT_RING_BUFFER_SIZE,
            playback: DirectionDefaults::default(),
            capture: DirectionDefaults::default(),
        }
    }
}

impl ConfigFile {
    /// Load the configuration file at `path`. A missing file yields the
    /// defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::warn!(
                "Configuration file {} not found, using defaults.",
                path.display()
            );
            return Ok(Self::default());
        }
        let config: Self = Figment::new().merge(Yaml::file(path)).extract()?;
        if config.ring_buffer_size == 0 {
            return Err(Error::InvalidParameter(
                "ring-buffer-size must not be zero".to_string(),
            ));
        }
        Ok(config)
    }
}

/// A stream the in-process frontend declares, in the `p:<unique-id>` or
/// `c:<unique-id>` form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeclaredStream {
    pub direction: Direction,
    pub unique_id: String,
}

impl std::str::FromStr for DeclaredStream {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (direction, unique_id) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidStreamId(s.to_string()))?;
        Ok(Self {
            direction: Direction::try_from(direction)?,
            unique_id: unique_id.to_string(),
        })
    }
}

#[derive(Debug, Clone)]
/// This structure is the public API through which an external program
/// is allowed to configure the backend.
pub struct SoundConfig {
    /// domain id of the frontend
    frontend_domid: u16,
    /// device id of the frontend
    frontend_id: u16,
    /// audio backend for stream ids without a backend tag
    audio_backend: BackendType,
    /// streams declared by the in-process frontend
    streams: Vec<DeclaredStream>,
    file: ConfigFile,
}

impl SoundConfig {
    /// Create a new instance of the SoundConfig struct, containing the
    /// parameters to be fed into the sound-backend server.
    pub const fn new(
        frontend_domid: u16,
        frontend_id: u16,
        audio_backend: BackendType,
        streams: Vec<DeclaredStream>,
        file: ConfigFile,
    ) -> Self {
        Self {
            frontend_domid,
            frontend_id,
            audio_backend,
            streams,
            file,
        }
    }

    pub const fn get_frontend_domid(&self) -> u16 {
        self.frontend_domid
    }

    pub const fn get_frontend_id(&self) -> u16 {
        self.frontend_id
    }

    pub const fn get_audio_backend(&self) -> BackendType {
        self.audio_backend
    }

    pub fn get_streams(&self) -> &[DeclaredStream] {
        &self.streams
    }

    pub const fn get_ring_buffer_size(&self) -> u32 {
        self.file.ring_buffer_size
    }

    pub const fn get_defaults(&self, direction: Direction) -> &DirectionDefaults {
        match direction {
            Direction::Playback => &self.file.playback,
            Direction::Capture => &self.file.capture,
        }
    }
}

impl TryFrom<SoundArgs> for SoundConfig {
    type Error = Error;

    fn try_from(args: SoundArgs) -> Result<Self> {
        let file = match args.config {
            Some(ref path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        // The command line takes precedence over the configuration file.
        let audio_backend = match (args.backend, file.sound_system.as_deref()) {
            (Some(backend), _) => backend,
            (None, Some(tag)) => BackendType::from_tag(tag)?,
            (None, None) => BackendType::default(),
        };

        Ok(Self::new(
            args.frontend_domid,
            args.frontend_id,
            audio_backend,
            args.stream,
            file,
        ))
    }
}
