// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! Discovery and serving of the streams a frontend publishes in XenStore.
//!
//! ```text
//! /local/domain/<dom>/device/vsnd/<dev>/<card>/<device>/<stream>/
//!     unique-id, type, ring-ref, event-channel, evt-ring-ref,
//!     evt-event-channel
//! ```

use std::{
    str::FromStr,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crate::{
    audio_backends::{alloc_pcm_device, PcmDeviceConfig},
    dispatcher::CommandDispatcher,
    sndif::{
        XENSND_DRIVER_NAME, XENSND_FIELD_EVT_CHNL, XENSND_FIELD_EVT_EVT_CHNL,
        XENSND_FIELD_EVT_RING_REF, XENSND_FIELD_RING_REF, XENSND_FIELD_TYPE,
        XENSND_FIELD_UNIQUE_ID,
    },
    stream::StreamChannel,
    xen::{DomId, EventPort, GrantRef, XenBus, XenStore},
    BackendType, Direction, Error, Result, SoundConfig,
};

#[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
const ALSA_DEFAULT_DEVICE: &str = "default";
#[cfg(any(
    all(feature = "pw-backend", target_env = "gnu"),
    all(feature = "pulse-backend", target_env = "gnu")
))]
const DEFAULT_PROP_NAME: &str = "media.role";

/// XenStore directory of frontend device `dev_id` in domain `dom`.
pub fn frontend_path(dom: DomId, dev_id: u16) -> String {
    format!("/local/domain/{dom}/device/{XENSND_DRIVER_NAME}/{dev_id}")
}

/// Parsed stream unique id, `{backend}<{device}>{property}:{value}`.
///
/// Every component may be empty. `;` in the device name stands for `,`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamId {
    pub pcm_type: String,
    pub device_name: String,
    pub prop_name: String,
    pub prop_value: String,
}

impl FromStr for StreamId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((pcm_type, rest)) = s.split_once('<') else {
            return Ok(Self {
                pcm_type: s.to_string(),
                ..Self::default()
            });
        };
        let (device_name, prop) = rest
            .split_once('>')
            .ok_or_else(|| Error::InvalidStreamId(s.to_string()))?;
        let (prop_name, prop_value) = prop.split_once(':').unwrap_or((prop, ""));

        Ok(Self {
            pcm_type: pcm_type.to_string(),
            device_name: device_name.replace(';', ","),
            prop_name: prop_name.to_string(),
            prop_value: prop_value.to_string(),
        })
    }
}

/// A stream published by the frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub path: String,
    pub unique_id: String,
    pub direction: Direction,
    pub id: StreamId,
    pub ring_ref: GrantRef,
    pub port: EventPort,
    pub evt_ring_ref: GrantRef,
    pub evt_port: EventPort,
}

impl StreamDescriptor {
    /// Read the stream entries under `path`.
    pub fn read(store: &dyn XenStore, path: &str) -> Result<Self> {
        let field = |name: &str| format!("{path}/{name}");
        let unique_id = store.read_string(&field(XENSND_FIELD_UNIQUE_ID))?;
        let direction = Direction::try_from(store.read_string(&field(XENSND_FIELD_TYPE))?.as_str())?;

        Ok(Self {
            path: path.to_string(),
            id: unique_id.parse()?,
            unique_id,
            direction,
            ring_ref: store.read_u32(&field(XENSND_FIELD_RING_REF))?,
            port: store.read_u32(&field(XENSND_FIELD_EVT_CHNL))?,
            evt_ring_ref: store.read_u32(&field(XENSND_FIELD_EVT_RING_REF))?,
            evt_port: store.read_u32(&field(XENSND_FIELD_EVT_EVT_CHNL))?,
        })
    }

    /// Backend and device settings of the stream, with the configured
    /// defaults filled in.
    pub fn device_config(&self, config: &SoundConfig) -> Result<(BackendType, PcmDeviceConfig)> {
        let backend = if self.id.pcm_type.is_empty() {
            config.get_audio_backend()
        } else {
            BackendType::from_tag(&self.id.pcm_type)?
        };
        let defaults = config.get_defaults(self.direction);
        let or_default = |val: &str, default: &str| {
            if val.is_empty() {
                default.to_string()
            } else {
                val.to_string()
            }
        };
        #[allow(unused_mut)]
        let mut device_name = or_default(&self.id.device_name, &defaults.default_device);
        #[allow(unused_mut)]
        let mut prop_name = or_default(&self.id.prop_name, &defaults.default_prop_name);

        match backend {
            #[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
            BackendType::Alsa if device_name.is_empty() => {
                device_name = ALSA_DEFAULT_DEVICE.to_string();
            }
            #[cfg(all(feature = "pw-backend", target_env = "gnu"))]
            BackendType::Pipewire if prop_name.is_empty() => {
                prop_name = DEFAULT_PROP_NAME.to_string();
            }
            #[cfg(all(feature = "pulse-backend", target_env = "gnu"))]
            BackendType::Pulse if prop_name.is_empty() => {
                prop_name = DEFAULT_PROP_NAME.to_string();
            }
            _ => {}
        }

        Ok((
            backend,
            PcmDeviceConfig {
                direction: self.direction,
                device_name,
                prop_name,
                prop_value: self.id.prop_value.clone(),
                ring_buffer_size: config.get_ring_buffer_size(),
            },
        ))
    }
}

/// Connection to one frontend device: one worker thread per stream.
pub struct FrontendSession {
    bus: Arc<dyn XenBus>,
    dom_id: DomId,
    dev_id: u16,
    config: SoundConfig,
    path: String,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for FrontendSession {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(FrontendSession))
            .field("dom_id", &self.dom_id)
            .field("dev_id", &self.dev_id)
            .field("path", &self.path)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl FrontendSession {
    pub fn new(bus: Arc<dyn XenBus>, dom_id: DomId, dev_id: u16, config: SoundConfig) -> Self {
        Self {
            path: frontend_path(dom_id, dev_id),
            bus,
            dom_id,
            dev_id,
            config,
            workers: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Enumerate `<card>/<device>/<stream>`, each level until the first
    /// missing index.
    pub fn discover_streams(&self) -> Result<Vec<StreamDescriptor>> {
        let store = self.bus.store();
        let mut streams = Vec::new();
        for card in 0.. {
            let card_path = format!("{}/{}", self.path, card);
            if !store.exists(&card_path) {
                break;
            }
            for device in 0.. {
                let device_path = format!("{card_path}/{device}");
                if !store.exists(&device_path) {
                    break;
                }
                for stream in 0.. {
                    let stream_path = format!("{device_path}/{stream}");
                    if !store.exists(&stream_path) {
                        break;
                    }
                    let descriptor = StreamDescriptor::read(store, &stream_path)?;
                    log::debug!(
                        "found {} stream {} at {}",
                        descriptor.direction,
                        descriptor.unique_id,
                        stream_path
                    );
                    streams.push(descriptor);
                }
            }
        }
        Ok(streams)
    }

    /// Bind every stream of the frontend and start serving it.
    pub fn bind(&mut self) -> Result<()> {
        let streams = self.discover_streams()?;
        if streams.is_empty() {
            log::warn!("frontend {} has no streams", self.path);
        }
        let mapper = self.bus.grant_mapper(self.dom_id)?;

        for (index, stream) in streams.into_iter().enumerate() {
            let (backend, device_config) = stream.device_config(&self.config)?;
            log::info!(
                "{} stream {}: {:?} {:?}",
                stream.direction,
                stream.unique_id,
                backend,
                device_config
            );
            let device = alloc_pcm_device(backend, device_config)?;
            let mut ring = self
                .bus
                .request_ring(self.dom_id, stream.port, stream.ring_ref)?;
            let sink = self
                .bus
                .event_sink(self.dom_id, stream.evt_port, stream.evt_ring_ref)?;
            let dispatcher = CommandDispatcher::new(mapper.clone(), device, sink);

            let name = format!("xensnd-{}-{}", self.dom_id, index);
            let mut channel = StreamChannel::new(name.clone(), dispatcher);
            let worker = thread::Builder::new().name(name).spawn(move || {
                if let Err(err) = channel.run(&mut *ring) {
                    log::error!("{}: {}", channel.name(), err);
                }
            })?;
            self.workers.push(worker);
        }
        Ok(())
    }

    /// Wait until every stream worker has finished.
    pub fn join(&mut self) {
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or_default().to_string();
            if worker.join().is_err() {
                log::error!("worker {} panicked", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use rstest::*;

    use super::*;
    use crate::{
        config::{ConfigFile, DeclaredStream, DirectionDefaults},
        sndif::*,
        xen::mock::MockXenBus,
    };

    fn config(streams: Vec<DeclaredStream>, file: ConfigFile) -> SoundConfig {
        SoundConfig::new(1, 0, BackendType::Null, streams, file)
    }

    #[rstest]
    #[case::full("alsa<hw:0;0>media.role:music", "alsa", "hw:0,0", "media.role", "music")]
    #[case::type_only("pipewire", "pipewire", "", "", "")]
    #[case::empty("", "", "", "", "")]
    #[case::no_value("<default>media.role", "", "default", "media.role", "")]
    #[case::empty_device("null<>:navi", "null", "", "", "navi")]
    #[case::colons_in_value("alsa<>a:b:c", "alsa", "", "a", "b:c")]
    fn test_stream_id_parse(
        #[case] unique_id: &str,
        #[case] pcm_type: &str,
        #[case] device_name: &str,
        #[case] prop_name: &str,
        #[case] prop_value: &str,
    ) {
        let id: StreamId = unique_id.parse().unwrap();
        assert_eq!(
            id,
            StreamId {
                pcm_type: pcm_type.to_string(),
                device_name: device_name.to_string(),
                prop_name: prop_name.to_string(),
                prop_value: prop_value.to_string(),
            }
        );
    }

    #[test]
    fn test_stream_id_unterminated_device() {
        assert_matches!(
            "alsa<hw:0".parse::<StreamId>(),
            Err(Error::InvalidStreamId(id)) if id == "alsa<hw:0"
        );
    }

    #[test]
    fn test_frontend_path() {
        assert_eq!(frontend_path(3, 1), "/local/domain/3/device/vsnd/1");
    }

    fn descriptor(unique_id: &str, direction: Direction) -> StreamDescriptor {
        StreamDescriptor {
            path: String::new(),
            unique_id: unique_id.to_string(),
            direction,
            id: unique_id.parse().unwrap(),
            ring_ref: 1,
            port: 2,
            evt_ring_ref: 3,
            evt_port: 4,
        }
    }

    #[test]
    fn test_device_config_defaults() {
        let file = ConfigFile {
            ring_buffer_size: 8192,
            capture: DirectionDefaults {
                default_device: "hw:2".to_string(),
                default_prop_name: "media.name".to_string(),
            },
            ..ConfigFile::default()
        };
        let config = config(vec![], file);

        let (backend, device) = descriptor("", Direction::Playback)
            .device_config(&config)
            .unwrap();
        assert_eq!(backend, BackendType::Null);
        assert_eq!(device.device_name, "");
        assert_eq!(device.ring_buffer_size, 8192);

        let (_, device) = descriptor("null<>:x", Direction::Capture)
            .device_config(&config)
            .unwrap();
        assert_eq!(device.direction, Direction::Capture);
        assert_eq!(device.device_name, "hw:2");
        assert_eq!(device.prop_name, "media.name");
        assert_eq!(device.prop_value, "x");

        let (_, device) = descriptor("<hw:1>", Direction::Capture)
            .device_config(&config)
            .unwrap();
        assert_eq!(device.device_name, "hw:1");

        assert_matches!(
            descriptor("oss", Direction::Playback).device_config(&config),
            Err(Error::AudioBackendNotSupported(tag)) if tag == "oss"
        );
    }

    #[cfg(all(feature = "alsa-backend", target_env = "gnu"))]
    #[test]
    fn test_device_config_alsa_fallback() {
        let config = config(vec![], ConfigFile::default());
        let (backend, device) = descriptor("ALSA", Direction::Playback)
            .device_config(&config)
            .unwrap();
        assert_eq!(backend, BackendType::Alsa);
        assert_eq!(device.device_name, ALSA_DEFAULT_DEVICE);
    }

    #[cfg(all(feature = "pw-backend", target_env = "gnu"))]
    #[test]
    fn test_device_config_pipewire_fallback() {
        let config = config(vec![], ConfigFile::default());
        let (backend, device) = descriptor("pipewire<>:music", Direction::Playback)
            .device_config(&config)
            .unwrap();
        assert_eq!(backend, BackendType::Pipewire);
        assert_eq!(device.prop_name, DEFAULT_PROP_NAME);
        assert_eq!(device.prop_value, "music");
    }

    #[cfg(all(feature = "pulse-backend", target_env = "gnu"))]
    #[test]
    fn test_device_config_pulse_fallback() {
        let config = config(vec![], ConfigFile::default());
        let (backend, device) = descriptor("PULSE<alsa_output.pci>:game", Direction::Capture)
            .device_config(&config)
            .unwrap();
        assert_eq!(backend, BackendType::Pulse);
        assert_eq!(device.device_name, "alsa_output.pci");
        assert_eq!(device.prop_name, DEFAULT_PROP_NAME);
        assert_eq!(device.prop_value, "game");
    }

    #[test]
    fn test_discover_streams() {
        crate::init_logger();
        let bus = Arc::new(MockXenBus::new());
        let streams: Vec<DeclaredStream> = vec![
            "p:null<>media.role:music".parse().unwrap(),
            "c:null".parse().unwrap(),
        ];
        let refs = bus.declare_frontend(1, 0, &streams).unwrap();
        // A second stream of the first device.
        bus.declare_stream(1, &format!("{}/0/0/1", frontend_path(1, 0)), &streams[1])
            .unwrap();

        let session = FrontendSession::new(bus, 1, 0, config(streams, ConfigFile::default()));
        _ = format!("{session:?}");
        let found = session.discover_streams().unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].direction, Direction::Playback);
        assert_eq!(found[0].id.prop_value, "music");
        assert_eq!(found[0].ring_ref, refs[0].ring_ref);
        assert_eq!(found[1].path, format!("{}/0/0/1", session.path()));
        assert_eq!(found[2].direction, Direction::Capture);
        assert_eq!(found[2].evt_ring_ref, refs[1].evt_ring_ref);
    }

    #[test]
    fn test_bind_invalid_stream() {
        crate::init_logger();
        let bus = Arc::new(MockXenBus::new());
        let streams: Vec<DeclaredStream> = vec!["p:oss<>".parse().unwrap()];
        bus.declare_frontend(2, 0, &streams).unwrap();

        let mut session = FrontendSession::new(bus, 2, 0, config(streams, ConfigFile::default()));
        assert_matches!(session.bind(), Err(Error::AudioBackendNotSupported(_)));
        session.join();
    }

    #[test]
    fn test_serve_frontend() {
        crate::init_logger();
        let bus = Arc::new(MockXenBus::new());
        let streams: Vec<DeclaredStream> = vec!["p:null".parse().unwrap()];
        let refs = bus.declare_frontend(1, 0, &streams).unwrap();

        let mut session =
            FrontendSession::new(bus.clone(), 1, 0, config(streams, ConfigFile::default()));
        session.bind().unwrap();

        let ring = bus.frontend_ring(1, refs[0].ring_ref).unwrap();
        let events = bus.event_ring(1, refs[0].evt_ring_ref).unwrap();
        let table = bus.grant_table(1).unwrap();
        let buffer = table.guest_buffer(16384).unwrap();

        let open = XenSndOpenReq {
            pcm_rate: 44100.into(),
            pcm_format: XENSND_PCM_FORMAT_S16_LE,
            pcm_channels: 2,
            buffer_sz: 16384.into(),
            gref_directory: buffer.directory.into(),
            period_sz: 1024.into(),
            ..Default::default()
        };
        let resp = ring.call(XenSndReq::new(1, XENSND_OP_OPEN, open)).unwrap();
        assert_eq!(resp.status(), 0);
        assert_eq!(table.active_mappings(), 1);

        let write = XenSndRwReq {
            offset: 0.into(),
            length: 16384.into(),
        };
        let resp = ring.call(XenSndReq::new(2, XENSND_OP_WRITE, write)).unwrap();
        assert_eq!(resp.status(), 0);
        let start = XenSndTriggerReq {
            type_: XENSND_OP_TRIGGER_START,
        };
        let resp = ring.call(XenSndReq::new(3, XENSND_OP_TRIGGER, start)).unwrap();
        assert_eq!(u16::from(resp.id), 3);
        assert_eq!(resp.status(), 0);

        let evt = events.wait_event(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(evt.type_, XENSND_EVT_CUR_POS);
        assert_eq!(u16::from(evt.id), 0);

        // Closing the ring closes the stream and ends the worker.
        drop(ring);
        session.join();
        assert_eq!(table.active_mappings(), 0);
    }
}
