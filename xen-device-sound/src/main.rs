// Manos Pitsidianakis <manos.pitsidianakis@linaro.org>
// Stefano Garzarella <sgarzare@redhat.com>
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{process::exit, sync::Arc};

use clap::Parser;
use xen_device_sound::{
    args::SoundArgs, start_backend_server, xen::mock::MockXenBus, SoundConfig,
};

fn main() {
    env_logger::init();

    let config = match SoundConfig::try_from(SoundArgs::parse()) {
        Ok(config) => config,
        Err(err) => {
            log::error!("Invalid configuration: {}", err);
            exit(1);
        }
    };

    // Frontends are hosted on an in-process bus, declared from the stream list.
    let bus = Arc::new(MockXenBus::new());
    if let Err(err) = bus.declare_frontend(
        config.get_frontend_domid(),
        config.get_frontend_id(),
        config.get_streams(),
    ) {
        log::error!("Could not declare the frontend: {}", err);
        exit(1);
    }

    if let Err(err) = start_backend_server(bus, config) {
        log::error!("Backend failed: {}", err);
        exit(1);
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use rstest::*;
    use xen_device_sound::{config::DeclaredStream, BackendType, Direction};

    use super::*;

    fn init_logger() {
        std::env::set_var("RUST_LOG", "trace");
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_sound_config_setup() {
        init_logger();
        let args = SoundArgs::parse_from([
            "",
            "--frontend-domid",
            "5",
            "--stream",
            "c:null<>media.role:voice",
        ]);
        let config = SoundConfig::try_from(args).unwrap();

        assert_eq!(config.get_frontend_domid(), 5);
        assert_eq!(config.get_frontend_id(), 0);
        assert_eq!(
            config.get_streams(),
            &[DeclaredStream {
                direction: Direction::Capture,
                unique_id: "null<>media.role:voice".to_string(),
            }]
        );
    }

    #[rstest]
    #[case::null_backend("null", BackendType::Null)]
    #[cfg_attr(
        all(feature = "pw-backend", target_env = "gnu"),
        case::pipewire("pipewire", BackendType::Pipewire)
    )]
    #[cfg_attr(
        all(feature = "alsa-backend", target_env = "gnu"),
        case::alsa("alsa", BackendType::Alsa)
    )]
    #[cfg_attr(
        all(feature = "pulse-backend", target_env = "gnu"),
        case::pulse("pulse", BackendType::Pulse)
    )]
    fn test_cli_backend_arg(#[case] backend_name: &str, #[case] backend: BackendType) {
        let args: SoundArgs = Parser::parse_from(["", "--backend", backend_name]);

        let config = SoundConfig::try_from(args).unwrap();
        assert_eq!(config.get_audio_backend(), backend);
    }
}
