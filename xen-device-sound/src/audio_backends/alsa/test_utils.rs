// Manos Pitsidianakis <manos.pitsidianakis@linaro.org>
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use std::{path::PathBuf, sync::LazyLock};

use tempfile::{tempdir, TempDir};

/// Both the default device and `null` are backed by the null plugin.
const NULL_CONF: &str = "pcm.!default {\n type null\n}\n\nctl.!default {\n type null\n}\n\n\
                         pcm.null {\n type null\n}\n\nctl.null {\n type null\n}\n";

static TEST_HARNESS: LazyLock<AlsaTestHarness> = LazyLock::new(AlsaTestHarness::new);

#[must_use]
pub fn setup_alsa_conf() -> &'static AlsaTestHarness {
    // Dereferencing is necessary to perform the LazyLock init fn
    &TEST_HARNESS
}

/// Points `ALSA_CONFIG_PATH` to a configuration inside a temporary directory
/// for the lifetime of the test process, so PCM devices opened by tests never
/// reach the host's sound cards.
pub struct AlsaTestHarness {
    _tempdir: TempDir,
    pub conf_path: PathBuf,
}

impl AlsaTestHarness {
    fn new() -> Self {
        let tempdir = tempdir().unwrap();
        let conf_path = tempdir.path().join("alsa.conf");
        std::fs::write(&conf_path, NULL_CONF).unwrap();

        std::env::set_var("ALSA_CONFIG_PATH", &conf_path);
        println!(
            "INFO: setting ALSA_CONFIG_PATH={} in PID {}",
            conf_path.display(),
            std::process::id(),
        );

        Self {
            _tempdir: tempdir,
            conf_path,
        }
    }
}
