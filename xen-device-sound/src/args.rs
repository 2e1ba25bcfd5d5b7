// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause
//! An arguments type for the binary interface of this library.

use std::path::PathBuf;

use clap::Parser;

use crate::{config::DeclaredStream, BackendType};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
pub struct SoundArgs {
    /// Load from a given YAML configuration file.
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// audio backend used for streams whose unique id carries no backend
    /// tag; overrides the configuration file
    #[clap(long)]
    #[clap(value_enum)]
    pub backend: Option<BackendType>,
    /// Domain id of the frontend.
    #[clap(long, default_value_t = 1)]
    pub frontend_domid: u16,
    /// Device id of the frontend.
    #[clap(long, default_value_t = 0)]
    pub frontend_id: u16,
    /// Stream declared by the frontend, as `p:<unique-id>` for playback or
    /// `c:<unique-id>` for capture. The unique id has the form
    /// `{backend}<{device}>{property}:{value}`.
    /// Example:
    ///   --stream 'p:alsa<hw:0;0>media.role:music'
    #[clap(long, verbatim_doc_comment)]
    pub stream: Vec<DeclaredStream>,
}
