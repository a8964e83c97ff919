#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

use std::path::Path;

use flate2::Compression;
use types::{ArchiveExtractor, ArchivePacker, ExtractError, PackError};

mod extract;
mod header;
mod pack;
mod reader;
mod writer;

pub use extract::extract;
pub use header::{FileType, Header};
pub use pack::pack;
pub use reader::{Entry, NewcReader};
pub use writer::NewcWriter;

/// [`ArchiveExtractor`] for initramfs images
#[derive(Clone, Copy, Debug, Default)]
pub struct InitramExtractor;

impl ArchiveExtractor for InitramExtractor {
    fn extract(&self, container: &Path, dest: &Path) -> Result<(), ExtractError> {
        extract(container, dest)
    }
}

/// [`ArchivePacker`] producing gzip-compressed initramfs images
#[derive(Clone, Copy, Debug)]
pub struct InitramPacker {
    level: Compression,
}

impl InitramPacker {
    /// Creates a packer using the given gzip compression level, from 0 to 9
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for InitramPacker {
    fn default() -> Self {
        Self {
            level: Compression::best(),
        }
    }
}

impl ArchivePacker for InitramPacker {
    fn pack(&self, source: &Path, output: &Path) -> Result<(), PackError> {
        pack(source, output, self.level)
    }
}
