use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, BufWriter, Write as _},
    os::unix::{ffi::OsStrExt as _, fs::MetadataExt as _},
    path::Path,
};

use flate2::{write::GzEncoder, Compression, GzBuilder};
use log::{debug, info, trace};
use nix::sys::stat::{major, minor};
use types::PackError;
use walkdir::WalkDir;

use crate::{header::Header, writer::NewcWriter};

fn io_error(path: &Path) -> impl Fn(io::Error) -> PackError + '_ {
    move |source| PackError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn unreadable(path: &Path) -> impl Fn(io::Error) -> PackError + '_ {
    move |source| PackError::SourceUnreadable {
        path: path.to_path_buf(),
        source,
    }
}

/// Hands out inode numbers in the order files are first seen
#[derive(Debug, Default)]
struct InodeAllocator {
    next: u32,
    seen: HashMap<(u64, u64), u32>,
}

impl InodeAllocator {
    /// Returns the inode number to use, and whether the data was already written for it
    fn allocate(&mut self, metadata: &fs::Metadata) -> (u32, bool) {
        self.next += 1;

        if metadata.is_dir() || metadata.nlink() < 2 {
            return (self.next, false);
        }

        let key = (metadata.dev(), metadata.ino());
        if let Some(ino) = self.seen.get(&key) {
            self.next -= 1;
            return (*ino, true);
        }

        self.seen.insert(key, self.next);
        (self.next, false)
    }
}

fn header_for(
    path: &Path,
    metadata: &fs::Metadata,
    ino: u32,
    size: u64,
) -> Result<Header, PackError> {
    let file_size =
        u32::try_from(size).map_err(|_err| PackError::EntryTooLarge(path.to_path_buf()))?;
    let rdev = metadata.rdev();

    Ok(Header {
        ino,
        mode: metadata.mode(),
        uid: metadata.uid(),
        gid: metadata.gid(),
        nlink: u32::try_from(metadata.nlink()).unwrap_or(u32::MAX),
        mtime: u32::try_from(metadata.mtime().max(0)).unwrap_or(u32::MAX),
        file_size,
        dev_major: 0,
        dev_minor: 0,
        rdev_major: u32::try_from(major(rdev)).unwrap_or(u32::MAX),
        rdev_minor: u32::try_from(minor(rdev)).unwrap_or(u32::MAX),
        check: 0,
    })
}

fn pack_tree<W>(
    source: &Path,
    output: &Path,
    writer: &mut NewcWriter<W>,
) -> Result<usize, PackError>
where
    W: io::Write,
{
    let mut inodes = InodeAllocator::default();
    let mut count = 0;

    for entry in WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();

            PackError::SourceUnreadable {
                path,
                source: e.into(),
            }
        })?;

        let path = entry.path();
        let name = path
            .strip_prefix(source)
            .map_err(|_err| PackError::SourceUnreadable {
                path: path.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "Path outside of the source"),
            })?;

        let metadata = entry.metadata().map_err(|e| PackError::SourceUnreadable {
            path: path.to_path_buf(),
            source: e.into(),
        })?;

        let (ino, already_written) = inodes.allocate(&metadata);
        let file_type = metadata.file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(unreadable(path))?;
            let target = target.as_os_str().as_bytes();

            let header = header_for(path, &metadata, ino, target.len() as u64)?;
            writer
                .write_entry(name.as_os_str().as_bytes(), &header, &mut &target[..])
                .map_err(io_error(output))?;
        } else if file_type.is_file() && !already_written {
            let mut file = File::open(path).map_err(unreadable(path))?;

            let header = header_for(path, &metadata, ino, metadata.len())?;
            writer
                .write_entry(name.as_os_str().as_bytes(), &header, &mut file)
                .map_err(io_error(output))?;
        } else {
            if already_written {
                trace!("{} is a hard link, skipping its data", path.display());
            }

            let header = header_for(path, &metadata, ino, 0)?;
            writer
                .write_entry(name.as_os_str().as_bytes(), &header, &mut io::empty())
                .map_err(io_error(output))?;
        }

        count += 1;
    }

    Ok(count)
}

/// Packs a directory tree into a gzip-compressed newc archive
///
/// The entries are sorted by name, and both the inode numbers and the gzip header are
/// independent of the host so that packing the same tree twice produces the same bytes. The
/// source directory itself isn't part of the archive.
///
/// # Errors
///
/// If the tree can't be read, if a file is too large for the format, or if the output can't be
/// written
pub fn pack(source: &Path, output: &Path, level: Compression) -> Result<(), PackError> {
    info!("Packing {} into {}", source.display(), output.display());

    let metadata = fs::metadata(source).map_err(unreadable(source))?;
    if !metadata.is_dir() {
        return Err(PackError::SourceUnreadable {
            path: source.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "Not a directory"),
        });
    }

    let file = File::create(output).map_err(io_error(output))?;
    let encoder: GzEncoder<BufWriter<File>> = GzBuilder::new()
        .mtime(0)
        .write(BufWriter::new(file), level);

    let mut writer = NewcWriter::new(encoder);
    let count = pack_tree(source, output, &mut writer)?;

    let mut buffered = writer
        .finish()
        .and_then(GzEncoder::finish)
        .map_err(io_error(output))?;
    buffered.flush().map_err(io_error(output))?;

    debug!("Packed {count} entries");
    Ok(())
}
