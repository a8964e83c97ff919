use core::cmp::Reverse;
use std::{
    collections::HashMap,
    ffi::OsStr,
    fs::{self, File},
    io::{self, BufRead, BufReader, Read},
    os::unix::{ffi::OsStrExt as _, fs as unix_fs, fs::PermissionsExt as _},
    path::{Component, Path, PathBuf},
};

use flate2::bufread::GzDecoder;
use log::{debug, info, trace, warn};
use nix::{
    sys::{
        stat::{lutimes, makedev, mknod, Mode, SFlag},
        time::{TimeVal, TimeValLike as _},
    },
    unistd::Uid,
};
use types::ExtractError;

use crate::{
    header::{FileType, Header},
    reader::{Entry, NewcReader},
};

fn archive_error(container: &Path) -> impl Fn(io::Error) -> ExtractError + '_ {
    move |e| match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            ExtractError::Malformed(e.to_string())
        }
        _ => ExtractError::Io {
            path: container.to_path_buf(),
            source: e,
        },
    }
}

fn io_error(path: &Path) -> impl Fn(io::Error) -> ExtractError + '_ {
    move |source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    }
}

enum Segment {
    Newc,
    Gzip,
}

fn detect_segment(buf: &[u8]) -> Result<Segment, ExtractError> {
    // Both newc magics start with an ASCII digit, the header parser checks the rest
    if buf.first() == Some(&b'0') {
        return Ok(Segment::Newc);
    }

    match infer::get(buf) {
        Some(kind) if kind.mime_type() == "application/gzip" => Ok(Segment::Gzip),
        Some(kind) => Err(ExtractError::UnsupportedCompression(kind.extension())),
        None => Err(ExtractError::Malformed(format!(
            "Unknown data at the start of a segment: {}",
            buf.iter()
                .take(8)
                .map(|b| format!("{b:02x}"))
                .collect::<String>()
        ))),
    }
}

/// Consumes the NUL bytes padding segments, returns false once the end of the stream is reached
fn skip_nul_padding<R>(reader: &mut R) -> io::Result<bool>
where
    R: BufRead + ?Sized,
{
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(false);
        }

        let zeros = buf.iter().take_while(|b| **b == 0).count();
        let len = buf.len();
        reader.consume(zeros);

        if zeros < len {
            return Ok(true);
        }
    }
}

/// Returns the path of an entry relative to the extraction root, `None` being the root itself
fn sanitize(name: &Path) -> Result<Option<PathBuf>, ExtractError> {
    let mut relative = PathBuf::new();

    for component in name.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(c) => relative.push(c),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(ExtractError::UnsafePath(name.to_path_buf()))
            }
        }
    }

    Ok((!relative.as_os_str().is_empty()).then_some(relative))
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[derive(Debug)]
struct TreeWriter<'a> {
    root: &'a Path,
    restore_owner: bool,
    links: HashMap<(u32, u32, u32), PathBuf>,
    pending: Vec<(PathBuf, Header)>,
}

impl<'a> TreeWriter<'a> {
    fn new(root: &'a Path) -> Self {
        let restore_owner = Uid::effective().is_root();
        if !restore_owner {
            warn!("Not running as root, files will be owned by the current user");
        }

        Self {
            root,
            restore_owner,
            links: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Creates the parent directories of `relative`, refusing to go through symbolic links
    fn prepare_parent(&self, relative: &Path) -> Result<PathBuf, ExtractError> {
        let mut current = self.root.to_path_buf();

        if let Some(parent) = relative.parent() {
            for component in parent.components() {
                current.push(component);

                match fs::symlink_metadata(&current) {
                    Ok(m) if m.is_dir() => {}
                    Ok(_) => return Err(ExtractError::UnsafePath(relative.to_path_buf())),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        trace!("Creating missing directory {}", current.display());
                        fs::create_dir(&current).map_err(io_error(&current))?;
                    }
                    Err(e) => return Err(io_error(&current)(e)),
                }
            }
        }

        Ok(self.root.join(relative))
    }

    fn write_entry<R>(
        &mut self,
        reader: &mut NewcReader<R>,
        container: &Path,
        entry: &Entry,
    ) -> Result<(), ExtractError>
    where
        R: Read,
    {
        let header = &entry.header;
        let Some(relative) = sanitize(&entry.name)? else {
            debug!("Found root directory entry");
            self.pending.push((self.root.to_path_buf(), header.clone()));
            return Ok(());
        };

        let file_type = header.file_type().ok_or_else(|| {
            ExtractError::Malformed(format!(
                "Invalid mode {:o} for {}",
                header.mode,
                entry.name.display()
            ))
        })?;

        let path = self.prepare_parent(&relative)?;

        match file_type {
            FileType::Directory => match fs::symlink_metadata(&path) {
                Ok(m) if m.is_dir() => {}
                Ok(_) => {
                    remove_existing(&path).map_err(io_error(&path))?;
                    fs::create_dir(&path).map_err(io_error(&path))?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&path).map_err(io_error(&path))?;
                }
                Err(e) => return Err(io_error(&path)(e)),
            },
            FileType::Regular => self.write_file(reader, container, header, &path)?,
            FileType::Symlink => {
                let target = reader.read_data().map_err(archive_error(container))?;

                remove_existing(&path).map_err(io_error(&path))?;
                unix_fs::symlink(OsStr::from_bytes(&target), &path)
                    .map_err(io_error(&path))?;
            }
            FileType::CharDevice
            | FileType::BlockDevice
            | FileType::Fifo
            | FileType::Socket => {
                remove_existing(&path).map_err(io_error(&path))?;

                mknod(
                    &path,
                    SFlag::from_bits_truncate(file_type.mode_bits()),
                    Mode::from_bits_truncate(header.permissions()),
                    makedev(header.rdev_major.into(), header.rdev_minor.into()),
                )
                .map_err(|errno| io_error(&path)(errno.into()))?;
            }
        }

        self.pending.push((path, header.clone()));
        Ok(())
    }

    fn write_file<R>(
        &mut self,
        reader: &mut NewcReader<R>,
        container: &Path,
        header: &Header,
        path: &Path,
    ) -> Result<(), ExtractError>
    where
        R: Read,
    {
        if header.nlink > 1 {
            let key = (header.ino, header.dev_major, header.dev_minor);

            if let Some(target) = self.links.get(&key) {
                if target != path {
                    trace!("{} is a hard link to {}", path.display(), target.display());

                    remove_existing(path).map_err(io_error(path))?;
                    fs::hard_link(target, path).map_err(io_error(path))?;
                }

                // The data may come with any of the links
                if header.file_size > 0 {
                    let mut file = File::options()
                        .write(true)
                        .truncate(true)
                        .open(path)
                        .map_err(io_error(path))?;

                    reader
                        .copy_data(&mut file)
                        .map_err(archive_error(container))?;
                }

                return Ok(());
            }

            self.links.insert(key, path.to_path_buf());
        }

        remove_existing(path).map_err(io_error(path))?;

        let mut file = File::create(path).map_err(io_error(path))?;
        reader
            .copy_data(&mut file)
            .map_err(archive_error(container))?;

        Ok(())
    }

    fn apply_metadata(&self, path: &Path, header: &Header) -> io::Result<()> {
        let mtime = TimeVal::seconds(i64::from(header.mtime));
        lutimes(path, &mtime, &mtime)?;

        if self.restore_owner {
            unix_fs::lchown(path, Some(header.uid), Some(header.gid))?;
        }

        if header.file_type() != Some(FileType::Symlink) {
            fs::set_permissions(path, fs::Permissions::from_mode(header.permissions()))?;
        }

        Ok(())
    }

    /// Applies the metadata once all the content is in place, directories last and deepest first
    fn finish(self) -> Result<(), ExtractError> {
        let (mut dirs, others): (Vec<_>, Vec<_>) = self
            .pending
            .iter()
            .partition(|(_, h)| h.file_type() == Some(FileType::Directory));

        dirs.sort_by_key(|(path, _)| Reverse(path.components().count()));

        for (path, header) in others.into_iter().chain(dirs) {
            self.apply_metadata(path, header).map_err(io_error(path))?;
        }

        Ok(())
    }

    /// Extracts all the entries of one archive, up to its trailer
    fn write_archive<R>(&mut self, reader: R, container: &Path) -> Result<R, ExtractError>
    where
        R: Read,
    {
        let mut reader = NewcReader::new(reader);
        let mut count = 0_usize;

        while let Some(entry) = reader.next_entry().map_err(archive_error(container))? {
            self.write_entry(&mut reader, container, &entry)?;
            count += 1;
        }

        debug!("Extracted {count} entries");

        // Inode numbers are only meaningful within a single archive
        self.links.clear();

        Ok(reader.into_inner())
    }

    /// Extracts every archive found in a decompressed stream
    fn write_archives<R>(&mut self, mut reader: R, container: &Path) -> Result<(), ExtractError>
    where
        R: BufRead,
    {
        while skip_nul_padding(&mut reader).map_err(archive_error(container))? {
            let magic = reader.fill_buf().map_err(archive_error(container))?;
            if !matches!(detect_segment(magic)?, Segment::Newc) {
                return Err(ExtractError::Malformed(String::from(
                    "Compressed data nested in a compressed segment",
                )));
            }

            reader = self.write_archive(reader, container)?;
        }

        Ok(())
    }
}

fn prepare_destination(dest: &Path) -> Result<(), ExtractError> {
    match fs::read_dir(dest) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(ExtractError::DestinationNotEmpty(dest.to_path_buf()));
            }

            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Creating destination directory {}", dest.display());
            fs::create_dir_all(dest).map_err(io_error(dest))
        }
        Err(e) => Err(io_error(dest)(e)),
    }
}

/// Extracts a ramdisk container into a directory
///
/// The container is a sequence of newc archives, each of them either uncompressed or compressed
/// with gzip, possibly separated by NUL bytes. `dest` must be empty or not exist.
///
/// # Errors
///
/// If the container can't be read or is malformed, or if the tree can't be created
pub fn extract(container: &Path, dest: &Path) -> Result<(), ExtractError> {
    info!(
        "Extracting {} into {}",
        container.display(),
        dest.display()
    );

    let file = File::open(container).map_err(io_error(container))?;
    prepare_destination(dest)?;

    let mut input = BufReader::new(file);
    let mut tree = TreeWriter::new(dest);
    let mut segments = 0_usize;

    while skip_nul_padding(&mut input).map_err(archive_error(container))? {
        let magic = input.fill_buf().map_err(archive_error(container))?;

        match detect_segment(magic)? {
            Segment::Newc => {
                debug!("Found an uncompressed archive");
                input = tree.write_archive(input, container)?;
            }
            Segment::Gzip => {
                debug!("Found a gzip compressed segment");

                let mut decoder = BufReader::new(GzDecoder::new(&mut input));
                tree.write_archives(&mut decoder, container)?;
            }
        }

        segments += 1;
    }

    if segments == 0 {
        return Err(ExtractError::Malformed(String::from("Empty container")));
    }

    tree.finish()?;

    info!("Extracted {segments} segment(s)");
    Ok(())
}
