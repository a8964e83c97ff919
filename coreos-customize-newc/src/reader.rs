use std::{
    ffi::OsString,
    io::{self, Read, Write},
    os::unix::ffi::OsStringExt as _,
    path::PathBuf,
};

use log::{debug, trace};

use crate::header::{padding, Header, HEADER_LEN, TRAILER_NAME};

/// Upper bound for an entry name, the kernel refuses anything longer than `PATH_MAX`
const MAX_NAME_LEN: u32 = 4096;

/// An archive entry, as returned by [`NewcReader::next_entry`]
#[derive(Clone, Debug)]
pub struct Entry {
    /// Entry path, as stored in the archive
    pub name: PathBuf,

    /// Entry metadata
    pub header: Header,
}

struct Pending {
    remaining: u64,
    padding: usize,
    sum: u32,
    check: Option<u32>,
}

/// Sequential reader over a newc archive
///
/// The reader stops at the trailer entry. Any data following the trailer is left untouched in
/// the underlying reader.
pub struct NewcReader<R>
where
    R: Read,
{
    inner: R,
    offset: u64,
    pending: Option<Pending>,
}

impl<R> NewcReader<R>
where
    R: Read,
{
    /// Creates a new reader, the archive starting at the current position of `inner`
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            pending: None,
        }
    }

    /// Returns the underlying reader
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("Archive truncated at offset {}", self.offset),
                )
            } else {
                e
            }
        })?;

        self.offset += buf.len() as u64;
        Ok(())
    }

    fn skip_padding(&mut self, len: usize) -> io::Result<()> {
        let mut pad = [0; 4];
        self.read_exact(&mut pad[..len])
    }

    /// Returns the next entry, or `None` once the trailer has been reached
    ///
    /// If the data of the previous entry hasn't been consumed, it is skipped.
    ///
    /// # Errors
    ///
    /// Returns an [`io::ErrorKind::InvalidData`] error if the archive is malformed, or
    /// [`io::ErrorKind::UnexpectedEof`] if it's truncated.
    pub fn next_entry(&mut self) -> io::Result<Option<Entry>> {
        if self.pending.is_some() {
            trace!("Skipping unread entry data");
            self.copy_data(&mut io::sink())?;
        }

        let mut raw = [0; HEADER_LEN];
        self.read_exact(&mut raw)?;

        let (header, name_size, crc) = Header::parse(&raw)?;
        if name_size == 0 || name_size > MAX_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Invalid name size {name_size}"),
            ));
        }

        let mut name = vec![0; name_size as usize];
        self.read_exact(&mut name)?;
        self.skip_padding(padding(HEADER_LEN as u64 + u64::from(name_size)))?;

        if name.pop() != Some(0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Entry name isn't NUL-terminated",
            ));
        }

        if name == TRAILER_NAME {
            debug!("Reached archive trailer at offset {}", self.offset);
            return Ok(None);
        }

        let name = PathBuf::from(OsString::from_vec(name));
        trace!("Entry {}: {header}", name.display());

        self.pending = Some(Pending {
            remaining: u64::from(header.file_size),
            padding: padding(u64::from(header.file_size)),
            sum: 0,
            check: crc.then_some(header.check),
        });

        Ok(Some(Entry { name, header }))
    }

    /// Copies the data of the current entry to `writer`
    ///
    /// # Errors
    ///
    /// If the archive can't be read, or if the checksum of the entry doesn't match
    pub fn copy_data<W>(&mut self, writer: &mut W) -> io::Result<u64>
    where
        W: Write + ?Sized,
    {
        let Some(mut pending) = self.pending.take() else {
            return Ok(0);
        };

        let mut buf = vec![0; 64 * 1024];
        let mut copied = 0;

        while pending.remaining > 0 {
            let len = usize::try_from(pending.remaining).map_or(buf.len(), |r| r.min(buf.len()));
            self.read_exact(&mut buf[..len])?;

            if pending.check.is_some() {
                pending.sum = buf[..len]
                    .iter()
                    .fold(pending.sum, |sum, b| sum.wrapping_add(u32::from(*b)));
            }

            writer.write_all(&buf[..len])?;
            pending.remaining -= len as u64;
            copied += len as u64;
        }

        self.skip_padding(pending.padding)?;

        if let Some(check) = pending.check {
            if check != pending.sum {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "Checksum mismatch: expected {check:#x}, got {:#x}",
                        pending.sum
                    ),
                ));
            }
        }

        Ok(copied)
    }

    /// Returns the data of the current entry
    ///
    /// # Errors
    ///
    /// If the archive can't be read, or if the checksum of the entry doesn't match
    pub fn read_data(&mut self) -> io::Result<Vec<u8>> {
        let mut data = Vec::new();
        self.copy_data(&mut data)?;

        Ok(data)
    }
}

impl<R> core::fmt::Debug for NewcReader<R>
where
    R: Read,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NewcReader")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}
