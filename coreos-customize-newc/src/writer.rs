use std::io::{self, Read, Write};

use log::trace;

use crate::header::{padding, Header, HEADER_LEN, TRAILER_NAME};

const NUL_PADDING: [u8; 4] = [0; 4];

/// Sequential writer of a newc archive
pub struct NewcWriter<W>
where
    W: Write,
{
    inner: W,
    offset: u64,
}

impl<W> NewcWriter<W>
where
    W: Write,
{
    /// Creates a new writer
    pub fn new(inner: W) -> Self {
        Self { inner, offset: 0 }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf)?;
        self.offset += buf.len() as u64;

        Ok(())
    }

    fn pad(&mut self) -> io::Result<()> {
        let len = padding(self.offset);
        self.write_all(&NUL_PADDING[..len])
    }

    fn write_header(&mut self, name: &[u8], header: &Header) -> io::Result<()> {
        let name_size = u32::try_from(name.len() + 1)
            .map_err(|_err| io::Error::new(io::ErrorKind::InvalidInput, "Name too long"))?;

        let mut raw = Vec::with_capacity(HEADER_LEN);
        header.write(&mut raw, name_size)?;

        self.write_all(&raw)?;
        self.write_all(name)?;
        self.write_all(&[0])?;
        self.pad()
    }

    /// Adds an entry to the archive
    ///
    /// `data` must provide exactly `header.file_size` bytes.
    ///
    /// # Errors
    ///
    /// If writing fails, or if `data` doesn't provide the expected number of bytes
    pub fn write_entry<R>(&mut self, name: &[u8], header: &Header, data: &mut R) -> io::Result<()>
    where
        R: Read + ?Sized,
    {
        trace!("Writing entry {}: {header}", String::from_utf8_lossy(name));

        self.write_header(name, header)?;

        let expected = u64::from(header.file_size);
        let copied = io::copy(&mut data.take(expected), &mut self.inner)?;
        self.offset += copied;

        if copied != expected {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Entry {} is {copied} bytes long, expected {expected}",
                    String::from_utf8_lossy(name)
                ),
            ));
        }

        self.pad()
    }

    /// Writes the trailer entry and returns the underlying writer
    ///
    /// # Errors
    ///
    /// If writing the trailer fails
    pub fn finish(mut self) -> io::Result<W> {
        self.write_header(TRAILER_NAME, &Header::default())?;
        self.inner.flush()?;

        Ok(self.inner)
    }
}

impl<W> core::fmt::Debug for NewcWriter<W>
where
    W: Write,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NewcWriter")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}
