use core::fmt;
use std::io::{self, Write};

pub(crate) const NEWC_MAGIC: &[u8; MAGIC_LEN] = b"070701";
pub(crate) const NEWC_CRC_MAGIC: &[u8; MAGIC_LEN] = b"070702";
pub(crate) const MAGIC_LEN: usize = 6;
pub(crate) const HEADER_LEN: usize = 110;
pub(crate) const TRAILER_NAME: &[u8] = b"TRAILER!!!";

const FIELD_LEN: usize = 8;

const S_IFMT: u32 = 0o170_000;
const S_IFSOCK: u32 = 0o140_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFREG: u32 = 0o100_000;
const S_IFBLK: u32 = 0o060_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFCHR: u32 = 0o020_000;
const S_IFIFO: u32 = 0o010_000;

/// Kind of file an archive entry describes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    /// Regular File
    Regular,

    /// Directory
    Directory,

    /// Symbolic Link, its target being stored as the entry data
    Symlink,

    /// Character Device
    CharDevice,

    /// Block Device
    BlockDevice,

    /// Named Pipe
    Fifo,

    /// Unix Socket
    Socket,
}

impl FileType {
    /// Returns the `S_IFMT` bits for that file type
    #[must_use]
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::Regular => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::Symlink => S_IFLNK,
            Self::CharDevice => S_IFCHR,
            Self::BlockDevice => S_IFBLK,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
        }
    }

    fn from_mode(mode: u32) -> Option<Self> {
        Some(match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            S_IFCHR => Self::CharDevice,
            S_IFBLK => Self::BlockDevice,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Socket,
            _ => return None,
        })
    }
}

/// Header of a newc archive entry
///
/// All the fields are stored as 8 hexadecimal ASCII characters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Header {
    /// Inode Number, shared by all the hard links to a file
    pub ino: u32,

    /// File Type and Permission Bits
    pub mode: u32,

    /// Owner User ID
    pub uid: u32,

    /// Owner Group ID
    pub gid: u32,

    /// Number of Links
    pub nlink: u32,

    /// Modification Time, in seconds since the Epoch
    pub mtime: u32,

    /// Size of the entry data
    pub file_size: u32,

    /// Major Number of the device holding the file
    pub dev_major: u32,

    /// Minor Number of the device holding the file
    pub dev_minor: u32,

    /// Major Number of a device file
    pub rdev_major: u32,

    /// Minor Number of a device file
    pub rdev_minor: u32,

    /// Sum of all the data bytes, for the CRC variant of the format
    pub check: u32,
}

impl Header {
    /// Returns the file type encoded in the mode, if it's a valid one
    #[must_use]
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.mode)
    }

    /// Returns the permission bits of the entry
    #[must_use]
    pub fn permissions(&self) -> u32 {
        self.mode & !S_IFMT
    }

    pub(crate) fn parse(raw: &[u8; HEADER_LEN]) -> Result<(Self, u32, bool), io::Error> {
        let magic = &raw[..MAGIC_LEN];
        let crc = if magic == NEWC_MAGIC {
            false
        } else if magic == NEWC_CRC_MAGIC {
            true
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Invalid entry magic \"{}\"",
                    String::from_utf8_lossy(magic)
                ),
            ));
        };

        let mut fields = raw[MAGIC_LEN..]
            .chunks_exact(FIELD_LEN)
            .map(parse_hex);

        let mut next = || {
            fields.next().unwrap_or_else(|| {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Truncated entry header",
                ))
            })
        };

        let header = Self {
            ino: next()?,
            mode: next()?,
            uid: next()?,
            gid: next()?,
            nlink: next()?,
            mtime: next()?,
            file_size: next()?,
            dev_major: next()?,
            dev_minor: next()?,
            rdev_major: next()?,
            rdev_minor: next()?,
            check: 0,
        };

        let name_size = next()?;
        let check = next()?;

        Ok((Self { check, ..header }, name_size, crc))
    }

    pub(crate) fn write<W: Write>(&self, writer: &mut W, name_size: u32) -> io::Result<()> {
        writer.write_all(NEWC_MAGIC)?;

        for field in [
            self.ino,
            self.mode,
            self.uid,
            self.gid,
            self.nlink,
            self.mtime,
            self.file_size,
            self.dev_major,
            self.dev_minor,
            self.rdev_major,
            self.rdev_minor,
            name_size,
            0,
        ] {
            write!(writer, "{field:08x}")?;
        }

        Ok(())
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mode {:o}, uid {}, gid {}, ino {}, nlink {}, size {}",
            self.mode, self.uid, self.gid, self.ino, self.nlink, self.file_size
        )
    }
}

fn parse_hex(field: &[u8]) -> Result<u32, io::Error> {
    let invalid = || {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Invalid header field \"{}\"",
                String::from_utf8_lossy(field)
            ),
        )
    };

    let s = core::str::from_utf8(field).map_err(|_err| invalid())?;
    u32::from_str_radix(s, 16).map_err(|_err| invalid())
}

/// Returns the number of padding bytes needed to align `len` on 4 bytes
pub(crate) fn padding(len: u64) -> usize {
    // The result is always lower than 4
    #[allow(clippy::cast_possible_truncation)]
    let pad = ((4 - (len % 4)) % 4) as usize;

    pad
}
