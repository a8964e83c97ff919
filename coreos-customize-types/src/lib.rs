#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

use std::{
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
};

/// Retrieves a remote artifact to a local file
pub trait Fetcher {
    /// Fetches the artifact named by `url` and writes it verbatim to `dest`, overwriting any
    /// existing file
    ///
    /// # Errors
    ///
    /// If the URL is invalid, the transfer fails, or the destination cannot be written
    fn fetch(&self, dest: &Path, url: &str) -> Result<(), FetchError>;
}

/// Unpacks a ramdisk container into a directory tree
pub trait ArchiveExtractor {
    /// Extracts the container at `container` into `dest`, which must be empty or absent
    ///
    /// # Errors
    ///
    /// If the container is malformed or unreadable, or if `dest` cannot be written
    fn extract(&self, container: &Path, dest: &Path) -> Result<(), ExtractError>;
}

/// Regenerates a compressed filesystem image with extra files in it
pub trait FilesystemImageRebuilder {
    /// Rebuilds the image at `image` so that it also contains every file of `resources`,
    /// placed under `mount_path` relative to the image root
    ///
    /// # Errors
    ///
    /// If the image or the resources are unreadable, or if building the new image fails
    fn rebuild(&self, image: &Path, resources: &Path, mount_path: &Path)
        -> Result<(), RebuildError>;
}

/// Packs a directory tree into a ramdisk container
pub trait ArchivePacker {
    /// Packs the tree rooted at `source` into a container written at `output`
    ///
    /// # Errors
    ///
    /// If `source` is missing or unreadable, or if `output` cannot be written
    fn pack(&self, source: &Path, output: &Path) -> Result<(), PackError>;
}

/// Error raised while retrieving an artifact
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    /// The source URL couldn't be parsed
    #[error("Invalid URL \"{url}\"")]
    InvalidUrl {
        /// URL as given by the caller
        url: String,

        /// Parser error
        #[source]
        source: url::ParseError,
    },

    /// The source URL uses a scheme we don't know how to retrieve
    #[error("Unsupported URL scheme \"{0}\"")]
    UnsupportedScheme(String),

    /// An error has occurred when connecting to the remote server
    #[error("Connection Failure")]
    Connection(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("Download of {url} failed with status {status}")]
    Status {
        /// URL that was requested
        url: String,

        /// HTTP status code returned by the server
        status: u16,
    },

    /// An error has occurred when accessing the local files
    #[error("I/O Error on {}", .path.display())]
    Io {
        /// File being read or written
        path: PathBuf,

        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Error raised while unpacking a ramdisk container
#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    /// The container is not a valid archive
    #[error("Malformed container: {0}")]
    Malformed(String),

    /// The container is compressed with an algorithm we don't support
    #[error("Unsupported container compression: {0}")]
    UnsupportedCompression(&'static str),

    /// An archive entry would land outside of the destination directory
    #[error("Archive entry {} escapes the destination directory", .0.display())]
    UnsafePath(PathBuf),

    /// The destination directory already has some content
    #[error("Destination directory {} isn't empty", .0.display())]
    DestinationNotEmpty(PathBuf),

    /// An error has occurred when accessing the local files
    #[error("I/O Error on {}", .path.display())]
    Io {
        /// File being read or written
        path: PathBuf,

        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Error raised while rebuilding the embedded filesystem image
#[derive(thiserror::Error, Debug)]
pub enum RebuildError {
    /// The filesystem image couldn't be found
    #[error("Filesystem image {} not found", .0.display())]
    ImageNotFound(PathBuf),

    /// The mount path isn't a plain relative path
    #[error("Invalid mount path {}", .0.display())]
    InvalidMountPath(PathBuf),

    /// The image path isn't a plain relative path
    #[error("Invalid image path {}", .0.display())]
    InvalidImagePath(PathBuf),

    /// The resources directory (or one of its entries) couldn't be read
    #[error("Couldn't read resources at {}", .path.display())]
    ResourcesUnreadable {
        /// Resource path that failed
        path: PathBuf,

        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A resource entry is neither a file, a directory nor a symbolic link
    #[error("Unsupported resource file type for {}", .0.display())]
    UnsupportedResource(PathBuf),

    /// An external tool couldn't be started
    #[error("Couldn't run {tool}")]
    Tool {
        /// Tool name
        tool: &'static str,

        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// An external tool exited with an error
    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        /// Tool name
        tool: &'static str,

        /// Exit status of the tool
        status: ExitStatus,

        /// Standard error output of the tool
        stderr: String,
    },

    /// An error has occurred when accessing the local files
    #[error("I/O Error on {}", .path.display())]
    Io {
        /// File being read or written
        path: PathBuf,

        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Error raised while packing a ramdisk container
#[derive(thiserror::Error, Debug)]
pub enum PackError {
    /// The source tree is missing or can't be read
    #[error("Couldn't read source tree at {}", .path.display())]
    SourceUnreadable {
        /// Source path that failed
        path: PathBuf,

        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// A file is too large to be stored in the container
    #[error("{} is too large for the container format", .0.display())]
    EntryTooLarge(PathBuf),

    /// An error has occurred when writing the container
    #[error("I/O Error on {}", .path.display())]
    Io {
        /// File being written
        path: PathBuf,

        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// An input path couldn't be made absolute
#[derive(thiserror::Error, Debug)]
#[error("Couldn't resolve path \"{path}\"")]
pub struct PathResolutionError {
    /// Path as given by the caller
    pub path: String,

    /// Underlying error
    #[source]
    pub source: io::Error,
}

/// Error raised by an image build
///
/// Step errors are forwarded untouched.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    /// An input path couldn't be resolved
    #[error(transparent)]
    PathResolution(#[from] PathResolutionError),

    /// The working directory couldn't be created
    #[error("Couldn't create the working directory")]
    WorkDir(#[source] io::Error),

    /// A download failed
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Unpacking the ramdisk failed
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// Rebuilding the filesystem image failed
    #[error(transparent)]
    Rebuild(#[from] RebuildError),

    /// Packing the ramdisk failed
    #[error(transparent)]
    Pack(#[from] PackError),

    /// The working directory couldn't be removed after a successful build
    #[error("Couldn't remove the working directory")]
    Cleanup(#[source] io::Error),
}
