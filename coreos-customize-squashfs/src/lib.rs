#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

use std::{
    ffi::OsStr,
    fs, io,
    os::unix::fs::{MetadataExt as _, PermissionsExt as _},
    path::Path,
    process::{Command, Output},
};

use log::{debug, info, trace, warn};
use nix::unistd::{chown, Gid, Uid};
use types::{FilesystemImageRebuilder, RebuildError};
use walkdir::WalkDir;

mod merge;

use merge::{set_mtime, validate_mount_path, Merger};

const UNSQUASHFS: &str = "unsquashfs";
const MKSQUASHFS: &str = "mksquashfs";

const STAGING_PREFIX: &str = ".squashfs-rebuild-";
const STAGING_ROOT: &str = "root";
const STAGING_IMAGE: &str = "image.squashfs";

fn io_error(path: &Path) -> impl Fn(io::Error) -> RebuildError + '_ {
    move |source| RebuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn run(tool: &'static str, command: &mut Command) -> Result<Output, RebuildError> {
    debug!(
        "Running {tool} {}",
        command
            .get_args()
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    );

    let output = command
        .output()
        .map_err(|source| RebuildError::Tool { tool, source })?;

    if !output.status.success() {
        return Err(RebuildError::ToolFailed {
            tool,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }

    Ok(output)
}

/// Settings of an existing image that we carry over to the rebuilt one
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Superblock {
    /// Compressor name, as understood by `mksquashfs -comp`
    pub compression: Option<String>,

    /// Non-default compressor options, as `mksquashfs` arguments
    pub compressor_options: Vec<String>,

    /// Data block size, in bytes
    pub block_size: Option<u32>,
}

/// Maps a compressor option line of `unsquashfs -s` to the matching `mksquashfs` arguments
fn compressor_option(line: &str) -> Option<[String; 2]> {
    const OPTIONS: [(&str, &str); 4] = [
        ("compression-level ", "-Xcompression-level"),
        ("window-size ", "-Xwindow-size"),
        ("Dictionary size ", "-Xdict-size"),
        ("Filters selected: ", "-Xbcj"),
    ];

    OPTIONS.iter().find_map(|(prefix, arg)| {
        let value = line.strip_prefix(prefix)?;
        let value = value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect::<Vec<_>>()
            .join(",");

        Some([(*arg).to_owned(), value])
    })
}

impl Superblock {
    /// Parses the output of `unsquashfs -s`
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let mut superblock = Self::default();

        for line in output.lines() {
            if let Some(comp) = line.strip_prefix("Compression ") {
                superblock.compression = Some(comp.trim().to_owned());
            } else if let Some(size) = line.strip_prefix("Block size ") {
                superblock.block_size = size.trim().parse().ok();
            } else if let Some(option) = line.strip_prefix('\t') {
                if let Some(args) = compressor_option(option.trim()) {
                    superblock.compressor_options.extend(args);
                } else {
                    trace!("Ignoring compressor option {}", option.trim());
                }
            }
        }

        superblock
    }

    fn read(image: &Path) -> Result<Self, RebuildError> {
        let output = run(UNSQUASHFS, Command::new(UNSQUASHFS).arg("-s").arg(image))?;

        Ok(Self::parse(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Makes every directory of an unpacked image removable again
fn make_removable(root: &Path) -> Result<(), RebuildError> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| RebuildError::Io {
            path: e.path().unwrap_or(root).to_path_buf(),
            source: e.into(),
        })?;

        if !entry.file_type().is_dir() {
            continue;
        }

        let path = entry.path();
        let metadata = entry.metadata().map_err(|e| io_error(path)(e.into()))?;
        let mode = metadata.permissions().mode();

        if mode & 0o700 != 0o700 {
            fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o700))
                .map_err(io_error(path))?;
        }
    }

    Ok(())
}

/// [`FilesystemImageRebuilder`] for SquashFS images, built on top of `squashfs-tools`
#[derive(Clone, Debug, Default)]
pub struct SquashfsRebuilder {
    compression: Option<String>,
}

impl SquashfsRebuilder {
    /// Creates a new rebuilder
    ///
    /// The rebuilt image uses `compression` if set, and the compressor of the original image
    /// otherwise.
    #[must_use]
    pub fn new(compression: Option<String>) -> Self {
        Self { compression }
    }

    fn mksquashfs(
        &self,
        source: &Path,
        output: &Path,
        superblock: &Superblock,
        mkfs_time: i64,
    ) -> Result<(), RebuildError> {
        let mut command = Command::new(MKSQUASHFS);
        let mut command_ref = command
            .arg(source)
            .arg(output)
            .args(["-noappend", "-no-progress"]);

        match (&self.compression, &superblock.compression) {
            (Some(comp), original) if original.as_ref() != Some(comp) => {
                debug!("Using {comp} compression");

                command_ref = command_ref.args(["-comp", comp.as_str()]);
            }
            (_, Some(comp)) => {
                debug!("Using {comp} compression");

                command_ref = command_ref
                    .args(["-comp", comp.as_str()])
                    .args(&superblock.compressor_options);
            }
            (_, None) => {}
        }

        if let Some(block_size) = superblock.block_size {
            debug!("Using {block_size} bytes blocks");

            command_ref = command_ref.args(["-b", block_size.to_string().as_str()]);
        }

        let mkfs_time = mkfs_time.max(0).to_string();
        command_ref = command_ref.args(["-mkfs-time", mkfs_time.as_str()]);

        run(MKSQUASHFS, command_ref)?;
        Ok(())
    }

    fn rebuild_staged(
        &self,
        staging: &Path,
        image: &Path,
        resources: &Path,
        mount_path: &Path,
        image_metadata: &fs::Metadata,
    ) -> Result<(), RebuildError> {
        let superblock = Superblock::read(image)?;
        trace!(
            "Original image uses {} compression, {} bytes blocks",
            superblock.compression.as_deref().unwrap_or("default"),
            superblock
                .block_size
                .map_or_else(|| String::from("default"), |b| b.to_string())
        );

        let root = staging.join(STAGING_ROOT);
        let mut unsquashfs = Command::new(UNSQUASHFS);
        unsquashfs.args(["-no-progress", "-d"]).arg(&root);
        if !Uid::effective().is_root() {
            unsquashfs.arg("-no-xattrs");
        }
        run(UNSQUASHFS, unsquashfs.arg(image))?;

        let count = Merger::new(&root, image_metadata.mtime()).merge(resources, mount_path)?;
        debug!("Merged {count} resource entries");

        let rebuilt = staging.join(STAGING_IMAGE);
        self.mksquashfs(&root, &rebuilt, &superblock, image_metadata.mtime())?;

        fs::rename(&rebuilt, image).map_err(io_error(image))?;
        if Uid::effective().is_root() {
            chown(
                image,
                Some(Uid::from_raw(image_metadata.uid())),
                Some(Gid::from_raw(image_metadata.gid())),
            )
            .map_err(|errno| io_error(image)(errno.into()))?;
        }
        fs::set_permissions(image, image_metadata.permissions()).map_err(io_error(image))?;
        set_mtime(image, image_metadata.mtime()).map_err(io_error(image))
    }
}

impl FilesystemImageRebuilder for SquashfsRebuilder {
    fn rebuild(
        &self,
        image: &Path,
        resources: &Path,
        mount_path: &Path,
    ) -> Result<(), RebuildError> {
        info!(
            "Adding {} to {} under {}",
            resources.display(),
            image.display(),
            mount_path.display()
        );

        validate_mount_path(mount_path)?;

        let image_metadata = match fs::metadata(image) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Err(RebuildError::ImageNotFound(image.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RebuildError::ImageNotFound(image.to_path_buf()))
            }
            Err(e) => return Err(io_error(image)(e)),
        };

        fs::read_dir(resources).map_err(|source| RebuildError::ResourcesUnreadable {
            path: resources.to_path_buf(),
            source,
        })?;

        if !Uid::effective().is_root() {
            warn!("Not running as root, file ownership in the image will not be preserved");
        }

        let parent = image
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let parent_mtime = fs::metadata(parent).map_err(io_error(parent))?.mtime();

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(parent)
            .map_err(io_error(parent))?;
        debug!("Staging directory is {}", staging.path().display());

        let rebuilt = self.rebuild_staged(
            staging.path(),
            image,
            resources,
            mount_path,
            &image_metadata,
        );
        let removable = make_removable(staging.path());
        rebuilt?;
        removable?;

        let staging_path = staging.path().to_path_buf();
        staging.close().map_err(io_error(&staging_path))?;

        set_mtime(parent, parent_mtime).map_err(io_error(parent))?;

        info!("Rebuilt {}", image.display());
        Ok(())
    }
}
