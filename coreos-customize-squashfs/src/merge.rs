use std::{
    fs, io,
    os::unix::fs::{symlink, MetadataExt as _, PermissionsExt as _},
    path::{Component, Path, PathBuf},
};

use log::{debug, trace};
use nix::sys::{
    stat::lutimes,
    time::{TimeVal, TimeValLike as _},
};
use types::RebuildError;
use walkdir::WalkDir;

const OWNER_RWX: u32 = 0o700;
const CREATED_DIR_MODE: u32 = 0o755;

fn io_error(path: &Path) -> impl Fn(io::Error) -> RebuildError + '_ {
    move |source| RebuildError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn unreadable(path: &Path) -> impl Fn(io::Error) -> RebuildError + '_ {
    move |source| RebuildError::ResourcesUnreadable {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn set_mtime(path: &Path, mtime: i64) -> io::Result<()> {
    let time = TimeVal::seconds(mtime);
    lutimes(path, &time, &time)?;

    Ok(())
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Checks that a mount path only has plain components, so that it can't leave the image root
pub(crate) fn validate_mount_path(mount_path: &Path) -> Result<(), RebuildError> {
    let valid = mount_path.components().next().is_some()
        && mount_path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));

    if valid {
        Ok(())
    } else {
        Err(RebuildError::InvalidMountPath(mount_path.to_path_buf()))
    }
}

/// Directory whose final mode and modification time are set once everything below is in place
#[derive(Debug)]
struct DirFixup {
    path: PathBuf,
    mode: u32,
    mtime: i64,
}

/// Copies a resources tree into an unpacked image
///
/// Existing directories that get written to keep their mode and modification time. Directories
/// created along the mount path get the `mtime` given at creation.
#[derive(Debug)]
pub(crate) struct Merger<'a> {
    root: &'a Path,
    mtime: i64,
    fixups: Vec<DirFixup>,
}

impl<'a> Merger<'a> {
    pub(crate) fn new(root: &'a Path, mtime: i64) -> Self {
        Self {
            root,
            mtime,
            fixups: Vec::new(),
        }
    }

    /// Makes an existing directory writable, remembering how to restore it
    fn open_dir(&mut self, path: &Path, metadata: &fs::Metadata) -> Result<(), RebuildError> {
        let mode = metadata.permissions().mode() & 0o7777;

        if mode & OWNER_RWX != OWNER_RWX {
            trace!("Making {} temporarily writable", path.display());

            fs::set_permissions(path, fs::Permissions::from_mode(mode | OWNER_RWX))
                .map_err(io_error(path))?;
        }

        self.fixups.push(DirFixup {
            path: path.to_path_buf(),
            mode,
            mtime: metadata.mtime(),
        });

        Ok(())
    }

    fn create_dir(&mut self, path: &Path, mode: u32, mtime: i64) -> Result<(), RebuildError> {
        remove_existing(path).map_err(io_error(path))?;
        fs::create_dir(path).map_err(io_error(path))?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode | OWNER_RWX))
            .map_err(io_error(path))?;

        self.fixups.push(DirFixup {
            path: path.to_path_buf(),
            mode,
            mtime,
        });

        Ok(())
    }

    /// Creates the directories leading to the mount path, and returns it
    fn prepare_mount_path(&mut self, mount_path: &Path) -> Result<PathBuf, RebuildError> {
        let mut current = self.root.to_path_buf();

        // The image root is written to as well when the mount path is a single component
        let metadata = fs::symlink_metadata(&current).map_err(io_error(&current))?;
        self.open_dir(&current, &metadata)?;

        for component in mount_path.components() {
            current.push(component);

            match fs::symlink_metadata(&current) {
                Ok(m) if m.is_dir() => self.open_dir(&current, &m)?,
                Ok(_) => {
                    debug!("Replacing {} by a directory", current.display());
                    self.create_dir(&current, CREATED_DIR_MODE, self.mtime)?;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("Creating {}", current.display());
                    self.create_dir(&current, CREATED_DIR_MODE, self.mtime)?;
                }
                Err(e) => return Err(io_error(&current)(e)),
            }
        }

        Ok(current)
    }

    fn copy_entry(
        &mut self,
        source: &Path,
        dest: &Path,
        metadata: &fs::Metadata,
    ) -> Result<(), RebuildError> {
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            match fs::symlink_metadata(dest) {
                Ok(m) if m.is_dir() => {
                    trace!("Merging into existing directory {}", dest.display());

                    self.open_dir(dest, &m)?;
                    if let Some(fixup) = self.fixups.last_mut() {
                        fixup.mode = metadata.permissions().mode() & 0o7777;
                        fixup.mtime = metadata.mtime();
                    }
                }
                _ => {
                    let mode = metadata.permissions().mode() & 0o7777;
                    self.create_dir(dest, mode, metadata.mtime())?;
                }
            }

            return Ok(());
        }

        if file_type.is_file() {
            trace!("Copying {} to {}", source.display(), dest.display());

            let mut reader = fs::File::open(source).map_err(unreadable(source))?;
            remove_existing(dest).map_err(io_error(dest))?;

            let mut writer = fs::File::create(dest).map_err(io_error(dest))?;
            io::copy(&mut reader, &mut writer).map_err(io_error(dest))?;
            drop(writer);

            fs::set_permissions(dest, metadata.permissions()).map_err(io_error(dest))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(source).map_err(unreadable(source))?;
            trace!("Linking {} to {}", dest.display(), target.display());

            remove_existing(dest).map_err(io_error(dest))?;
            symlink(&target, dest).map_err(io_error(dest))?;
        } else {
            return Err(RebuildError::UnsupportedResource(source.to_path_buf()));
        }

        set_mtime(dest, metadata.mtime()).map_err(io_error(dest))
    }

    /// Copies every entry of `resources` under `mount_path`, resources winning over the image
    ///
    /// The image tree is left alone if there's nothing to copy.
    pub(crate) fn merge(
        mut self,
        resources: &Path,
        mount_path: &Path,
    ) -> Result<usize, RebuildError> {
        let entries = WalkDir::new(resources)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                let path = e.path().unwrap_or(resources).to_path_buf();
                RebuildError::ResourcesUnreadable {
                    path,
                    source: e.into(),
                }
            })?;

        if entries.is_empty() {
            debug!("No resources in {}", resources.display());
            return Ok(0);
        }

        let target = self.prepare_mount_path(mount_path)?;

        for entry in &entries {
            let source = entry.path();
            let relative = source
                .strip_prefix(resources)
                .map_err(|_err| RebuildError::UnsupportedResource(source.to_path_buf()))?;
            let metadata = entry.metadata().map_err(|e| unreadable(source)(e.into()))?;

            self.copy_entry(source, &target.join(relative), &metadata)?;
        }

        for fixup in self.fixups.iter().rev() {
            fs::set_permissions(&fixup.path, fs::Permissions::from_mode(fixup.mode))
                .map_err(io_error(&fixup.path))?;
            set_mtime(&fixup.path, fixup.mtime).map_err(io_error(&fixup.path))?;
        }

        Ok(entries.len())
    }
}

#[cfg(test)]
mod merge_test {
    use std::{
        fs,
        os::unix::fs::{symlink, MetadataExt as _, PermissionsExt as _},
        path::{Path, PathBuf},
    };

    use nix::{sys::stat::Mode, unistd::mkfifo};
    use tempfile::TempDir;
    use test_log::test;
    use types::RebuildError;

    use crate::merge::{set_mtime, validate_mount_path, Merger};

    const IMAGE_MTIME: i64 = 1_700_000_000;

    fn image_tree(dir: &Path) -> PathBuf {
        let root = dir.join("root");

        fs::create_dir_all(root.join("share/oem")).unwrap();
        fs::write(root.join("share/oem/base.ign"), b"original").unwrap();
        fs::write(root.join("share/oem/keep.txt"), b"untouched").unwrap();
        set_mtime(&root.join("share/oem"), 1_000).unwrap();
        set_mtime(&root.join("share"), 2_000).unwrap();

        root
    }

    #[test]
    fn test_validate_mount_path() {
        validate_mount_path(Path::new("share/oem")).unwrap();
        validate_mount_path(Path::new("oem")).unwrap();

        for path in ["", "/share/oem", "../oem", "share/../oem", "./oem"] {
            let err = validate_mount_path(Path::new(path)).unwrap_err();
            assert!(
                matches!(err, RebuildError::InvalidMountPath(_)),
                "Unexpected error {err:?}"
            );
        }
    }

    #[test]
    fn test_resources_win() {
        let dir = TempDir::new().unwrap();
        let root = image_tree(dir.path());

        let resources = dir.path().join("resources");
        fs::create_dir_all(resources.join("sub")).unwrap();
        fs::write(resources.join("base.ign"), b"custom").unwrap();
        fs::write(resources.join("sub/hello.txt"), b"hello").unwrap();

        let count = Merger::new(&root, IMAGE_MTIME)
            .merge(&resources, Path::new("share/oem"))
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(fs::read(root.join("share/oem/base.ign")).unwrap(), b"custom");
        assert_eq!(fs::read(root.join("share/oem/keep.txt")).unwrap(), b"untouched");
        assert_eq!(fs::read(root.join("share/oem/sub/hello.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_existing_dirs_keep_metadata() {
        let dir = TempDir::new().unwrap();
        let root = image_tree(dir.path());
        fs::set_permissions(root.join("share"), fs::Permissions::from_mode(0o555)).unwrap();

        let resources = dir.path().join("resources");
        fs::create_dir(&resources).unwrap();
        fs::write(resources.join("hello.txt"), b"hello").unwrap();

        Merger::new(&root, IMAGE_MTIME)
            .merge(&resources, Path::new("share/oem"))
            .unwrap();

        let share = fs::metadata(root.join("share")).unwrap();
        assert_eq!(share.mtime(), 2_000);
        assert_eq!(share.permissions().mode() & 0o7777, 0o555);
        assert_eq!(fs::metadata(root.join("share/oem")).unwrap().mtime(), 1_000);

        fs::set_permissions(root.join("share"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_created_mount_path() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir(&root).unwrap();

        let resources = dir.path().join("resources");
        fs::create_dir(&resources).unwrap();
        fs::write(resources.join("hello.txt"), b"hello").unwrap();
        set_mtime(&resources.join("hello.txt"), 3_000).unwrap();

        Merger::new(&root, IMAGE_MTIME)
            .merge(&resources, Path::new("share/oem"))
            .unwrap();

        let oem = fs::metadata(root.join("share/oem")).unwrap();
        assert!(oem.is_dir());
        assert_eq!(oem.mtime(), IMAGE_MTIME);
        assert_eq!(oem.permissions().mode() & 0o7777, 0o755);
        assert_eq!(
            fs::metadata(root.join("share/oem/hello.txt")).unwrap().mtime(),
            3_000
        );
    }

    #[test]
    fn test_symlinks_not_followed() {
        let dir = TempDir::new().unwrap();
        let root = image_tree(dir.path());

        let resources = dir.path().join("resources");
        fs::create_dir(&resources).unwrap();
        symlink("/etc/shadow", resources.join("link")).unwrap();
        symlink("base.ign", resources.join("keep.txt")).unwrap();

        Merger::new(&root, IMAGE_MTIME)
            .merge(&resources, Path::new("share/oem"))
            .unwrap();

        assert_eq!(
            fs::read_link(root.join("share/oem/link")).unwrap(),
            Path::new("/etc/shadow")
        );
        assert_eq!(
            fs::read_link(root.join("share/oem/keep.txt")).unwrap(),
            Path::new("base.ign")
        );
    }

    #[test]
    fn test_directory_replaces_file() {
        let dir = TempDir::new().unwrap();
        let root = image_tree(dir.path());

        let resources = dir.path().join("resources");
        fs::create_dir_all(resources.join("keep.txt")).unwrap();
        fs::write(resources.join("keep.txt/inner"), b"inner").unwrap();

        Merger::new(&root, IMAGE_MTIME)
            .merge(&resources, Path::new("share/oem"))
            .unwrap();

        assert_eq!(
            fs::read(root.join("share/oem/keep.txt/inner")).unwrap(),
            b"inner"
        );
    }

    #[test]
    fn test_unsupported_resource() {
        let dir = TempDir::new().unwrap();
        let root = image_tree(dir.path());

        let resources = dir.path().join("resources");
        fs::create_dir(&resources).unwrap();
        mkfifo(&resources.join("pipe"), Mode::from_bits_truncate(0o600)).unwrap();

        let err = Merger::new(&root, IMAGE_MTIME)
            .merge(&resources, Path::new("share/oem"))
            .unwrap_err();

        assert!(
            matches!(err, RebuildError::UnsupportedResource(_)),
            "Unexpected error {err:?}"
        );
    }

    fn tree_listing(root: &Path) -> Vec<(PathBuf, u32, i64)> {
        walkdir::WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .map(|e| {
                let e = e.unwrap();
                let metadata = e.path().symlink_metadata().unwrap();
                (
                    e.path().strip_prefix(root).unwrap().to_path_buf(),
                    metadata.mode(),
                    metadata.mtime(),
                )
            })
            .collect()
    }

    #[test]
    fn test_empty_resources_without_mount_path() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin/true"), b"#!/bin/sh\n").unwrap();
        set_mtime(&root.join("bin"), 1_000).unwrap();
        set_mtime(&root, 2_000).unwrap();
        let before = tree_listing(&root);

        let resources = dir.path().join("resources");
        fs::create_dir(&resources).unwrap();

        let count = Merger::new(&root, IMAGE_MTIME)
            .merge(&resources, Path::new("share/oem"))
            .unwrap();

        assert_eq!(count, 0);
        assert!(!root.join("share").exists());
        assert_eq!(tree_listing(&root), before);
    }

    #[test]
    fn test_empty_resources_keep_file_on_mount_path() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("share")).unwrap();
        fs::write(root.join("share/oem"), b"not a directory").unwrap();

        let resources = dir.path().join("resources");
        fs::create_dir(&resources).unwrap();

        Merger::new(&root, IMAGE_MTIME)
            .merge(&resources, Path::new("share/oem"))
            .unwrap();

        assert_eq!(fs::read(root.join("share/oem")).unwrap(), b"not a directory");
    }

    #[test]
    fn test_empty_resources_with_mount_path() {
        let dir = TempDir::new().unwrap();
        let root = image_tree(dir.path());
        let before = tree_listing(&root);

        let resources = dir.path().join("resources");
        fs::create_dir(&resources).unwrap();

        Merger::new(&root, IMAGE_MTIME)
            .merge(&resources, Path::new("share/oem"))
            .unwrap();

        assert_eq!(tree_listing(&root), before);
    }
}
