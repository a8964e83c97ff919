use core::fmt;
use std::{
    fs, io,
    os::unix::fs::PermissionsExt as _,
    path::{Component, Path, PathBuf},
};

use log::{debug, info, warn};
use tempfile::TempDir;
use types::{
    ArchiveExtractor, ArchivePacker, BuildError, Fetcher, FilesystemImageRebuilder,
    PathResolutionError, RebuildError,
};
use walkdir::WalkDir;

use crate::config::BuildConfig;

fn absolute(path: &str) -> Result<PathBuf, PathResolutionError> {
    std::path::absolute(path).map_err(|source| PathResolutionError {
        path: path.to_owned(),
        source,
    })
}

/// Inputs of an image build
#[derive(Clone, Debug)]
pub(crate) struct BuildRequest {
    pub(crate) vmlinuz_url: String,
    pub(crate) initram_url: String,
    pub(crate) resources: PathBuf,
    pub(crate) output: PathBuf,
}

impl BuildRequest {
    /// Creates a request, making the local paths absolute
    pub(crate) fn new(
        vmlinuz_url: &str,
        initram_url: &str,
        resources: &str,
        output: &str,
    ) -> Result<Self, PathResolutionError> {
        Ok(Self {
            vmlinuz_url: vmlinuz_url.to_owned(),
            initram_url: initram_url.to_owned(),
            resources: absolute(resources)?,
            output: absolute(output)?,
        })
    }

    fn output_dir(&self) -> &Path {
        self.output.parent().unwrap_or_else(|| Path::new("/"))
    }
}

/// Checks that the image path stays within the extracted ramdisk
fn validate_image_path(path: &Path) -> Result<(), RebuildError> {
    let mut components = path.components().peekable();

    if components.peek().is_some() && components.all(|c| matches!(c, Component::Normal(_))) {
        Ok(())
    } else {
        Err(RebuildError::InvalidImagePath(path.to_path_buf()))
    }
}

/// Returns the last path segment of a URL, ignoring the query and the fragment
fn url_file_name(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    let path = url[..end].trim_end_matches('/');

    path.rsplit('/').next().unwrap_or(path)
}

/// Returns where an artifact downloaded from `url` is stored
pub(crate) fn download_path(dir: &Path, url: &str) -> PathBuf {
    dir.join(url_file_name(url))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    DownloadKernel,
    DownloadInitram,
    Extract,
    Rebuild,
    Pack,
}

const STAGES: [Stage; 5] = [
    Stage::DownloadKernel,
    Stage::DownloadInitram,
    Stage::Extract,
    Stage::Rebuild,
    Stage::Pack,
];

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::DownloadKernel => "Downloading kernel image",
            Self::DownloadInitram => "Downloading ramdisk image",
            Self::Extract => "Extracting ramdisk",
            Self::Rebuild => "Rebuilding filesystem image",
            Self::Pack => "Packing ramdisk",
        })
    }
}

/// Paths used by a single build
#[derive(Debug)]
struct Workspace<'a> {
    request: &'a BuildRequest,
    kernel: PathBuf,
    initram: PathBuf,
    tree: &'a Path,
    image: PathBuf,
}

/// Gives the owner full access to every directory below `dir`, so that it can be removed
fn make_removable(dir: &Path) -> io::Result<()> {
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }

        let mode = entry.metadata()?.permissions().mode();
        if mode & 0o700 != 0o700 {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o700))?;
        }
    }

    Ok(())
}

/// Runs the steps of an image build in order, stopping at the first failure
pub(crate) struct Pipeline<'a> {
    fetcher: &'a dyn Fetcher,
    extractor: &'a dyn ArchiveExtractor,
    rebuilder: &'a dyn FilesystemImageRebuilder,
    packer: &'a dyn ArchivePacker,
    config: &'a BuildConfig,
}

impl<'a> Pipeline<'a> {
    pub(crate) fn new(
        fetcher: &'a dyn Fetcher,
        extractor: &'a dyn ArchiveExtractor,
        rebuilder: &'a dyn FilesystemImageRebuilder,
        packer: &'a dyn ArchivePacker,
        config: &'a BuildConfig,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            rebuilder,
            packer,
            config,
        }
    }

    fn create_work_dir(&self) -> Result<TempDir, BuildError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(&self.config.work_dir_prefix);

        let dir = match &self.config.work_dir_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(BuildError::WorkDir)?;

        debug!("Working directory is {}", dir.path().display());
        Ok(dir)
    }

    fn run_stage(&self, stage: Stage, ws: &Workspace<'_>) -> Result<(), BuildError> {
        match stage {
            Stage::DownloadKernel => self.fetcher.fetch(&ws.kernel, &ws.request.vmlinuz_url)?,
            Stage::DownloadInitram => self.fetcher.fetch(&ws.initram, &ws.request.initram_url)?,
            Stage::Extract => self.extractor.extract(&ws.initram, ws.tree)?,
            Stage::Rebuild => {
                self.rebuilder
                    .rebuild(&ws.image, &ws.request.resources, &self.config.mount_path)?;
            }
            Stage::Pack => self.packer.pack(ws.tree, &ws.request.output)?,
        }

        Ok(())
    }

    /// Builds the image described by `request`
    ///
    /// The working directory is removed whatever the outcome. If a step fails, its error is
    /// returned as is.
    pub(crate) fn run(&self, request: &BuildRequest) -> Result<(), BuildError> {
        validate_image_path(&self.config.image_path)?;

        let out_dir = request.output_dir();
        let work_dir = self.create_work_dir()?;

        let ws = Workspace {
            request,
            kernel: download_path(out_dir, &request.vmlinuz_url),
            initram: download_path(out_dir, &request.initram_url),
            tree: work_dir.path(),
            image: work_dir.path().join(&self.config.image_path),
        };

        let result = STAGES.iter().try_for_each(|stage| {
            info!("{stage}");
            self.run_stage(*stage, &ws)
        });

        if let Err(e) = make_removable(work_dir.path()) {
            warn!("Couldn't fix up the working directory permissions: {e}");
        }

        let path = work_dir.path().to_path_buf();
        debug!("Removing working directory {}", path.display());
        let cleanup = work_dir.close();

        match (result, cleanup) {
            (Ok(()), Ok(())) => Ok(()),
            (Ok(()), Err(e)) => Err(BuildError::Cleanup(e)),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup)) => {
                warn!(
                    "Couldn't remove working directory {}: {cleanup}",
                    path.display()
                );
                Err(e)
            }
        }
    }
}

impl fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod pipeline_test {
    use core::cell::RefCell;
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;
    use test_log::test;
    use types::{
        ArchiveExtractor, ArchivePacker, BuildError, ExtractError, FetchError, Fetcher,
        FilesystemImageRebuilder, PackError, RebuildError,
    };

    use crate::{
        config::BuildConfig,
        pipeline::{download_path, BuildRequest, Pipeline, Stage, STAGES},
    };

    #[derive(Debug, Default)]
    struct Fake {
        fail_at: Option<Stage>,
        calls: RefCell<Vec<Stage>>,
        paths: RefCell<Vec<PathBuf>>,
    }

    impl Fake {
        fn failing_at(stage: Stage) -> Self {
            Self {
                fail_at: Some(stage),
                ..Self::default()
            }
        }

        fn record(&self, stage: Stage, path: &Path) -> bool {
            self.calls.borrow_mut().push(stage);
            self.paths.borrow_mut().push(path.to_path_buf());

            self.fail_at == Some(stage)
        }
    }

    impl Fetcher for Fake {
        fn fetch(&self, dest: &Path, url: &str) -> Result<(), FetchError> {
            let stage = if url.contains("vmlinuz") {
                Stage::DownloadKernel
            } else {
                Stage::DownloadInitram
            };

            if self.record(stage, dest) {
                return Err(FetchError::UnsupportedScheme(String::from("fake")));
            }

            Ok(())
        }
    }

    impl ArchiveExtractor for Fake {
        fn extract(&self, _container: &Path, dest: &Path) -> Result<(), ExtractError> {
            assert!(dest.is_dir(), "Working directory is missing");

            if self.record(Stage::Extract, dest) {
                return Err(ExtractError::Malformed(String::from("fake")));
            }

            Ok(())
        }
    }

    impl FilesystemImageRebuilder for Fake {
        fn rebuild(
            &self,
            image: &Path,
            _resources: &Path,
            mount_path: &Path,
        ) -> Result<(), RebuildError> {
            assert_eq!(mount_path, Path::new("share/oem"));

            if self.record(Stage::Rebuild, image) {
                return Err(RebuildError::ImageNotFound(image.to_path_buf()));
            }

            Ok(())
        }
    }

    impl ArchivePacker for Fake {
        fn pack(&self, source: &Path, _output: &Path) -> Result<(), PackError> {
            if self.record(Stage::Pack, source) {
                return Err(PackError::EntryTooLarge(source.to_path_buf()));
            }

            Ok(())
        }
    }

    fn request(dir: &Path) -> BuildRequest {
        BuildRequest::new(
            "https://builds.example.com/stable/vmlinuz.img",
            "https://builds.example.com/stable/initram.img?arch=x86_64",
            dir.join("resources").to_str().unwrap(),
            dir.join("out/custom.img").to_str().unwrap(),
        )
        .unwrap()
    }

    fn config(dir: &Path) -> BuildConfig {
        BuildConfig {
            work_dir_parent: Some(dir.to_path_buf()),
            ..BuildConfig::default()
        }
    }

    fn run(fake: &Fake, config: &BuildConfig, request: &BuildRequest) -> Result<(), BuildError> {
        Pipeline::new(fake, fake, fake, fake, config).run(request)
    }

    fn work_dirs(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .unwrap()
                    .to_string_lossy()
                    .starts_with("initram-contents")
            })
            .collect()
    }

    #[test]
    fn test_stage_order() {
        let dir = TempDir::new().unwrap();
        let fake = Fake::default();

        run(&fake, &config(dir.path()), &request(dir.path())).unwrap();

        assert_eq!(*fake.calls.borrow(), STAGES);

        let paths = fake.paths.borrow();
        assert_eq!(paths[0], dir.path().join("out/vmlinuz.img"));
        assert_eq!(paths[1], dir.path().join("out/initram.img"));
        assert!(paths[2].starts_with(dir.path()));
        assert_eq!(paths[3], paths[2].join("usr.squashfs"));
        assert_eq!(paths[4], paths[2]);

        assert!(work_dirs(dir.path()).is_empty(), "Working directory left behind");
    }

    #[test]
    fn test_failure_stops_pipeline() {
        for (idx, stage) in STAGES.iter().enumerate() {
            let dir = TempDir::new().unwrap();
            let fake = Fake::failing_at(*stage);

            let err = run(&fake, &config(dir.path()), &request(dir.path())).unwrap_err();

            assert_eq!(*fake.calls.borrow(), STAGES[..=idx]);
            assert!(
                work_dirs(dir.path()).is_empty(),
                "Working directory left behind after failing at {stage}"
            );

            let expected = match stage {
                Stage::DownloadKernel | Stage::DownloadInitram => {
                    matches!(err, BuildError::Fetch(FetchError::UnsupportedScheme(_)))
                }
                Stage::Extract => {
                    matches!(&err, BuildError::Extract(ExtractError::Malformed(m)) if m == "fake")
                }
                Stage::Rebuild => {
                    matches!(err, BuildError::Rebuild(RebuildError::ImageNotFound(_)))
                }
                Stage::Pack => matches!(err, BuildError::Pack(PackError::EntryTooLarge(_))),
            };
            assert!(expected, "Unexpected error {err:?} when failing at {stage}");
        }
    }

    #[test]
    fn test_error_message_unchanged() {
        let dir = TempDir::new().unwrap();
        let fake = Fake::failing_at(Stage::Extract);

        let err = run(&fake, &config(dir.path()), &request(dir.path())).unwrap_err();
        assert_eq!(
            err.to_string(),
            ExtractError::Malformed(String::from("fake")).to_string()
        );
    }

    #[test]
    fn test_work_dir_creation_failure() {
        let dir = TempDir::new().unwrap();
        let fake = Fake::default();

        let config = BuildConfig {
            work_dir_parent: Some(dir.path().join("missing")),
            ..BuildConfig::default()
        };

        let err = run(&fake, &config, &request(dir.path())).unwrap_err();
        assert!(matches!(err, BuildError::WorkDir(_)), "Unexpected error {err:?}");
        assert!(fake.calls.borrow().is_empty());
    }

    #[test]
    fn test_image_path_outside_work_dir() {
        for image_path in ["/srv/host/usr.squashfs", "../usr.squashfs", "usr/../../x", ""] {
            let dir = TempDir::new().unwrap();
            let fake = Fake::default();

            let config = BuildConfig {
                image_path: PathBuf::from(image_path),
                ..config(dir.path())
            };

            let err = run(&fake, &config, &request(dir.path())).unwrap_err();
            assert!(
                matches!(err, BuildError::Rebuild(RebuildError::InvalidImagePath(_))),
                "Unexpected error {err:?} for {image_path:?}"
            );
            assert!(fake.calls.borrow().is_empty());
            assert!(work_dirs(dir.path()).is_empty(), "Working directory left behind");
        }
    }

    #[test]
    fn test_nested_image_path() {
        let dir = TempDir::new().unwrap();
        let fake = Fake::default();

        let config = BuildConfig {
            image_path: PathBuf::from("usr/lib/usr.squashfs"),
            ..config(dir.path())
        };

        run(&fake, &config, &request(dir.path())).unwrap();

        let paths = fake.paths.borrow();
        assert_eq!(paths[3], paths[2].join("usr/lib/usr.squashfs"));
    }

    #[test]
    fn test_read_only_work_dir_cleanup() {
        use std::{fs, os::unix::fs::PermissionsExt as _};

        #[derive(Debug)]
        struct ReadOnlyExtractor;

        impl ArchiveExtractor for ReadOnlyExtractor {
            fn extract(&self, _container: &Path, dest: &Path) -> Result<(), ExtractError> {
                let sub = dest.join("etc");
                fs::create_dir(&sub).unwrap();
                fs::write(sub.join("hostname"), b"coreos").unwrap();
                fs::set_permissions(&sub, fs::Permissions::from_mode(0o555)).unwrap();

                Ok(())
            }
        }

        let dir = TempDir::new().unwrap();
        let fake = Fake::default();
        let config = config(dir.path());

        Pipeline::new(&fake, &ReadOnlyExtractor, &fake, &fake, &config)
            .run(&request(dir.path()))
            .unwrap();

        assert!(work_dirs(dir.path()).is_empty(), "Working directory left behind");
    }

    #[test]
    fn test_download_path() {
        assert_eq!(
            download_path(Path::new("/out"), "https://host/path/vmlinuz.img"),
            Path::new("/out/vmlinuz.img")
        );
        assert_eq!(
            download_path(Path::new("/out"), "https://host/path/initram.img?token=abc#frag"),
            Path::new("/out/initram.img")
        );
        assert_eq!(
            download_path(Path::new("/out"), "file:///srv/images/initram.img/"),
            Path::new("/out/initram.img")
        );
    }

    #[test]
    fn test_request_paths() {
        let request = BuildRequest::new(
            "https://host/path/vmlinuz.img",
            "https://host/path/initram.img",
            "resources",
            "/out/custom.img",
        )
        .unwrap();

        assert!(request.resources.is_absolute());
        assert!(request.resources.ends_with("resources"));
        assert_eq!(request.output, Path::new("/out/custom.img"));
        assert_eq!(request.output_dir(), Path::new("/out"));
    }

    #[test]
    fn test_request_empty_path() {
        let err = BuildRequest::new(
            "https://host/vmlinuz",
            "https://host/initram",
            "",
            "/out/custom.img",
        )
        .unwrap_err();
        assert_eq!(err.path, "");

        BuildRequest::new("https://host/vmlinuz", "https://host/initram", "/res", "").unwrap_err();
    }
}
