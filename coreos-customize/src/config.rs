use std::path::PathBuf;

/// Directory, relative to the filesystem image root, receiving the resources
pub(crate) const DEFAULT_MOUNT_PATH: &str = "share/oem";

/// Location of the filesystem image in the ramdisk
pub(crate) const DEFAULT_IMAGE_PATH: &str = "usr.squashfs";

pub(crate) const WORK_DIR_PREFIX: &str = "initram-contents";

pub(crate) const DEFAULT_COMPRESSION_LEVEL: u32 = 9;

/// Settings of an image build
#[derive(Clone, Debug)]
pub(crate) struct BuildConfig {
    pub(crate) mount_path: PathBuf,
    pub(crate) image_path: PathBuf,
    pub(crate) work_dir_parent: Option<PathBuf>,
    pub(crate) work_dir_prefix: String,
    pub(crate) compression: Option<String>,
    pub(crate) compression_level: u32,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            mount_path: PathBuf::from(DEFAULT_MOUNT_PATH),
            image_path: PathBuf::from(DEFAULT_IMAGE_PATH),
            work_dir_parent: None,
            work_dir_prefix: String::from(WORK_DIR_PREFIX),
            compression: None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}
