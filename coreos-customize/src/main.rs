#![doc = include_str!("../../README.md")]
#![allow(clippy::multiple_crate_versions)]

use std::path::PathBuf;

use clap::Parser;
use fetch::HttpFetcher;
use log::{debug, info};
use newc::{InitramExtractor, InitramPacker};
use squashfs::SquashfsRebuilder;

mod config;
mod pipeline;

use config::{
    BuildConfig, DEFAULT_COMPRESSION_LEVEL, DEFAULT_IMAGE_PATH, DEFAULT_MOUNT_PATH,
    WORK_DIR_PREFIX,
};
use pipeline::{BuildRequest, Pipeline};

#[derive(Debug, Parser)]
#[command(version, about = "CoreOS Boot Image Customization Utility")]
struct Cli {
    #[arg(long, default_value = "", help = "Kernel Image URL")]
    vmlinuz: String,

    #[arg(long, default_value = "", help = "Ramdisk Image URL")]
    initram: String,

    #[arg(long, default_value = "", help = "Directory with the files to add to the image")]
    resources: String,

    #[arg(long, default_value = "", help = "Output Path of the Customized Ramdisk")]
    custom: String,

    #[arg(
        long,
        default_value = DEFAULT_MOUNT_PATH,
        help = "Directory Receiving the Resources, Relative to the Filesystem Image Root"
    )]
    mount_path: PathBuf,

    #[arg(
        long,
        default_value = DEFAULT_IMAGE_PATH,
        help = "Path of the Filesystem Image in the Ramdisk"
    )]
    image_path: PathBuf,

    #[arg(long, help = "Directory to create the working directory in")]
    work_dir: Option<PathBuf>,

    #[arg(long, help = "SquashFS Compressor, defaults to the one of the original image")]
    compression: Option<String>,

    #[arg(
        long,
        default_value_t = DEFAULT_COMPRESSION_LEVEL,
        value_parser = clap::value_parser!(u32).range(0..=9),
        help = "Ramdisk gzip Compression Level"
    )]
    compression_level: u32,
}

impl From<&Cli> for BuildConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            mount_path: cli.mount_path.clone(),
            image_path: cli.image_path.clone(),
            work_dir_parent: cli.work_dir.clone(),
            work_dir_prefix: String::from(WORK_DIR_PREFIX),
            compression: cli.compression.clone(),
            compression_level: cli.compression_level,
        }
    }
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    debug!(
        "Running {} {}",
        env!("CARGO_CRATE_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let request = BuildRequest::new(&cli.vmlinuz, &cli.initram, &cli.resources, &cli.custom)?;
    let config = BuildConfig::from(&cli);

    info!(
        "Building {} with the resources from {}",
        request.output.display(),
        request.resources.display()
    );

    let fetcher = HttpFetcher::new()?;
    let rebuilder = SquashfsRebuilder::new(config.compression.clone());
    let packer = InitramPacker::new(config.compression_level);

    Pipeline::new(&fetcher, &InitramExtractor, &rebuilder, &packer, &config).run(&request)?;

    info!("Success");
    Ok(())
}
