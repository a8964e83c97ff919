#![doc = include_str!("../README.md")]
#![allow(clippy::multiple_crate_versions)]

use std::{
    fs::File,
    io::{self, BufWriter, Write as _},
    path::Path,
};

use log::{debug, info};
use reqwest::blocking::Client;
use types::{FetchError, Fetcher};
use url::Url;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

fn io_error(path: &Path) -> impl Fn(io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn copy_local(dest: &Path, url: &Url) -> Result<(), FetchError> {
    let source = url.to_file_path().map_err(|()| FetchError::Io {
        path: url.path().into(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "Not a local file URL"),
    })?;

    if is_same_file(&source, dest) {
        debug!(
            "{} is already at its destination, nothing to copy",
            source.display()
        );
        return Ok(());
    }

    let mut reader = File::open(&source).map_err(io_error(&source))?;
    let mut writer = BufWriter::new(File::create(dest).map_err(io_error(dest))?);

    let size = io::copy(&mut reader, &mut writer).map_err(io_error(dest))?;
    writer.flush().map_err(io_error(dest))?;

    debug!("Copied {size} bytes from {}", source.display());
    Ok(())
}

/// Retrieves artifacts over HTTP(S), or copies them when given a `file://` URL
#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a new fetcher with a default HTTP client
    ///
    /// Requests have no timeout: a stalled transfer blocks until the process is terminated.
    ///
    /// # Errors
    ///
    /// If the HTTP client cannot be initialized
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(None)
            .build()?;

        Ok(Self::with_client(client))
    }

    /// Creates a new fetcher on top of an existing HTTP client
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn download(&self, dest: &Path, url: Url) -> Result<(), FetchError> {
        let mut resp = self.client.get(url.clone()).send()?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.into(),
                status: status.as_u16(),
            });
        }

        debug!("Server answered {status}, writing to {}", dest.display());

        let mut writer = BufWriter::new(File::create(dest).map_err(io_error(dest))?);
        let size = io::copy(&mut resp, &mut writer).map_err(io_error(dest))?;
        writer.flush().map_err(io_error(dest))?;

        debug!("Downloaded {size} bytes");
        Ok(())
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, dest: &Path, url: &str) -> Result<(), FetchError> {
        info!("Fetching {url} to {}", dest.display());

        let parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_owned(),
            source,
        })?;

        match parsed.scheme() {
            "http" | "https" => self.download(dest, parsed),
            "file" => copy_local(dest, &parsed),
            scheme => Err(FetchError::UnsupportedScheme(scheme.to_owned())),
        }
    }
}
