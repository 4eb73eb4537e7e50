//! Archive acquisition: local references, streamed downloads and checksums.

use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use url::Url;

const USER_AGENT: &str = concat!("cistern-store/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(300);
const CHUNK_SIZE: usize = 64 * 1024;
const FALLBACK_FILENAME: &str = "archive.tar.gz";

/// Where an archive is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveLocation {
    Local(PathBuf),
    Remote(Url),
}

impl ArchiveLocation {
    /// Classifies a reference: `http(s)://` URLs are remote, `file://` URLs
    /// and everything else are local paths.
    #[must_use]
    pub fn parse(reference: &str) -> Self {
        match Url::parse(reference) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Remote(url),
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => Self::Local(path),
                Err(()) => Self::Local(PathBuf::from(reference)),
            },
            _ => Self::Local(PathBuf::from(reference)),
        }
    }

    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

/// An archive fetched from a remote location.
#[derive(Debug, Clone)]
pub struct DownloadedArchive {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

/// Streams `url` into `dest_dir` in bounded chunks.
///
/// The body is written to a temporary file in `dest_dir` and only renamed to
/// its final name once fully received. An existing file of that name is never
/// replaced; the download then keeps its temporary name.
pub fn download_archive(url: &Url, dest_dir: &Path) -> Result<DownloadedArchive> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("failed to create download directory {}", dest_dir.display()))?;

    let client = http_client()?;
    let mut response = client
        .get(url.clone())
        .send()
        .with_context(|| format!("failed to fetch {url}"))?
        .error_for_status()
        .with_context(|| format!("unexpected response for {url}"))?;

    let mut tmp = tempfile::Builder::new()
        .prefix("cistern-download-")
        .suffix(".tar.gz")
        .tempfile_in(dest_dir)
        .with_context(|| format!("failed to create download file in {}", dest_dir.display()))?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("stream error for {url}"))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        tmp.write_all(&buffer[..read])?;
        written += read as u64;
    }
    tmp.flush()?;

    let dest = persist_download(tmp, &dest_dir.join(remote_filename(url)))?;
    let sha256 = hex::encode(hasher.finalize());
    tracing::debug!(%url, path = %dest.display(), bytes = written, "archive downloaded");
    Ok(DownloadedArchive {
        path: dest,
        size: written,
        sha256,
    })
}

fn persist_download(tmp: NamedTempFile, dest: &Path) -> Result<PathBuf> {
    match tmp.persist_noclobber(dest) {
        Ok(_) => Ok(dest.to_path_buf()),
        Err(err) if err.error.kind() == ErrorKind::AlreadyExists => {
            let (_, path) = err.file.keep().map_err(|err| {
                anyhow!("unable to keep download beside {}: {}", dest.display(), err.error)
            })?;
            tracing::warn!(
                existing = %dest.display(),
                path = %path.display(),
                "download target exists; keeping temporary name"
            );
            Ok(path)
        }
        Err(err) => Err(anyhow!(
            "unable to persist download to {}: {}",
            dest.display(),
            err.error
        )),
    }
}

fn remote_filename(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map_or_else(|| FALLBACK_FILENAME.to_string(), ToString::to_string)
}

/// Hex encoded sha256 of a file's content, read in chunks.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 32 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Writer adapter hashing everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    /// Returns the inner writer, the hex digest and the byte count.
    pub fn finish(self) -> (W, String, u64) {
        (
            self.inner,
            hex::encode(self.hasher.finalize()),
            self.bytes_written,
        )
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes_written = self
            .bytes_written
            .saturating_add(written.try_into().unwrap_or(u64::MAX));
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("failed to build http client")
}
