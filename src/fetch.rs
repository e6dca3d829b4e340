//! Blocking HTTP fetch-and-hash primitive shared by the catalog resolver
//! (component A, page fetches) and the archive unpacker (component B,
//! archive downloads). Mirrors the teacher's own blocking-`reqwest`
//! download idiom rather than introducing an async runtime, since the
//! rest of the pipeline is synchronous and cooperative (§5).

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::info;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use url::Url;

use crate::hash::hash_on_disk_sha256;
use crate::retry_loop;
use winbindex_hash::Sha256Digest;

const HTTP_CONN_TIMEOUT: u64 = 20;
const DOWNLOAD_TIMEOUT: u64 = 3600;
const MAX_DOWNLOAD_RETRY: u32 = 20;

pub fn build_client() -> Result<Client> {
    Client::builder()
        .tcp_keepalive(Duration::from_secs(HTTP_CONN_TIMEOUT))
        .connect_timeout(Duration::from_secs(HTTP_CONN_TIMEOUT))
        .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT))
        .build()
        .context("failed to build HTTP client")
}

pub struct DownloadResult {
    pub hash_sha256: Sha256Digest,
    pub path: std::path::PathBuf,
}

fn do_download_and_hash(client: &Client, url: &Url, path: &Path, expected_sha256: Option<&Sha256Digest>) -> Result<DownloadResult> {
    let mut res = client.get(url.clone()).send().context(format!("client get & send({url:?}) failed"))?;

    if *res.url() != *url {
        info!("redirected to URL {:?}", res.url());
    }

    let status = res.status();
    if !status.is_success() {
        match status {
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => bail!("cannot fetch {url}: status {status}"),
            _ => bail!("general failure fetching {url}: status {status}"),
        }
    }

    let mut file = File::create(path).context(format!("failed to create {path:?}"))?;
    res.copy_to(&mut file).context("failed to copy response body to file")?;

    let calculated = hash_on_disk_sha256(path, None)?;
    if let Some(expected) = expected_sha256 {
        if expected != &calculated {
            bail!("checksum mismatch for {path:?}: expected {expected:?}, got {calculated:?}");
        }
    }

    Ok(DownloadResult {
        hash_sha256: calculated,
        path: path.to_path_buf(),
    })
}

/// Downloads `url` into `path`, retrying transient network failures with
/// backoff per §7's "transient network" error kind.
pub fn download_and_hash(client: &Client, url: &Url, path: &Path, expected_sha256: Option<&Sha256Digest>) -> Result<DownloadResult> {
    retry_loop(|| do_download_and_hash(client, url, path, expected_sha256), MAX_DOWNLOAD_RETRY)
}

/// Fetches a page body as text, retrying transient failures — used by the
/// catalog resolver (component A) for the two HTML sources it scrapes.
pub fn fetch_text(client: &Client, url: &str) -> Result<String> {
    retry_loop(
        || -> Result<String> {
            let resp = client.get(url).send().context(format!("GET {url} failed"))?;
            let status = resp.status();
            if !status.is_success() {
                bail!("GET {url} returned status {status}");
            }
            resp.text().context("failed to read response body")
        },
        10,
    )
}
