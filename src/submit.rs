use crate::bundle::{read_raw, to_ascii_json, BundleError};
use reqwest::Client;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use sysinfo::{System, SystemExt};
use thiserror::Error;
use tracing::debug;

/// The body POSTed to the inventory server. `contents` is the bundle file
/// text as-is, not re-parsed.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionEnvelope<'a> {
    pub filename: &'a str,
    pub contents: &'a str,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("failed to encode the submission: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("could not reach {url}: {source}")]
    Unreachable { url: String, source: reqwest::Error },
    #[error("{url} answered with HTTP status {status}")]
    Rejected { url: String, status: u16 },
}

pub struct Submitter {
    client: Client,
    hostname: String,
}

impl Submitter {
    pub fn new(timeout: Duration, hostname: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("storpool-inventory/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client, hostname })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub async fn submit(&self, bundle_path: &Path, url: &str) -> Result<u16, SubmitError> {
        let contents = read_raw(bundle_path)?;
        debug!(chars = contents.chars().count(), "read the bundle file");
        let body = to_ascii_json(&SubmissionEnvelope {
            filename: &self.hostname,
            contents: &contents,
        })?;
        debug!(bytes = body.len(), url, "submitting");

        let resp = self
            .client
            .post(url)
            .body(body)
            .send()
            .await
            .map_err(|source| SubmitError::Unreachable {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status().as_u16();
        debug!(status, "got a response");
        if (200..300).contains(&status) {
            Ok(status)
        } else {
            Err(SubmitError::Rejected {
                url: url.to_string(),
                status,
            })
        }
    }
}

pub fn local_hostname() -> String {
    System::new().host_name().unwrap_or_default()
}
