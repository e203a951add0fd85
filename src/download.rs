use anyhow::{Context, Result};
use std::time::Duration;

/// RKE2 installer, fetched once per run and pushed into every VM
pub const RKE2_INSTALL_SCRIPT_URL: &str = "https://get.rke2.io";

/// Download a small artifact (install script, signing key) into memory
pub fn fetch(url: &str) -> Result<Vec<u8>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")?;

    let body = client
        .get(url)
        .send()
        .with_context(|| format!("Failed to download {}", url))?
        .error_for_status()
        .with_context(|| format!("HTTP error downloading {}", url))?
        .bytes()
        .with_context(|| format!("Failed to read response body from {}", url))?;

    tracing::debug!(url, bytes = body.len(), "downloaded");
    Ok(body.to_vec())
}
