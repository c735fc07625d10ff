mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use anyhow::{Context, Result};
use bytes::Bytes;

/// GETs `url` through `client` and returns the body.
///
/// # Errors
///
/// Fails on an unparsable URL, a transport error or a non-2xx status.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Bytes> {
    let parsed = url
        .parse()
        .with_context(|| format!("invalid feed url '{url}'"))?;
    let resp = client.get(parsed).await?;
    Ok(resp.bytes().await?)
}
