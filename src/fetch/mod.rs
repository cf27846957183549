mod basic;
mod client;
mod source;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;
pub use source::{FeedSource, FileFeedSource, HttpFeedSource};

use anyhow::Result;

/// GETs `url` and returns the body. Non-2xx responses are errors.
pub async fn fetch_bytes<C: HttpClient + ?Sized>(client: &C, url: &str) -> Result<Vec<u8>> {
    let req = reqwest::Request::new(reqwest::Method::GET, url.parse()?);

    let resp = client.execute(req).await?.error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}
