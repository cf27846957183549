use anyhow::{Result, anyhow};
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::{Method, Request, Url};
use tracing::{debug, info};

use super::Publisher;
use crate::fetch::HttpClient;

/// Publishes by POSTing the payload to `{base_url}/{topic}`.
///
/// Authentication is layered on the client with the `fetch::auth` wrappers.
pub struct HttpPublisher<C> {
    client: C,
    base_url: Url,
    client_id: Option<HeaderValue>,
}

impl<C: HttpClient> HttpPublisher<C> {
    pub fn new(client: C, base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("broker url {base_url} cannot carry a topic path"));
        }
        Ok(Self {
            client,
            base_url,
            client_id: None,
        })
    }

    /// Identifies this publisher to the broker with an `X-Client-Id` header.
    pub fn with_client_id(mut self, client_id: &str) -> Result<Self> {
        self.client_id = Some(HeaderValue::from_str(client_id)?);
        Ok(self)
    }

    /// Endpoint for a topic. Each `/`-separated level becomes an escaped path segment.
    pub fn topic_url(&self, topic: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("broker url cannot carry a topic path"))?
            .pop_if_empty()
            .extend(topic.split('/'));
        Ok(url)
    }
}

#[async_trait::async_trait]
impl<C: HttpClient> Publisher for HttpPublisher<C> {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut req = Request::new(Method::POST, self.topic_url(topic)?);
        req.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(id) = &self.client_id {
            req.headers_mut().insert("x-client-id", id.clone());
        }
        *req.body_mut() = Some(payload.into());

        let resp = self.client.execute(req).await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("broker returned status {status}: {body}"));
        }

        debug!(topic, %status, "Published");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        info!(broker = %self.base_url, "Publisher closed");
        Ok(())
    }
}
