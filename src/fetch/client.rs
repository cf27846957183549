use async_trait::async_trait;
use reqwest::{Request, Response};

/// Executes prepared HTTP requests. Shared by feed fetching and publishing, so
/// implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
