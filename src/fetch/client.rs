use async_trait::async_trait;
use reqwest::{Method, Request, Response, Url};

/// Transport used by polling sources. Auth wrappers in [`super::auth`]
/// decorate another client, so credentials are added per request.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;

    /// GETs `url`, turning a non-2xx status into an error.
    async fn get(&self, url: Url) -> reqwest::Result<Response> {
        let resp = self.execute(Request::new(Method::GET, url)).await?;
        resp.error_for_status()
    }
}
