use crate::fetch::client::HttpClient;
use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::Url;

/// An [`HttpClient`] wrapper that passes an API key as a URL query
/// parameter. A parameter of the same name already in the feed URL is
/// replaced rather than sent twice.
pub struct UrlParam<C> {
    inner: C,
    param_name: String,
    key: String,
}

impl<C> UrlParam<C> {
    pub fn new(inner: C, param_name: &str, key: &str) -> Result<Self> {
        if param_name.trim().is_empty() {
            bail!("query parameter name must not be empty");
        }
        if key.is_empty() {
            bail!("API key for query parameter '{param_name}' is empty");
        }
        Ok(Self {
            inner,
            param_name: param_name.to_string(),
            key: key.to_string(),
        })
    }

    fn apply(&self, url: &mut Url) {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| name != self.param_name.as_str())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(&self.param_name, &self.key);
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for UrlParam<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.apply(req.url_mut());
        self.inner.execute(req).await
    }
}
