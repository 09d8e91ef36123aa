pub mod parser;

use reqwest::Client;
use tracing::debug;

pub const DEFAULT_SITE_BASE: &str = "https://radiopaedia.org";

const SEARCH_LANG: &str = "us";
const SEARCH_SCOPE: &str = "articles";

#[derive(Debug, thiserror::Error)]
pub enum SiteError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request failed: status {0}")]
    Status(u16),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Thin HTTP client for the encyclopedia site: the search endpoint, article
/// pages, and absolute URL construction. Parsing lives in [`parser`];
/// caching is the resolver's concern.
#[derive(Clone)]
pub struct SiteClient {
    http: Client,
    base_url: url::Url,
}

impl SiteClient {
    pub fn new(http: Client, base_url: &str) -> Result<Self, SiteError> {
        Ok(Self {
            http,
            base_url: url::Url::parse(base_url)?,
        })
    }

    /// Fetch the raw search page for one term, scoped to articles.
    pub async fn search_page(&self, term: &str) -> Result<String, SiteError> {
        let url = self.base_url.join("/search")?;
        let response = self
            .http
            .get(url)
            .query(&[
                ("lang", SEARCH_LANG),
                ("q", term),
                ("scope", SEARCH_SCOPE),
            ])
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Accept-Language", "en-US,en;q=0.8")
            .header("User-Agent", crate::USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SiteError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        debug!(term, bytes = body.len(), "search page fetched");
        Ok(body)
    }

    /// Fetch one article page by absolute URL.
    pub async fn article_page(&self, url: &str) -> Result<String, SiteError> {
        let response = self
            .http
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml")
            .header("Accept-Language", "en-US,en;q=0.8")
            .header("User-Agent", crate::USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SiteError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        debug!(url, bytes = body.len(), "article page fetched");
        Ok(body)
    }

    /// Absolute article URL from a search hit's relative href.
    pub fn article_url(&self, href: &str) -> Result<String, SiteError> {
        Ok(self.base_url.join(href)?.to_string())
    }
}
