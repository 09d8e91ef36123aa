use tracing::{debug, info};

use crate::cache::{CacheError, DocumentCache, Namespace};
use crate::encyclopedia::parser::{self, SearchHit};
use crate::encyclopedia::{SiteClient, SiteError};

/// How to pick supporting articles from ranked search hits. The first
/// full-text match works better than re-ranking for this corpus; `TopTwo`
/// trades precision for broader coverage and two citations per concept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    #[default]
    FirstResult,
    TopTwo,
}

impl SelectionPolicy {
    fn take(self) -> usize {
        match self {
            SelectionPolicy::FirstResult => 1,
            SelectionPolicy::TopTwo => 2,
        }
    }
}

/// A citation surfaced to the end user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub title: String,
    pub url: String,
}

/// Article text plus the citations backing it, for one concept.
#[derive(Debug)]
pub struct Resolved {
    pub text: String,
    pub sources: Vec<Source>,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("no results found")]
    NoResults,

    #[error("search failed: {0}")]
    Search(#[source] SiteError),

    #[error("article fetch failed: {0}")]
    Article(#[source] SiteError),

    #[error("article has no readable content: {url}")]
    ContentMissing { url: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Resolve one concept to supporting article text and its sources:
/// cached search page, ranked hit selection, cached article body.
/// Storage faults propagate; they are never downgraded to a cache miss.
pub async fn resolve_concept(
    site: &SiteClient,
    cache: &impl DocumentCache,
    policy: SelectionPolicy,
    concept: &str,
) -> Result<Resolved, ResolveError> {
    let hits = search_hits(site, cache, concept).await?;
    if hits.is_empty() {
        return Err(ResolveError::NoResults);
    }

    let mut text = String::new();
    let mut sources = Vec::new();
    for hit in hits.iter().take(policy.take()) {
        debug!(concept, rank = hit.id, title = %hit.title, snippet = %hit.snippet, "selected search hit");
        let url = site.article_url(&hit.href).map_err(ResolveError::Article)?;
        let body = article_text(site, cache, &url).await?;
        text.push_str(&body);
        text.push_str("\n\n");
        sources.push(Source {
            title: hit.title.clone(),
            url,
        });
    }

    Ok(Resolved { text, sources })
}

async fn search_hits(
    site: &SiteClient,
    cache: &impl DocumentCache,
    concept: &str,
) -> Result<Vec<SearchHit>, ResolveError> {
    if let Some(body) = cache.get(Namespace::SearchResults, concept).await? {
        debug!(concept, "search cache hit");
        return Ok(parser::parse_search_results(&body));
    }

    let body = site
        .search_page(concept)
        .await
        .map_err(ResolveError::Search)?;
    let hits = parser::parse_search_results(&body);

    // A page with zero structured results is not cached, so a later retry
    // can succeed once upstream content appears.
    if !hits.is_empty() {
        cache.put(Namespace::SearchResults, concept, &body).await?;
    }

    Ok(hits)
}

async fn article_text(
    site: &SiteClient,
    cache: &impl DocumentCache,
    url: &str,
) -> Result<String, ResolveError> {
    if let Some(text) = cache.get(Namespace::Articles, url).await? {
        info!(url, "article cache hit");
        return Ok(text);
    }

    let page = site.article_page(url).await.map_err(ResolveError::Article)?;
    let text = parser::extract_article_text(&page).ok_or_else(|| ResolveError::ContentMissing {
        url: url.to_string(),
    })?;
    cache.put(Namespace::Articles, url, &text).await?;
    Ok(text)
}
