use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::warn;

static SEARCH_RESULT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.search-result").unwrap());
static RESULT_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".search-result-title").unwrap());
static RESULT_BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".search-result-body").unwrap());

/// The main content region of an article page.
static ARTICLE_BODY: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("#content > div.body.user-generated-content").unwrap());

/// One entry of a search page, `id` being its 0-based native rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub id: usize,
    pub title: String,
    pub snippet: String,
    pub href: String,
}

/// Parse a search page into ranked hits. Entries without a link or a title
/// are skipped; a page with no entries parses to an empty list.
pub fn parse_search_results(html: &str) -> Vec<SearchHit> {
    let doc = Html::parse_document(html);
    let mut hits = Vec::new();

    for element in doc.select(&SEARCH_RESULT) {
        let Some(href) = element.value().attr("href") else {
            warn!("search result without href, skipping");
            continue;
        };
        let title = element
            .select(&RESULT_TITLE)
            .next()
            .map(text_of)
            .unwrap_or_default();
        if title.is_empty() {
            warn!(href, "search result without title, skipping");
            continue;
        }
        let snippet = element
            .select(&RESULT_BODY)
            .next()
            .map(text_of)
            .unwrap_or_default();

        hits.push(SearchHit {
            id: hits.len(),
            title,
            snippet,
            href: href.to_string(),
        });
    }

    hits
}

/// Extract the article body text. The site's content selector is tried
/// first; pages that don't match it (layout changes, mirrors) go through
/// readability extraction instead. `None` when neither yields text.
pub fn extract_article_text(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    if let Some(region) = doc.select(&ARTICLE_BODY).next() {
        let text = text_of(region);
        if !text.is_empty() {
            return Some(text);
        }
    }
    readability_text(html)
}

fn readability_text(html: &str) -> Option<String> {
    let mut readability =
        match dom_smoothie::Readability::new(html, None, Some(dom_smoothie::Config::default())) {
            Ok(r) => r,
            Err(e) => {
                warn!(%e, "readability init failed");
                return None;
            }
        };

    let article = match readability.parse() {
        Ok(article) => article,
        Err(e) => {
            warn!(%e, "readability parse failed");
            return None;
        }
    };

    let content_html = article.content.to_string();
    let text = html2md::rewrite_html(&content_html, false);
    let text = text.trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

fn text_of(element: ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}
