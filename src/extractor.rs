//! Readable-text extraction for a bookmarked page.
//!
//! The direct fetch is parsed with `scraper`; when it fails or yields no
//! text the reader-mode proxy is asked instead.

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Node, Selector};
use std::sync::{Arc, PoisonError, RwLock};

use crate::{bookmarks::truncate_chars, config::Config, scrape::Fetcher};

const MAIN_CONTENT_SELECTORS: [&str; 8] = [
    "article",
    "main",
    "[role=main]",
    ".post-content",
    ".article-content",
    ".entry-content",
    ".content",
    "#content",
];

const SKIPPED_TAGS: [&str; 9] = [
    "script", "style", "nav", "footer", "header", "aside", "form", "noscript", "svg",
];

static MANY_SPACES: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]{2,}").ok());
static MANY_NEWLINES: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\n{3,}").ok());

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub title: Option<String>,
    pub description: Option<String>,
    pub text: String,
    pub thumbnail_url: Option<String>,
    pub favicon_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Scraping failed: content could not be extracted ({0})")]
    Failed(String),
}

pub trait ContentExtractor: Send + Sync {
    fn extract(&self, url: &str) -> Result<Extraction, ExtractError>;
}

/// Fetches pages over HTTP using the current scrape settings.
pub struct WebExtractor {
    config: Arc<RwLock<Config>>,
}

impl WebExtractor {
    pub fn new(config: Arc<RwLock<Config>>) -> Self {
        WebExtractor { config }
    }
}

impl ContentExtractor for WebExtractor {
    fn extract(&self, url: &str) -> Result<Extraction, ExtractError> {
        let scrape_config = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .scrape
            .clone();
        let max_chars = scrape_config.max_text_chars;
        let fetcher = Fetcher::new(scrape_config);

        let primary = fetcher
            .fetch_html(url)
            .map(|page| parse_page(&page.html, &page.url, max_chars));

        let page_meta = match primary {
            Ok(extraction) if !extraction.text.is_empty() => return Ok(extraction),
            Ok(extraction) => {
                log::debug!("{url}: page has no readable text, trying reader");
                Some(extraction)
            }
            Err(err) => {
                log::debug!("{url}: direct fetch failed: {err}");
                None
            }
        };

        let reader_err = match fetcher.fetch_reader(url) {
            Ok(page) => {
                let text = page
                    .content
                    .as_deref()
                    .map(clean_text)
                    .map(|text| truncate_chars(&text, max_chars))
                    .unwrap_or_default();

                if !text.is_empty() {
                    let meta = page_meta.unwrap_or_default();
                    return Ok(Extraction {
                        title: non_empty(page.title).or(meta.title),
                        description: non_empty(page.description).or(meta.description),
                        text,
                        thumbnail_url: meta.thumbnail_url,
                        favicon_url: meta.favicon_url,
                    });
                }
                "reader returned no content".to_string()
            }
            Err(err) => err.to_string(),
        };

        match page_meta {
            // a description still gives the model something to work with
            Some(meta) if meta.description.is_some() => Ok(Extraction {
                text: meta.description.clone().unwrap_or_default(),
                ..meta
            }),
            Some(_) => Err(ExtractError::Failed(format!("page has no text, {reader_err}"))),
            None => Err(ExtractError::Failed(reader_err)),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn select_first<'a>(document: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(css).ok()?;
    document.select(&selector).next()
}

fn meta_content(document: &Html, keys: &[&str]) -> Option<String> {
    let selector = Selector::parse("meta").ok()?;
    for key in keys {
        for element in document.select(&selector) {
            let name = element
                .attr("property")
                .or_else(|| element.attr("name"))
                .unwrap_or_default();
            if name.eq_ignore_ascii_case(key) {
                if let Some(value) = non_empty(element.attr("content").map(String::from)) {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn resolve_href(page_url: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with("data:") {
        return None;
    }
    let base = url::Url::parse(page_url).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}

fn favicon(document: &Html, page_url: &str) -> Option<String> {
    let selector = Selector::parse("link[rel]").ok()?;
    let mut icons = document
        .select(&selector)
        .filter(|el| {
            el.attr("rel")
                .map(|rel| rel.to_lowercase().contains("icon"))
                .unwrap_or(false)
        })
        .filter_map(|el| el.attr("href"))
        .filter_map(|href| resolve_href(page_url, href))
        .collect::<Vec<_>>();

    // prefer png icons over legacy .ico files
    icons.sort_by_key(|href| !href.contains(".png"));
    icons.into_iter().next()
}

fn readable_text(root: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    for node in root.descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };

        let skipped = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|el| SKIPPED_TAGS.contains(&el.name()))
                .unwrap_or(false)
        });

        let text = text.trim();
        if !text.is_empty() && !skipped {
            parts.push(text.to_string());
        }
    }
    parts.join("\n")
}

/// Collapses runs of blank lines and spaces left over from markup.
pub fn clean_text(text: &str) -> String {
    let mut text = text.replace("\r\n", "\n");
    if let Some(re) = MANY_SPACES.as_ref() {
        text = re.replace_all(&text, " ").to_string();
    }
    if let Some(re) = MANY_NEWLINES.as_ref() {
        text = re.replace_all(&text, "\n\n").to_string();
    }
    text.trim().to_string()
}

/// Extracts title, description, media and main text from an HTML document.
pub fn parse_page(html: &str, page_url: &str, max_chars: usize) -> Extraction {
    let document = Html::parse_document(html);

    let title = meta_content(&document, &["og:title", "twitter:title"]).or_else(|| {
        select_first(&document, "title")
            .and_then(|el| non_empty(Some(el.text().collect::<String>())))
    });

    let description = meta_content(
        &document,
        &["description", "og:description", "twitter:description"],
    );

    let thumbnail_url = meta_content(&document, &["og:image", "twitter:image"])
        .and_then(|href| resolve_href(page_url, &href));

    let root = MAIN_CONTENT_SELECTORS
        .iter()
        .find_map(|css| select_first(&document, css))
        .or_else(|| select_first(&document, "body"));

    let text = root
        .map(readable_text)
        .map(|text| clean_text(&text))
        .map(|text| truncate_chars(&text, max_chars))
        .unwrap_or_default();

    Extraction {
        title,
        description,
        text,
        thumbnail_url,
        favicon_url: favicon(&document, page_url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html>
<head>
  <title>  Fallback Title </title>
  <meta property="og:title" content="Async Rust in Depth">
  <meta name="description" content="A long read about executors.">
  <meta property="og:image" content="/img/cover.png">
  <link rel="icon" href="/favicon.ico">
  <link rel="shortcut icon" type="image/png" href="//cdn.example.com/icon.png">
</head>
<body>
  <header>Site header</header>
  <nav>Home | Blog</nav>
  <article>
    <h1>Executors</h1>
    <p>Futures are    polled by an executor.</p>
    <script>var tracking = 1;</script>
    <p>Wakers signal readiness.</p>
  </article>
  <footer>Copyright</footer>
</body>
</html>"#;

    #[test]
    fn test_parse_page_metadata() {
        let page = parse_page(PAGE, "https://blog.example.com/posts/async", 15000);

        assert_eq!(page.title.as_deref(), Some("Async Rust in Depth"));
        assert_eq!(page.description.as_deref(), Some("A long read about executors."));
        assert_eq!(
            page.thumbnail_url.as_deref(),
            Some("https://blog.example.com/img/cover.png")
        );
        assert_eq!(
            page.favicon_url.as_deref(),
            Some("https://cdn.example.com/icon.png")
        );
    }

    #[test]
    fn test_parse_page_main_text() {
        let page = parse_page(PAGE, "https://blog.example.com/posts/async", 15000);

        assert!(page.text.contains("Futures are polled by an executor."));
        assert!(page.text.contains("Wakers signal readiness."));
        assert!(!page.text.contains("tracking"));
        assert!(!page.text.contains("Site header"));
        assert!(!page.text.contains("Copyright"));
    }

    #[test]
    fn test_parse_page_falls_back_to_body_and_title_tag() {
        let html = "<html><head><title>Plain</title></head><body><div>Just text</div><aside>ads</aside></body></html>";
        let page = parse_page(html, "https://example.com/", 15000);

        assert_eq!(page.title.as_deref(), Some("Plain"));
        assert_eq!(page.text, "Just text");
        assert!(page.favicon_url.is_none());
    }

    #[test]
    fn test_text_is_truncated() {
        let html = format!("<html><body><main>{}</main></body></html>", "a".repeat(100));
        let page = parse_page(&html, "https://example.com/", 10);
        assert_eq!(page.text.len(), 10);
    }

    #[test]
    fn test_clean_text() {
        assert_eq!(clean_text("a  b\n\n\n\nc\r\n"), "a b\n\nc");
    }
}
