//! Browser bookmark exports: Netscape HTML and the Firefox JSON backup tree.
//!
//! Both are flattened into [`ImportEntry`] rows; the folder path above a link
//! becomes its tag list.

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::{app::errors::AppError, bookmarks::normalize_tags};

/// Container folders every browser creates; they carry no meaning as tags.
const ROOT_FOLDERS: [&str; 8] = [
    "bookmarks",
    "bookmarks menu",
    "bookmarks toolbar",
    "bookmarks bar",
    "other bookmarks",
    "mobile bookmarks",
    "menu",
    "toolbar",
];

const CONTENT_HINTS: [&str; 17] = [
    "blog",
    "article",
    "post",
    "docs",
    "documentation",
    "tutorial",
    "guide",
    "learn",
    "wiki",
    "news",
    "paper",
    "research",
    "medium.com",
    "substack.com",
    "dev.to",
    "arxiv.org",
    "youtube.com/watch",
];

const LONG_TITLE_CHARS: usize = 40;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportEntry {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Seconds since epoch, as found in the export
    #[serde(default, rename = "addedAt", skip_serializing_if = "Option::is_none")]
    pub added_at: Option<i64>,
    #[serde(default)]
    pub enrich: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportRequest {
    #[serde(default)]
    pub bookmarks: Vec<ImportEntry>,
    #[serde(default)]
    pub use_nano_model: bool,
}

/// Default `enrich` flag: links that look like content rather than a landing page.
pub fn should_enrich(url: &str, title: Option<&str>) -> bool {
    let Ok(parsed) = url::Url::parse(url) else {
        return false;
    };

    let depth = parsed
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).count())
        .unwrap_or(0);
    if depth >= 2 {
        return true;
    }

    let lower = url.to_lowercase();
    if CONTENT_HINTS.iter().any(|hint| lower.contains(hint)) {
        return true;
    }

    title
        .map(|t| t.trim().chars().count() > LONG_TITLE_CHARS)
        .unwrap_or(false)
}

fn non_empty(value: String) -> Option<String> {
    let value = value.trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn is_root_folder(name: &str) -> bool {
    ROOT_FOLDERS.contains(&name.trim().to_lowercase().as_str())
}

fn folder_path(link: ElementRef<'_>) -> Vec<String> {
    let mut path = vec![];
    for ancestor in link.ancestors().filter_map(ElementRef::wrap) {
        if ancestor.value().name() != "dl" {
            continue;
        }
        let heading = ancestor.prev_siblings().filter_map(ElementRef::wrap).next();
        if let Some(heading) = heading.filter(|el| el.value().name() == "h3") {
            if let Some(name) = non_empty(heading.text().collect()) {
                if !is_root_folder(&name) {
                    path.push(name);
                }
            }
        }
    }
    path.reverse();
    path
}

pub fn parse_netscape(html: &str) -> Vec<ImportEntry> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a[href]") else {
        return vec![];
    };

    document
        .select(&selector)
        .filter_map(|link| {
            let url = link.attr("href")?.trim().to_string();
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return None;
            }

            let mut tags = folder_path(link);
            if let Some(extra) = link.attr("tags") {
                tags.extend(extra.split(',').map(String::from));
            }

            Some(ImportEntry {
                title: non_empty(link.text().collect()),
                added_at: link.attr("add_date").and_then(|v| v.trim().parse().ok()),
                tags: normalize_tags(tags),
                url,
                enrich: false,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct FirefoxNode {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default, rename = "dateAdded")]
    date_added: Option<i64>,
    #[serde(default)]
    tags: Option<String>,
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    children: Vec<FirefoxNode>,
}

fn walk_firefox(node: FirefoxNode, path: &mut Vec<String>, out: &mut Vec<ImportEntry>) {
    if let Some(uri) = node.uri {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            let mut tags = path.clone();
            if let Some(extra) = node.tags {
                tags.extend(extra.split(',').map(String::from));
            }
            out.push(ImportEntry {
                url: uri,
                title: node.title.and_then(non_empty),
                tags: normalize_tags(tags),
                // firefox stores microseconds
                added_at: node.date_added.map(|d| d / 1_000_000),
                enrich: false,
            });
        }
        return;
    }

    let folder = node
        .title
        .and_then(non_empty)
        .filter(|name| node.root.is_none() && !is_root_folder(name));
    if let Some(name) = &folder {
        path.push(name.clone());
    }
    for child in node.children {
        walk_firefox(child, path, out);
    }
    if folder.is_some() {
        path.pop();
    }
}

pub fn parse_firefox_json(json: &str) -> Result<Vec<ImportEntry>, AppError> {
    let root: FirefoxNode = serde_json::from_str(json)
        .map_err(|err| AppError::validation(format!("Invalid Firefox bookmarks file: {err}")))?;

    let mut out = vec![];
    walk_firefox(root, &mut vec![], &mut out);
    Ok(out)
}

/// Detects the export format, drops repeated urls and sets the default `enrich` flags.
pub fn parse_export(content: &str) -> Result<Vec<ImportEntry>, AppError> {
    let trimmed = content.trim_start();
    let entries = if trimmed.starts_with('{') {
        parse_firefox_json(trimmed)?
    } else {
        parse_netscape(content)
    };

    if entries.is_empty() {
        return Err(AppError::validation("No bookmarks found in file"));
    }

    let mut seen = HashSet::new();
    Ok(entries
        .into_iter()
        .filter(|entry| seen.insert(entry.url.clone()))
        .map(|mut entry| {
            entry.enrich = should_enrich(&entry.url, entry.title.as_deref());
            entry
        })
        .collect())
}
