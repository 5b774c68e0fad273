// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Music search
//!
//! The HTTP layer talks to a [`SearchProvider`]; the shipped
//! [`CatalogSearchProvider`] answers from an in-memory catalog, optionally
//! loaded from a JSON file (an array of [`SearchResult`]).

use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Results returned when the caller gives no limit.
pub const DEFAULT_LIMIT: usize = 20;
/// Hard cap on results per query.
pub const MAX_LIMIT: usize = 50;

/// Where a result can be downloaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSource {
    Youtube,
    Spotify,
    Soundcloud,
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub id: String,
    pub title: String,
    pub artist: String,
    /// Display duration, e.g. `"3:45"`
    #[serde(default)]
    pub duration: String,
    #[serde(default)]
    pub thumbnail_url: String,
    pub source: SearchSource,
    pub url: String,
    #[serde(default)]
    pub quality: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<SearchResult>,
}

/// A validated search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub text: String,
    pub limit: usize,
}

impl SearchQuery {
    /// Trim the text and clamp the limit into `1..=MAX_LIMIT`.
    pub fn new(text: &str, limit: Option<usize>) -> Result<Self, SearchError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        Ok(Self {
            text: text.to_string(),
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        })
    }

    fn tokens(&self) -> Vec<String> {
        self.text.split_whitespace().map(str::to_lowercase).collect()
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search query must not be empty")]
    EmptyQuery,

    #[error("search provider failed: {0}")]
    Provider(String),
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError>;

    fn name(&self) -> &'static str;
}

/// Searches a fixed list of tracks.
#[derive(Debug, Clone, Default)]
pub struct CatalogSearchProvider {
    entries: Vec<SearchResult>,
}

impl CatalogSearchProvider {
    pub fn new(entries: Vec<SearchResult>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a catalog from a JSON array file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let entries: Vec<SearchResult> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))?;
        tracing::info!(entries = entries.len(), path = %path.display(), "Loaded search catalog");
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SearchProvider for CatalogSearchProvider {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        let tokens = query.tokens();

        // Every token must appear in the title or the artist
        let results: Vec<SearchResult> = self
            .entries
            .iter()
            .filter(|entry| {
                let haystack = format!("{} {}", entry.title, entry.artist).to_lowercase();
                tokens.iter().all(|token| haystack.contains(token.as_str()))
            })
            .take(query.limit)
            .cloned()
            .collect();

        tracing::debug!(query = %query.text, hits = results.len(), "Catalog search");
        Ok(results)
    }

    fn name(&self) -> &'static str {
        "catalog"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, title: &str, artist: &str, source: SearchSource) -> SearchResult {
        SearchResult {
            id: id.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            duration: "3:30".to_string(),
            thumbnail_url: String::new(),
            source,
            url: format!("http://example.com/{}.mp3", id),
            quality: "320kbps".to_string(),
        }
    }

    fn catalog() -> CatalogSearchProvider {
        CatalogSearchProvider::new(vec![
            track("1", "Blue Monday", "New Order", SearchSource::Direct),
            track("2", "Blue in Green", "Miles Davis", SearchSource::Youtube),
            track("3", "So What", "Miles Davis", SearchSource::Spotify),
        ])
    }

    #[test]
    fn test_query_validation() {
        assert!(matches!(SearchQuery::new("   ", None), Err(SearchError::EmptyQuery)));
        assert_eq!(SearchQuery::new(" blue ", None).unwrap().text, "blue");
        assert_eq!(SearchQuery::new("x", None).unwrap().limit, DEFAULT_LIMIT);
        assert_eq!(SearchQuery::new("x", Some(0)).unwrap().limit, 1);
        assert_eq!(SearchQuery::new("x", Some(500)).unwrap().limit, MAX_LIMIT);
    }

    #[tokio::test]
    async fn test_matches_title_and_artist_case_insensitively() {
        let provider = catalog();

        let hits = provider.search(&SearchQuery::new("BLUE", None).unwrap()).await.unwrap();
        assert_eq!(hits.len(), 2);

        let hits = provider.search(&SearchQuery::new("miles blue", None).unwrap()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "2");

        let hits = provider.search(&SearchQuery::new("davis", Some(1)).unwrap()).await.unwrap();
        assert_eq!(hits.len(), 1);

        assert!(provider.search(&SearchQuery::new("nothing", None).unwrap()).await.unwrap().is_empty());
    }

    #[test]
    fn test_source_serializes_as_plain_kind() {
        let json = serde_json::to_value(track("9", "t", "a", SearchSource::Soundcloud)).unwrap();
        assert_eq!(json["source"], "soundcloud");
        assert_eq!(json["thumbnail_url"], "");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","title":"Song","artist":"Band","source":"youtube","url":"https://example.com/a.mp3"}]"#,
        )
        .unwrap();

        let provider = CatalogSearchProvider::from_file(&path).unwrap();
        assert_eq!(provider.len(), 1);

        std::fs::write(&path, "not json").unwrap();
        assert!(CatalogSearchProvider::from_file(&path).is_err());
    }
}
