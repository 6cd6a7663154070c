//! Read-only view of the Redmine database.
//!
//! The migration core only needs a handful of row shapes. [`SourceData`] is the
//! seam behind which a live connection would sit; [`JsonSnapshot`] serves the
//! same rows from a JSON export of the relevant tables (optionally bz2
//! compressed), which is what the CLI and the tests use.

use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use chrono::NaiveDateTime;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Deserializer};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;

const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Accepts both ISO-8601 (`T`) and SQL (space) separated timestamps, with an optional `Z`.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim().trim_end_matches('Z');
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(trimmed, fmt).ok())
}

fn de_timestamp<'de, D>(deserializer: D) -> std::result::Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

fn active_status() -> i32 {
    crate::config::WIKI_STATUS_ACTIVE
}

#[derive(Debug, Clone, Deserialize)]
pub struct WikiRow {
    pub id: u32,
    pub project_id: u32,
    #[serde(default = "active_status")]
    pub status: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRow {
    pub id: u32,
    pub name: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRow {
    pub id: u32,
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WikiPageRow {
    pub id: u32,
    pub wiki_id: u32,
    pub title: String,
    pub parent_id: Option<u32>,
    #[serde(default)]
    pub protected: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WikiContentRow {
    pub id: u32,
    pub page_id: u32,
    pub version: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentVersionRow {
    pub id: u32,
    pub page_id: u32,
    pub version: u32,
    pub author_id: Option<u32>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub comments: String,
    #[serde(deserialize_with = "de_timestamp")]
    pub updated_on: NaiveDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectRow {
    pub wiki_id: u32,
    pub title: String,
    pub redirects_to: String,
    pub redirects_to_wiki_id: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentVersionRow {
    pub attachment_id: u32,
    pub version: u32,
    /// `WikiPage` for live attachments, `WikiContent` for ones left on an old content row
    pub container_type: String,
    pub container_id: u32,
    pub filename: String,
    #[serde(default)]
    pub disk_directory: Option<String>,
    pub disk_filename: String,
    pub author_id: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(deserialize_with = "de_timestamp")]
    pub created_on: NaiveDateTime,
    #[serde(deserialize_with = "de_timestamp")]
    pub updated_on: NaiveDateTime,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagramRow {
    pub id: u32,
    pub title: String,
    /// Base64 payload, possibly wrapped in a `data:` URL
    pub data: String,
    pub author_id: Option<u32>,
    #[serde(deserialize_with = "de_timestamp")]
    pub updated_on: NaiveDateTime,
}

/// Page metadata joined with its wiki and current content row.
#[derive(Debug, Clone)]
pub struct PageMetaRow {
    pub page_id: u32,
    pub wiki_id: u32,
    pub project_id: u32,
    pub title: String,
    pub parent_id: Option<u32>,
    pub content_id: u32,
    pub version: u32,
    pub protected: bool,
}

pub trait SourceData {
    fn wikis(&self) -> Result<Vec<WikiRow>>;
    fn projects(&self) -> Result<Vec<ProjectRow>>;
    fn users(&self) -> Result<Vec<UserRow>>;
    /// Pages of the given wikis that have a content row.
    fn pages(&self, wiki_ids: &[u32]) -> Result<Vec<PageMetaRow>>;
    /// Content versions of the given pages, ascending by version within a page.
    fn content_versions(&self, page_ids: &[u32]) -> Result<Vec<ContentVersionRow>>;
    fn redirects(&self, wiki_ids: &[u32]) -> Result<Vec<RedirectRow>>;
    fn attachment_versions(&self) -> Result<Vec<AttachmentVersionRow>>;
    fn diagrams(&self, ids: &[u32]) -> Result<Vec<DiagramRow>>;
}

/// Table export of a Redmine database.
#[derive(Debug, Default, Deserialize)]
pub struct JsonSnapshot {
    #[serde(default)]
    pub wikis: Vec<WikiRow>,
    #[serde(default)]
    pub projects: Vec<ProjectRow>,
    #[serde(default)]
    pub users: Vec<UserRow>,
    #[serde(default)]
    pub wiki_pages: Vec<WikiPageRow>,
    #[serde(default)]
    pub wiki_contents: Vec<WikiContentRow>,
    #[serde(default)]
    pub wiki_content_versions: Vec<ContentVersionRow>,
    #[serde(default)]
    pub wiki_redirects: Vec<RedirectRow>,
    #[serde(default)]
    pub attachments: Vec<AttachmentVersionRow>,
    #[serde(default)]
    pub diagrams: Vec<DiagramRow>,
}

impl JsonSnapshot {
    /// Opens a `.json` or `.json.bz2` snapshot.
    pub fn open(path: &str) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("Failed to open source snapshot: {}", path))?;
        let reader: Box<dyn Read> = if path.ends_with(".bz2") {
            Box::new(BzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let snapshot: JsonSnapshot = serde_json::from_reader(BufReader::new(reader))
            .with_context(|| format!("Failed to parse source snapshot: {}", path))?;

        info!(
            wikis = snapshot.wikis.len(),
            pages = snapshot.wiki_pages.len(),
            versions = snapshot.wiki_content_versions.len(),
            "Source snapshot loaded"
        );
        Ok(snapshot)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse source snapshot")
    }
}

impl SourceData for JsonSnapshot {
    fn wikis(&self) -> Result<Vec<WikiRow>> {
        Ok(self.wikis.clone())
    }

    fn projects(&self) -> Result<Vec<ProjectRow>> {
        Ok(self.projects.clone())
    }

    fn users(&self) -> Result<Vec<UserRow>> {
        Ok(self.users.clone())
    }

    fn pages(&self, wiki_ids: &[u32]) -> Result<Vec<PageMetaRow>> {
        let wanted: FxHashSet<u32> = wiki_ids.iter().copied().collect();
        let projects: FxHashMap<u32, u32> =
            self.wikis.iter().map(|w| (w.id, w.project_id)).collect();
        let contents: FxHashMap<u32, &WikiContentRow> =
            self.wiki_contents.iter().map(|c| (c.page_id, c)).collect();

        let mut rows = Vec::new();
        for page in self.wiki_pages.iter().filter(|p| wanted.contains(&p.wiki_id)) {
            let (Some(content), Some(project_id)) =
                (contents.get(&page.id), projects.get(&page.wiki_id))
            else {
                continue;
            };
            rows.push(PageMetaRow {
                page_id: page.id,
                wiki_id: page.wiki_id,
                project_id: *project_id,
                title: page.title.clone(),
                parent_id: page.parent_id,
                content_id: content.id,
                version: content.version,
                protected: page.protected,
            });
        }
        rows.sort_by_key(|r| r.page_id);
        Ok(rows)
    }

    fn content_versions(&self, page_ids: &[u32]) -> Result<Vec<ContentVersionRow>> {
        let wanted: FxHashSet<u32> = page_ids.iter().copied().collect();
        let mut rows: Vec<ContentVersionRow> = self
            .wiki_content_versions
            .iter()
            .filter(|v| wanted.contains(&v.page_id))
            .cloned()
            .collect();
        rows.sort_by_key(|v| (v.page_id, v.version));
        Ok(rows)
    }

    fn redirects(&self, wiki_ids: &[u32]) -> Result<Vec<RedirectRow>> {
        let wanted: FxHashSet<u32> = wiki_ids.iter().copied().collect();
        Ok(self
            .wiki_redirects
            .iter()
            .filter(|r| wanted.contains(&r.wiki_id))
            .cloned()
            .collect())
    }

    fn attachment_versions(&self) -> Result<Vec<AttachmentVersionRow>> {
        let mut rows = self.attachments.clone();
        rows.sort_by_key(|a| (a.attachment_id, a.version));
        Ok(rows)
    }

    fn diagrams(&self, ids: &[u32]) -> Result<Vec<DiagramRow>> {
        let wanted: FxHashSet<u32> = ids.iter().copied().collect();
        let mut rows: Vec<DiagramRow> = self
            .diagrams
            .iter()
            .filter(|d| wanted.contains(&d.id))
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }
}
