use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Page id -> page record
pub type PageMap = BTreeMap<u32, Page>;

/// Page id -> version -> revision record
pub type RevisionMap = BTreeMap<u32, BTreeMap<u32, Revision>>;

/// Page id -> version -> converted wikitext
pub type WikitextMap = BTreeMap<u32, BTreeMap<u32, String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Native,
    Redirect,
    Attachment,
    Diagram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: u32,
    pub kind: PageKind,
    pub namespace: i32,
    pub wiki_id: Option<u32>,
    pub project_id: Option<u32>,
    pub project_name: Option<String>,
    pub project_identifier: Option<String>,
    /// Title as stored in the source wiki
    pub title: String,
    /// `None` marks a root page
    pub parent_id: Option<u32>,
    pub content_id: Option<u32>,
    /// Latest version number
    pub version: u32,
    pub protected: bool,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Globally unique title in the target wiki
    pub formatted_title: String,
    #[serde(default)]
    pub redirects_to: Option<String>,
}

impl Page {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, PageKind::Attachment | PageKind::Diagram)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub rev_id: u32,
    pub page_id: u32,
    pub version: u32,
    pub author_id: Option<u32>,
    pub author_name: Option<String>,
    /// Source markup; empty while a redirect body is pending
    pub text: String,
    pub comment: String,
    pub timestamp: NaiveDateTime,
    /// Revision id of the previous version, `None` for the first one
    pub parent_rev_id: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentOwner {
    Page(u32),
    Content(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentVersion {
    pub created_on: NaiveDateTime,
    pub updated_on: NaiveDateTime,
    pub summary: String,
    pub author_id: Option<u32>,
    pub filename: String,
    pub target_filename: String,
    /// Relative to the source files directory
    pub source_path: String,
    pub owner: AttachmentOwner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentFile {
    pub id: u32,
    pub versions: BTreeMap<u32, AttachmentVersion>,
}

impl AttachmentFile {
    pub fn latest(&self) -> Option<&AttachmentVersion> {
        self.versions.values().next_back()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagramContent {
    pub id: u32,
    pub title: String,
    pub data_base64: String,
    pub target_filename: String,
    pub formatted_title: String,
    pub author_id: Option<u32>,
    pub updated_on: NaiveDateTime,
}

/// A redirect revision whose body waits for its target to be resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRedirect {
    pub page_id: u32,
    pub version: u32,
    pub target_wiki_id: u32,
    pub target_title: String,
    /// `true` when the page itself was fabricated for the redirect
    pub synthetic: bool,
}
