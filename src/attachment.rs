//! Attachment & diagram loading and their file pages.

use crate::config::{FILE_NAMESPACE, NS_FILE};
use crate::ids;
use crate::models::{
    AttachmentFile, AttachmentOwner, AttachmentVersion, DiagramContent, Page, PageKind, PageMap,
    Revision, RevisionMap,
};
use crate::source::{AttachmentVersionRow, DiagramRow};
use crate::title::normalize_whitespace;
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

pub type AttachmentMap = BTreeMap<u32, AttachmentFile>;
pub type DiagramMap = BTreeMap<u32, DiagramContent>;

/// Original filename -> attachment ids sharing it (only groups of two or more)
pub type SameNameTable = BTreeMap<String, Vec<u32>>;

static INCLUDE_DIAGRAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{include_diagram\((\d+)--").unwrap());

static DATA_URL_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^data:[^,]*;base64,").unwrap());

/// Appends `_<id>` to `candidate` until it is free, then claims it.
fn reserve_filename(taken: &mut FxHashSet<String>, mut candidate: String, id: u32) -> String {
    while taken.contains(&candidate) {
        debug!(file = %candidate, id, "Target filename taken, suffixing again");
        candidate = with_id_suffix(&candidate, id);
    }
    taken.insert(candidate.clone());
    candidate
}

/// Inserts `_<id>` in front of the extension (or at the end without one).
pub fn with_id_suffix(filename: &str, id: u32) -> String {
    match filename.rfind('.') {
        Some(dot) if dot > 0 => format!("{}_{}{}", &filename[..dot], id, &filename[dot..]),
        _ => format!("{filename}_{id}"),
    }
}

pub fn file_title(target_filename: &str) -> String {
    format!("{FILE_NAMESPACE}:{target_filename}")
}

/// Merges live and orphaned attachment rows into one history per attachment id.
///
/// Rows whose owner is not a migrated page are skipped. Every version of an
/// attachment shares one target filename; when several ids normalize to the
/// same filename, all but the lowest id get an `_<id>` suffix.
pub fn collect_attachments(
    rows: Vec<AttachmentVersionRow>,
    pages: &PageMap,
) -> (AttachmentMap, SameNameTable) {
    let by_content: FxHashMap<u32, u32> = pages
        .values()
        .filter_map(|p| p.content_id.map(|content| (content, p.id)))
        .collect();

    let mut attachments = AttachmentMap::new();
    let mut skipped = 0usize;
    for row in rows {
        let owner = match row.container_type.as_str() {
            "WikiPage" if pages.contains_key(&row.container_id) => {
                AttachmentOwner::Page(row.container_id)
            }
            "WikiContent" if by_content.contains_key(&row.container_id) => {
                AttachmentOwner::Content(row.container_id)
            }
            _ => {
                skipped += 1;
                continue;
            }
        };
        let source_path = match row.disk_directory.as_deref().filter(|d| !d.is_empty()) {
            Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), row.disk_filename),
            None => row.disk_filename.clone(),
        };
        let filename = normalize_whitespace(&row.filename);
        attachments
            .entry(row.attachment_id)
            .or_insert_with(|| AttachmentFile {
                id: row.attachment_id,
                versions: BTreeMap::new(),
            })
            .versions
            .insert(
                row.version,
                AttachmentVersion {
                    created_on: row.created_on,
                    updated_on: row.updated_on,
                    summary: row.description.unwrap_or_default(),
                    author_id: row.author_id,
                    target_filename: filename.clone(),
                    filename,
                    source_path,
                    owner,
                },
            );
    }
    if skipped > 0 {
        debug!(skipped, "Attachment rows without a migrated owner");
    }

    let mut groups: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    for file in attachments.values() {
        if let Some(latest) = file.latest() {
            groups
                .entry(latest.filename.clone())
                .or_default()
                .insert(file.id);
        }
    }

    // Every bare name is owned by the lowest id using it, so suffixed names
    // must steer clear of all of them.
    let mut taken: FxHashSet<String> = groups.keys().cloned().collect();
    let mut same_name = SameNameTable::new();
    for (name, members) in groups {
        let members: Vec<u32> = members.into_iter().collect();
        for (index, id) in members.iter().enumerate() {
            let target = if index == 0 {
                name.clone()
            } else {
                reserve_filename(&mut taken, with_id_suffix(&name, *id), *id)
            };
            if let Some(file) = attachments.get_mut(id) {
                for version in file.versions.values_mut() {
                    version.target_filename = target.clone();
                }
            }
        }
        if members.len() > 1 {
            same_name.insert(name, members);
        }
    }

    info!(
        attachments = attachments.len(),
        same_name = same_name.len(),
        "Attachments collected"
    );
    (attachments, same_name)
}

/// Diagram ids referenced by `{{include_diagram(ID--alt)}}` in any revision.
pub fn referenced_diagrams(revisions: &RevisionMap) -> Vec<u32> {
    let mut found = BTreeSet::new();
    for revision in revisions.values().flat_map(BTreeMap::values) {
        for captures in INCLUDE_DIAGRAM.captures_iter(&revision.text) {
            if let Ok(id) = captures[1].parse::<u32>() {
                found.insert(id);
            }
        }
    }
    found.into_iter().collect()
}

pub fn diagram_filename(title: &str, id: u32) -> String {
    let base = normalize_whitespace(title);
    let base = match base.len().checked_sub(4) {
        Some(cut) if base.is_char_boundary(cut) && base[cut..].eq_ignore_ascii_case(".png") => {
            base[..cut].to_string()
        }
        _ => base,
    };
    format!("{base}_{id}.png")
}

/// Diagram files share the upload directory with attachments, so a name
/// already used by an attachment target (or an earlier diagram) is suffixed.
pub fn collect_diagrams(mut rows: Vec<DiagramRow>, attachments: &AttachmentMap) -> DiagramMap {
    let mut taken: FxHashSet<String> = attachments
        .values()
        .filter_map(AttachmentFile::latest)
        .map(|latest| latest.target_filename.clone())
        .collect();
    rows.sort_by_key(|row| row.id);

    rows.into_iter()
        .map(|row| {
            let target_filename =
                reserve_filename(&mut taken, diagram_filename(&row.title, row.id), row.id);
            let data_base64 = DATA_URL_PREFIX.replace(row.data.trim(), "").into_owned();
            (
                row.id,
                DiagramContent {
                    id: row.id,
                    title: row.title,
                    data_base64,
                    formatted_title: file_title(&target_filename),
                    target_filename,
                    author_id: row.author_id,
                    updated_on: row.updated_on,
                },
            )
        })
        .collect()
}

/// Adds one file page with a single revision per attachment and diagram.
pub fn synthesize_file_pages(
    attachments: &AttachmentMap,
    diagrams: &DiagramMap,
    users: &FxHashMap<u32, String>,
    pages: &mut PageMap,
    revisions: &mut RevisionMap,
) -> Result<usize> {
    let by_content: FxHashMap<u32, u32> = pages
        .values()
        .filter_map(|p| p.content_id.map(|content| (content, p.id)))
        .collect();
    let mut created = 0usize;

    for file in attachments.values() {
        let Some(latest) = file.latest() else {
            continue;
        };
        let owner_id = match latest.owner {
            AttachmentOwner::Page(id) => Some(id),
            AttachmentOwner::Content(content) => by_content.get(&content).copied(),
        };
        let owner = owner_id.and_then(|id| pages.get(&id));
        let id = ids::attachment_page_id(file.id)?;
        let page = file_page(
            id,
            PageKind::Attachment,
            &latest.target_filename,
            owner,
        );
        let revision = file_revision(
            id,
            latest.author_id,
            users,
            latest.summary.clone(),
            format!("Uploaded {}", latest.filename),
            latest.updated_on,
        );
        insert_file_page(page, revision, pages, revisions);
        created += 1;
    }

    for diagram in diagrams.values() {
        let id = ids::diagram_page_id(diagram.id)?;
        let page = file_page(id, PageKind::Diagram, &diagram.target_filename, None);
        let revision = file_revision(
            id,
            diagram.author_id,
            users,
            String::new(),
            format!("Diagram {}", diagram.title),
            diagram.updated_on,
        );
        insert_file_page(page, revision, pages, revisions);
        created += 1;
    }

    info!(file_pages = created, "File pages synthesized");
    Ok(created)
}

fn file_page(id: u32, kind: PageKind, target_filename: &str, owner: Option<&Page>) -> Page {
    Page {
        id,
        kind,
        namespace: NS_FILE,
        wiki_id: owner.and_then(|o| o.wiki_id),
        project_id: owner.and_then(|o| o.project_id),
        project_name: owner.and_then(|o| o.project_name.clone()),
        project_identifier: owner.and_then(|o| o.project_identifier.clone()),
        title: target_filename.to_string(),
        parent_id: None,
        content_id: None,
        version: 1,
        protected: false,
        categories: Vec::new(),
        formatted_title: file_title(target_filename),
        redirects_to: None,
    }
}

fn file_revision(
    id: u32,
    author_id: Option<u32>,
    users: &FxHashMap<u32, String>,
    text: String,
    comment: String,
    timestamp: chrono::NaiveDateTime,
) -> Revision {
    Revision {
        rev_id: id,
        page_id: id,
        version: 1,
        author_id,
        author_name: author_id.and_then(|a| users.get(&a).cloned()),
        text,
        comment,
        timestamp,
        parent_rev_id: None,
    }
}

fn insert_file_page(page: Page, revision: Revision, pages: &mut PageMap, revisions: &mut RevisionMap) {
    if pages.contains_key(&page.id) {
        warn!(page_id = page.id, "File page id already taken, skipping");
        return;
    }
    let mut versions = BTreeMap::new();
    versions.insert(1, revision);
    revisions.insert(page.id, versions);
    pages.insert(page.id, page);
}
