//! Redirect synthesis.
//!
//! The target model has no redirect table, so every source redirect becomes a
//! revision whose body is a `#REDIRECT` directive: appended to the existing
//! page of that title, or on a fabricated root page when none exists. Bodies
//! are filled in a second pass once the whole title space is known.

use crate::config::NS_MAIN;
use crate::ids::RedirectIds;
use crate::links::is_same_title;
use crate::loader::WikiProject;
use crate::models::{Page, PageKind, PageMap, PendingRedirect, Revision, RevisionMap};
use crate::source::RedirectRow;
use crate::title;
use anyhow::Result;
use chrono::NaiveDateTime;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedRedirect {
    pub page_id: u32,
    pub version: u32,
    pub target_wiki_id: u32,
    pub target_title: String,
    pub synthetic: bool,
}

#[derive(Debug, Default)]
pub struct RedirectOutcome {
    pub appended: usize,
    pub synthesized: usize,
    pub resolved: usize,
    pub unresolved: Vec<UnresolvedRedirect>,
}

pub fn redirect_body(target: &str) -> String {
    format!("#REDIRECT [[{target}]]")
}

/// Creates the pending revisions (and pages) for every redirect row.
///
/// Rows are processed in `(wiki, title, target)` order so a rerun over the same
/// source produces the same ids.
pub fn synthesize(
    rows: &[RedirectRow],
    wikis: &FxHashMap<u32, WikiProject>,
    pages: &mut PageMap,
    revisions: &mut RevisionMap,
    ids: &mut RedirectIds,
) -> Result<(Vec<PendingRedirect>, RedirectOutcome)> {
    let mut ordered: Vec<&RedirectRow> = rows.iter().collect();
    ordered.sort_by(|a, b| {
        (a.wiki_id, &a.title, a.redirects_to_wiki_id, &a.redirects_to).cmp(&(
            b.wiki_id,
            &b.title,
            b.redirects_to_wiki_id,
            &b.redirects_to,
        ))
    });

    // Titles differing only in whitespace or `_` end up as the same page title.
    let existing: FxHashMap<(u32, String), u32> = pages
        .values()
        .filter(|p| p.kind == PageKind::Native)
        .filter_map(|p| {
            p.wiki_id
                .map(|wiki| ((wiki, title::normalize_whitespace(&p.title)), p.id))
        })
        .collect();
    let mut taken_titles: FxHashSet<String> =
        pages.values().map(|p| p.formatted_title.clone()).collect();

    let mut seen: FxHashSet<(u32, String)> = FxHashSet::default();
    let mut pending = Vec::new();
    let mut outcome = RedirectOutcome::default();

    for row in ordered {
        let source_key = (row.wiki_id, title::normalize_whitespace(&row.title));
        if !seen.insert(source_key.clone()) {
            warn!(wiki_id = row.wiki_id, title = %row.title, "Duplicate redirect source skipped");
            continue;
        }

        if let Some(&page_id) = existing.get(&source_key) {
            let rev_id = ids.next_id()?;
            let versions = revisions.entry(page_id).or_default();
            let latest = versions.values().next_back();
            let Some(page) = pages.get_mut(&page_id) else {
                continue;
            };
            let version = page
                .version
                .max(versions.keys().next_back().copied().unwrap_or(0))
                + 1;
            let revision = Revision {
                rev_id,
                page_id,
                version,
                author_id: latest.and_then(|r| r.author_id),
                author_name: latest.and_then(|r| r.author_name.clone()),
                text: String::new(),
                comment: format!("Redirect to {}", row.redirects_to),
                timestamp: latest.map(|r| r.timestamp).unwrap_or_default(),
                parent_rev_id: latest.map(|r| r.rev_id),
            };
            versions.insert(version, revision);
            page.version = version;
            outcome.appended += 1;
            pending.push(PendingRedirect {
                page_id,
                version,
                target_wiki_id: row.redirects_to_wiki_id,
                target_title: row.redirects_to.clone(),
                synthetic: false,
            });
            continue;
        }

        let id = ids.next_id()?;
        let project = wikis.get(&row.wiki_id);
        let mut page = Page {
            id,
            kind: PageKind::Redirect,
            namespace: NS_MAIN,
            wiki_id: Some(row.wiki_id),
            project_id: project.map(|p| p.project_id),
            project_name: project.and_then(|p| p.name.clone()),
            project_identifier: project.and_then(|p| p.identifier.clone()),
            title: row.title.clone(),
            parent_id: None,
            content_id: None,
            version: 1,
            protected: false,
            categories: Vec::new(),
            formatted_title: String::new(),
            redirects_to: None,
        };
        page.formatted_title = title::normalize_whitespace(&title::root_segment(&page));
        if !taken_titles.insert(page.formatted_title.clone()) {
            warn!(
                wiki_id = row.wiki_id,
                title = %page.formatted_title,
                "Redirect source collides with an existing title, skipped"
            );
            continue;
        }
        debug!(page_id = id, title = %page.formatted_title, "Synthesized redirect page");
        pages.insert(id, page);

        let mut versions = BTreeMap::new();
        versions.insert(
            1,
            Revision {
                rev_id: id,
                page_id: id,
                version: 1,
                author_id: None,
                author_name: None,
                text: String::new(),
                comment: format!("Redirect to {}", row.redirects_to),
                timestamp: NaiveDateTime::default(),
                parent_rev_id: None,
            },
        );
        revisions.insert(id, versions);
        outcome.synthesized += 1;
        pending.push(PendingRedirect {
            page_id: id,
            version: 1,
            target_wiki_id: row.redirects_to_wiki_id,
            target_title: row.redirects_to.clone(),
            synthetic: true,
        });
    }

    Ok((pending, outcome))
}

/// Finds the native page a redirect points at: exact raw title in the target
/// wiki first, loose title second.
pub fn find_target<'a>(pages: &'a PageMap, wiki_id: u32, raw_title: &str) -> Option<&'a Page> {
    let candidates = || {
        pages
            .values()
            .filter(move |p| p.kind == PageKind::Native && p.wiki_id == Some(wiki_id))
    };
    candidates()
        .find(|p| p.title == raw_title)
        .or_else(|| candidates().find(|p| is_same_title(&p.title, raw_title)))
}

/// Writes redirect bodies for every pending note; drops what cannot be resolved.
pub fn resolve(
    pending: Vec<PendingRedirect>,
    pages: &mut PageMap,
    revisions: &mut RevisionMap,
    outcome: &mut RedirectOutcome,
) {
    for note in pending {
        let target = find_target(pages, note.target_wiki_id, &note.target_title)
            .map(|p| (p.formatted_title.clone(), p.id));

        let Some((target_title, target_id)) = target else {
            warn!(
                page_id = note.page_id,
                version = note.version,
                target = %note.target_title,
                synthetic = note.synthetic,
                "Redirect target not found, dropping redirect revision"
            );
            drop_redirect(&note, pages, revisions);
            outcome.unresolved.push(UnresolvedRedirect {
                page_id: note.page_id,
                version: note.version,
                target_wiki_id: note.target_wiki_id,
                target_title: note.target_title,
                synthetic: note.synthetic,
            });
            continue;
        };

        let target_latest = revisions
            .get(&target_id)
            .and_then(|v| v.values().next_back())
            .map(|r| (r.timestamp, r.author_id, r.author_name.clone()));

        if let Some(revision) = revisions
            .get_mut(&note.page_id)
            .and_then(|v| v.get_mut(&note.version))
        {
            revision.text = redirect_body(&target_title);
            if note.synthetic {
                if let Some((timestamp, author_id, author_name)) = target_latest {
                    revision.timestamp = timestamp;
                    revision.author_id = author_id;
                    revision.author_name = author_name;
                }
            }
        }
        if let Some(page) = pages.get_mut(&note.page_id) {
            page.redirects_to = Some(target_title);
        }
        outcome.resolved += 1;
    }

    info!(
        appended = outcome.appended,
        synthesized = outcome.synthesized,
        resolved = outcome.resolved,
        unresolved = outcome.unresolved.len(),
        "Redirects processed"
    );
}

fn drop_redirect(note: &PendingRedirect, pages: &mut PageMap, revisions: &mut RevisionMap) {
    if note.synthetic {
        pages.remove(&note.page_id);
        revisions.remove(&note.page_id);
        return;
    }
    let Some(versions) = revisions.get_mut(&note.page_id) else {
        return;
    };
    versions.remove(&note.version);
    let restored = versions.keys().next_back().copied();
    if let (Some(page), Some(version)) = (pages.get_mut(&note.page_id), restored) {
        page.version = version;
    }
}
