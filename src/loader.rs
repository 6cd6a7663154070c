//! Page & revision loading from the source database.

use crate::config::{NS_MAIN, WIKI_STATUS_ACTIVE};
use crate::customize::Customizations;
use crate::error::IntegrityError;
use crate::ids;
use crate::models::{Page, PageKind, PageMap, Revision, RevisionMap};
use crate::source::{ProjectRow, SourceData};
use crate::title;
use anyhow::Result;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WikiProject {
    pub project_id: u32,
    pub name: Option<String>,
    pub identifier: Option<String>,
}

/// Pages and revisions of every migrated wiki, titles assigned.
#[derive(Debug, Default)]
pub struct LoadedWiki {
    /// Migrated wikis only
    pub wikis: FxHashMap<u32, WikiProject>,
    pub pages: PageMap,
    pub revisions: RevisionMap,
    /// user id -> login
    pub users: FxHashMap<u32, String>,
    pub missing_authors: usize,
}

pub fn load<S: SourceData + ?Sized>(source: &S, custom: &Customizations) -> Result<LoadedWiki> {
    let projects: FxHashMap<u32, ProjectRow> = source
        .projects()?
        .into_iter()
        .map(|p| (p.id, p))
        .collect();

    let mut wiki_ids = Vec::new();
    let mut wikis = FxHashMap::default();
    for wiki in source.wikis()? {
        if wiki.status != WIKI_STATUS_ACTIVE {
            debug!(wiki_id = wiki.id, status = wiki.status, "Skipping inactive wiki");
            continue;
        }
        if custom.is_unwanted(wiki.project_id) {
            info!(wiki_id = wiki.id, project_id = wiki.project_id, "Skipping unwanted project");
            continue;
        }
        wiki_ids.push(wiki.id);
        let project = projects.get(&wiki.project_id);
        wikis.insert(
            wiki.id,
            WikiProject {
                project_id: wiki.project_id,
                name: project.map(|p| p.name.clone()),
                identifier: project.map(|p| p.identifier.clone()),
            },
        );
    }

    let users: FxHashMap<u32, String> = source
        .users()?
        .into_iter()
        .map(|u| (u.id, u.login))
        .collect();

    let mut pages = PageMap::new();
    for row in source.pages(&wiki_ids)? {
        ids::check_native(row.page_id)?;
        let project = projects.get(&row.project_id);
        pages.insert(
            row.page_id,
            Page {
                id: row.page_id,
                kind: PageKind::Native,
                namespace: NS_MAIN,
                wiki_id: Some(row.wiki_id),
                project_id: Some(row.project_id),
                project_name: project.map(|p| p.name.clone()),
                project_identifier: project.map(|p| p.identifier.clone()),
                title: row.title,
                parent_id: row.parent_id,
                content_id: Some(row.content_id),
                version: row.version,
                protected: row.protected,
                categories: Vec::new(),
                formatted_title: String::new(),
                redirects_to: None,
            },
        );
    }
    title::assign_titles(&mut pages)?;

    let page_ids: Vec<u32> = pages.keys().copied().collect();
    let mut revisions = RevisionMap::new();
    let mut missing_authors = 0usize;
    for row in source.content_versions(&page_ids)? {
        ids::check_native(row.id)?;
        let author_name = row.author_id.and_then(|id| users.get(&id).cloned());
        if author_name.is_none() {
            missing_authors += 1;
            debug!(page_id = row.page_id, version = row.version, "Revision author not found");
        }
        revisions.entry(row.page_id).or_default().insert(
            row.version,
            Revision {
                rev_id: row.id,
                page_id: row.page_id,
                version: row.version,
                author_id: row.author_id,
                author_name,
                text: row.data,
                comment: row.comments,
                timestamp: row.updated_on,
                parent_rev_id: None,
            },
        );
    }

    if custom.current_revision_only {
        for versions in revisions.values_mut() {
            if let Some((&latest, _)) = versions.iter().next_back() {
                versions.retain(|version, _| *version == latest);
            }
        }
    }
    for versions in revisions.values_mut() {
        relink(versions);
    }

    let report = custom.apply_page_rules(&mut pages, &mut revisions);
    if report.removed + report.renamed + report.categorized > 0 {
        info!(
            removed = report.removed,
            renamed = report.renamed,
            categorized = report.categorized,
            "Customizations applied"
        );
    }
    if missing_authors > 0 {
        warn!(count = missing_authors, "Revisions without a resolvable author");
    }

    info!(
        wikis = wiki_ids.len(),
        pages = pages.len(),
        revisions = revisions.values().map(BTreeMap::len).sum::<usize>(),
        "Pages loaded"
    );

    Ok(LoadedWiki {
        wikis,
        pages,
        revisions,
        users,
        missing_authors,
    })
}

/// Rewrites `parent_rev_id` so versions form a single chain in ascending order.
pub fn relink(versions: &mut BTreeMap<u32, Revision>) {
    let mut previous = None;
    for revision in versions.values_mut() {
        revision.parent_rev_id = previous;
        previous = Some(revision.rev_id);
    }
}

pub fn validate_revision_chains(revisions: &RevisionMap) -> Result<(), IntegrityError> {
    for (page_id, versions) in revisions {
        let mut previous: Option<u32> = None;
        for (version, revision) in versions {
            if revision.page_id != *page_id
                || revision.version != *version
                || revision.parent_rev_id != previous
            {
                return Err(IntegrityError::BrokenRevisionChain {
                    page_id: *page_id,
                    version: *version,
                });
            }
            previous = Some(revision.rev_id);
        }
    }
    Ok(())
}
