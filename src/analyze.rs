//! The analyze stage: source rows in, frozen page/revision/file buckets out.

use crate::attachment::{self, AttachmentMap, DiagramMap, SameNameTable};
use crate::buckets::{self, DataBuckets, WriteMode};
use crate::customize::Customizations;
use crate::ids::RedirectIds;
use crate::loader;
use crate::models::{PageKind, PageMap, RevisionMap};
use crate::redirect::{self, UnresolvedRedirect};
use crate::source::SourceData;
use crate::title;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Default)]
pub struct Analysis {
    pub pages: PageMap,
    pub revisions: RevisionMap,
    pub attachments: AttachmentMap,
    pub diagrams: DiagramMap,
    pub same_name: SameNameTable,
    pub unresolved_redirects: Vec<UnresolvedRedirect>,
    pub missing_authors: usize,
}

impl Analysis {
    pub fn count_kind(&self, kind: PageKind) -> usize {
        self.pages.values().filter(|p| p.kind == kind).count()
    }

    pub fn revision_count(&self) -> usize {
        self.revisions.values().map(BTreeMap::len).sum()
    }
}

/// Loader, redirect synthesis, then attachments and diagrams, in that order.
pub fn analyze<S: SourceData + ?Sized>(source: &S, custom: &Customizations) -> Result<Analysis> {
    let mut wiki = loader::load(source, custom)?;

    let mut wiki_ids: Vec<u32> = wiki.wikis.keys().copied().collect();
    wiki_ids.sort_unstable();
    let redirect_rows = source.redirects(&wiki_ids)?;
    let mut redirect_ids = RedirectIds::new();
    let (pending, mut outcome) = redirect::synthesize(
        &redirect_rows,
        &wiki.wikis,
        &mut wiki.pages,
        &mut wiki.revisions,
        &mut redirect_ids,
    )?;
    redirect::resolve(pending, &mut wiki.pages, &mut wiki.revisions, &mut outcome);

    let (attachments, same_name) =
        attachment::collect_attachments(source.attachment_versions()?, &wiki.pages);
    let diagram_ids = attachment::referenced_diagrams(&wiki.revisions);
    let diagrams = attachment::collect_diagrams(source.diagrams(&diagram_ids)?, &attachments);
    attachment::synthesize_file_pages(
        &attachments,
        &diagrams,
        &wiki.users,
        &mut wiki.pages,
        &mut wiki.revisions,
    )?;

    title::check_unique_titles(&wiki.pages)?;
    loader::validate_revision_chains(&wiki.revisions)?;

    Ok(Analysis {
        pages: wiki.pages,
        revisions: wiki.revisions,
        attachments,
        diagrams,
        same_name,
        unresolved_redirects: outcome.unresolved,
        missing_authors: wiki.missing_authors,
    })
}

/// Runs [`analyze`] and writes every bucket later stages read.
pub fn run<S: SourceData + ?Sized>(
    source: &S,
    custom: &Customizations,
    workspace: &Path,
) -> Result<Analysis> {
    let analysis = analyze(source, custom)?;

    let mut store = DataBuckets::open(
        workspace,
        &[
            buckets::WIKI_PAGES,
            buckets::PAGE_REVISIONS,
            buckets::ATTACHMENT_FILES,
            buckets::DIAGRAM_CONTENTS,
            buckets::SAMENAME_ATTACHMENTS,
            buckets::CUSTOMIZATIONS,
            buckets::UNRESOLVED_REDIRECTS,
        ],
    )?;
    store.put(buckets::WIKI_PAGES, &analysis.pages, WriteMode::Overwrite)?;
    store.put(buckets::PAGE_REVISIONS, &analysis.revisions, WriteMode::Overwrite)?;
    store.put(buckets::ATTACHMENT_FILES, &analysis.attachments, WriteMode::Overwrite)?;
    store.put(buckets::DIAGRAM_CONTENTS, &analysis.diagrams, WriteMode::Overwrite)?;
    store.put(buckets::SAMENAME_ATTACHMENTS, &analysis.same_name, WriteMode::Overwrite)?;
    store.put(buckets::CUSTOMIZATIONS, custom, WriteMode::Overwrite)?;
    store.put(
        buckets::UNRESOLVED_REDIRECTS,
        &analysis.unresolved_redirects,
        WriteMode::Overwrite,
    )?;
    store.flush()?;

    info!(
        pages = analysis.pages.len(),
        revisions = analysis.revision_count(),
        redirects = analysis.count_kind(PageKind::Redirect),
        attachments = analysis.attachments.len(),
        diagrams = analysis.diagrams.len(),
        "Analysis complete"
    );
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::JsonSnapshot;
    use tempfile::TempDir;

    const SOURCE: &str = r#"{
        "wikis": [{"id": 1, "project_id": 10}],
        "projects": [{"id": 10, "name": "Project", "identifier": "P"}],
        "users": [{"id": 1, "login": "alice"}],
        "wiki_pages": [
            {"id": 1, "wiki_id": 1, "title": "A", "parent_id": null},
            {"id": 2, "wiki_id": 1, "title": "B", "parent_id": 1}
        ],
        "wiki_contents": [
            {"id": 11, "page_id": 1, "version": 1},
            {"id": 12, "page_id": 2, "version": 1}
        ],
        "wiki_content_versions": [
            {"id": 101, "page_id": 1, "version": 1, "author_id": 1, "data": "{{include_diagram(4--Flow)}}", "updated_on": "2024-01-01 00:00:00"},
            {"id": 201, "page_id": 2, "version": 1, "author_id": 1, "data": "b", "updated_on": "2024-01-02 00:00:00"}
        ],
        "wiki_redirects": [
            {"wiki_id": 1, "title": "B", "redirects_to": "A", "redirects_to_wiki_id": 1}
        ],
        "attachments": [
            {"attachment_id": 5, "version": 1, "container_type": "WikiPage", "container_id": 1,
             "filename": "logo.png", "disk_filename": "a_logo.png", "author_id": 1,
             "created_on": "2024-01-01 00:00:00", "updated_on": "2024-01-01 00:00:00"}
        ],
        "diagrams": [
            {"id": 4, "title": "Flow", "data": "aGVsbG8=", "author_id": 1, "updated_on": "2024-01-01 00:00:00"}
        ]
    }"#;

    #[test]
    fn analyze_builds_full_title_space() {
        let source = JsonSnapshot::from_json(SOURCE).unwrap();
        let analysis = analyze(&source, &Customizations::default()).unwrap();
        assert_eq!(analysis.count_kind(PageKind::Native), 2);
        assert_eq!(analysis.count_kind(PageKind::Attachment), 1);
        assert_eq!(analysis.count_kind(PageKind::Diagram), 1);
        assert_eq!(analysis.revision_count(), 5);
        assert_eq!(analysis.revisions[&2][&2].text, "#REDIRECT [[A_P]]");
    }

    #[test]
    fn attachment_named_like_a_suffixed_duplicate_keeps_titles_unique() {
        let source = JsonSnapshot::from_json(SOURCE).unwrap();
        let mut rows = source.attachment_versions().unwrap();
        let template = rows[0].clone();
        for (id, container, filename) in [(9, 2, "logo.png"), (12, 1, "logo_9.png")] {
            let mut extra = template.clone();
            extra.attachment_id = id;
            extra.container_id = container;
            extra.filename = filename.to_string();
            rows.push(extra);
        }
        let mut snapshot = source;
        snapshot.attachments = rows;

        let analysis = analyze(&snapshot, &Customizations::default()).unwrap();
        assert_eq!(analysis.count_kind(PageKind::Attachment), 3);
        let mut titles: Vec<&str> = analysis
            .pages
            .values()
            .filter(|p| p.kind == PageKind::Attachment)
            .map(|p| p.formatted_title.as_str())
            .collect();
        titles.sort_unstable();
        assert_eq!(titles, vec!["File:logo.png", "File:logo_9.png", "File:logo_9_9.png"]);
    }

    #[test]
    fn run_writes_buckets_that_reload() {
        let dir = TempDir::new().unwrap();
        let source = JsonSnapshot::from_json(SOURCE).unwrap();
        let analysis = run(&source, &Customizations::default(), dir.path()).unwrap();

        let store = DataBuckets::open(
            dir.path(),
            &[buckets::WIKI_PAGES, buckets::PAGE_REVISIONS, buckets::DIAGRAM_CONTENTS],
        )
        .unwrap();
        let pages: PageMap = store.get(buckets::WIKI_PAGES).unwrap();
        let revisions: RevisionMap = store.get(buckets::PAGE_REVISIONS).unwrap();
        let diagrams: DiagramMap = store.get(buckets::DIAGRAM_CONTENTS).unwrap();
        assert_eq!(pages, analysis.pages);
        assert_eq!(revisions, analysis.revisions);
        assert_eq!(diagrams.len(), 1);
    }
}
