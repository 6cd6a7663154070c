use crate::buckets::{self, DataBuckets};
use crate::checkpoint::CheckpointStats;
use crate::ids::{self, IdClass};
use crate::models::{Page, PageKind, PageMap, RevisionMap, WikitextMap};
use crate::redirect::UnresolvedRedirect;
use anyhow::{Context, Result};
use dashmap::{DashMap, DashSet};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Counters collected while converting revisions
#[derive(Default)]
pub struct ConversionStats {
    pub pages_converted: AtomicU64,
    pub revisions_converted: AtomicU64,
    pub links_resolved: AtomicU64,
    pub links_unresolved: AtomicU64,
    pub converter_calls: AtomicU64,
    pub converter_failures: AtomicU64,
    pub converter_timeouts: AtomicU64,
    pub code_blocks: AtomicU64,
    pub macros_expanded: AtomicU64,
}

impl ConversionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_pages(&self) {
        self.pages_converted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_revisions(&self) {
        self.revisions_converted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_links(&self, resolved: u64, unresolved: u64) {
        self.links_resolved.fetch_add(resolved, Ordering::Relaxed);
        self.links_unresolved.fetch_add(unresolved, Ordering::Relaxed);
    }

    pub fn inc_converter_calls(&self) {
        self.converter_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_converter_failures(&self) {
        self.converter_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_converter_timeouts(&self) {
        self.converter_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_code_blocks(&self, count: u64) {
        self.code_blocks.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_macros(&self, count: u64) {
        self.macros_expanded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn pages(&self) -> u64 {
        self.pages_converted.load(Ordering::Relaxed)
    }

    pub fn revisions(&self) -> u64 {
        self.revisions_converted.load(Ordering::Relaxed)
    }

    pub fn resolved(&self) -> u64 {
        self.links_resolved.load(Ordering::Relaxed)
    }

    pub fn unresolved(&self) -> u64 {
        self.links_unresolved.load(Ordering::Relaxed)
    }

    pub fn converter_calls(&self) -> u64 {
        self.converter_calls.load(Ordering::Relaxed)
    }

    pub fn converter_failures(&self) -> u64 {
        self.converter_failures.load(Ordering::Relaxed)
    }

    pub fn converter_timeouts(&self) -> u64 {
        self.converter_timeouts.load(Ordering::Relaxed)
    }

    pub fn code_blocks(&self) -> u64 {
        self.code_blocks.load(Ordering::Relaxed)
    }

    pub fn macros(&self) -> u64 {
        self.macros_expanded.load(Ordering::Relaxed)
    }

    /// Create stats initialized from a checkpoint
    pub fn from_checkpoint(cp: &CheckpointStats) -> Self {
        Self {
            pages_converted: AtomicU64::new(cp.pages_converted),
            revisions_converted: AtomicU64::new(cp.revisions_converted),
            links_resolved: AtomicU64::new(cp.links_resolved),
            links_unresolved: AtomicU64::new(cp.links_unresolved),
            converter_calls: AtomicU64::new(cp.converter_calls),
            converter_failures: AtomicU64::new(cp.converter_failures),
            converter_timeouts: AtomicU64::new(cp.converter_timeouts),
            code_blocks: AtomicU64::new(cp.code_blocks),
            macros_expanded: AtomicU64::new(cp.macros_expanded),
        }
    }

    /// Convert to checkpoint stats for persistence
    pub fn to_checkpoint(&self) -> CheckpointStats {
        CheckpointStats {
            pages_converted: self.pages(),
            revisions_converted: self.revisions(),
            links_resolved: self.resolved(),
            links_unresolved: self.unresolved(),
            converter_calls: self.converter_calls(),
            converter_failures: self.converter_failures(),
            converter_timeouts: self.converter_timeouts(),
            code_blocks: self.code_blocks(),
            macros_expanded: self.macros(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedLink {
    pub page_id: u32,
    pub version: u32,
    pub page_title: String,
    pub target: String,
}

/// Resolution misses gathered from concurrent conversion tasks.
#[derive(Default)]
pub struct Diagnostics {
    unresolved_links: DashMap<u32, Vec<UnresolvedLink>>,
    missing_titles: DashSet<String>,
    missing_attachments: DashSet<String>,
}

impl Diagnostics {
    pub fn record_unresolved_link(&self, page: &Page, version: u32, target: &str) {
        debug!(page_id = page.id, version, link = target, "Unresolved link");
        self.unresolved_links
            .entry(page.id)
            .or_default()
            .push(UnresolvedLink {
                page_id: page.id,
                version,
                page_title: page.formatted_title.clone(),
                target: target.to_string(),
            });
    }

    pub fn record_missing_title(&self, title: &str) {
        self.missing_titles.insert(title.to_string());
    }

    pub fn record_missing_attachment(&self, link: &str) {
        self.missing_attachments.insert(link.to_string());
    }

    /// Drops earlier records for a page that is about to be converted again.
    pub fn forget_page(&self, page_id: u32) {
        self.unresolved_links.remove(&page_id);
    }

    pub fn unresolved_links(&self) -> BTreeMap<u32, Vec<UnresolvedLink>> {
        self.unresolved_links
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub fn unresolved_count(&self) -> usize {
        self.unresolved_links.iter().map(|e| e.value().len()).sum()
    }

    pub fn missing_titles(&self) -> BTreeSet<String> {
        self.missing_titles.iter().map(|t| t.key().clone()).collect()
    }

    pub fn missing_attachments(&self) -> BTreeSet<String> {
        self.missing_attachments.iter().map(|t| t.key().clone()).collect()
    }

    /// Restores diagnostics persisted by an earlier, interrupted run.
    pub fn restore(&self, links: BTreeMap<u32, Vec<UnresolvedLink>>) {
        for (page_id, entries) in links {
            self.unresolved_links.insert(page_id, entries);
        }
    }

    pub fn write_buckets(&self, store: &mut DataBuckets) -> Result<()> {
        let as_flags = |set: BTreeSet<String>| -> BTreeMap<String, bool> {
            set.into_iter().map(|k| (k, true)).collect()
        };
        store.put(
            buckets::UNRESOLVED_LINKS,
            &self.unresolved_links(),
            buckets::WriteMode::Overwrite,
        )?;
        store.put(
            buckets::MISSING_TITLES,
            &as_flags(self.missing_titles()),
            buckets::WriteMode::Merge,
        )?;
        store.put(
            buckets::MISSING_ATTACHMENTS,
            &as_flags(self.missing_attachments()),
            buckets::WriteMode::Merge,
        )?;
        Ok(())
    }

    /// One row per unresolved link, ordered by page then version.
    pub fn write_csv(&self, path: &Path) -> Result<usize> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create CSV: {:?}", path))?;
        writer.write_record(["page_id", "version", "page_title", "target"])?;
        let mut rows = 0usize;
        for entries in self.unresolved_links().values() {
            for entry in entries {
                writer.write_record([
                    entry.page_id.to_string(),
                    entry.version.to_string(),
                    entry.page_title.clone(),
                    entry.target.clone(),
                ])?;
                rows += 1;
            }
        }
        writer.flush()?;
        info!(path = ?path, rows, "Unresolved links written");
        Ok(rows)
    }
}

/// Cross-checks bucket contents after a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub native_pages: usize,
    pub redirect_pages: usize,
    pub attachment_pages: usize,
    pub diagram_pages: usize,
    pub revisions: usize,
    pub revisions_missing_author: usize,
    pub pages_without_revisions: Vec<u32>,
    pub orphan_revision_pages: Vec<u32>,
    pub converted_revisions: usize,
    pub unconverted_revisions: usize,
    pub duplicate_titles: Vec<String>,
    pub broken_chains: Vec<u32>,
    /// Pages whose id lies outside the range reserved for their kind
    pub misplaced_ids: Vec<u32>,
    pub unresolved_links: usize,
    pub missing_titles: usize,
    pub missing_attachments: usize,
    pub unresolved_redirects: usize,
}

impl IntegrityReport {
    pub fn build(pages: &PageMap, revisions: &RevisionMap, wikitext: &WikitextMap) -> Self {
        let mut report = Self::default();
        let mut titles = FxHashSet::default();

        for page in pages.values() {
            match page.kind {
                PageKind::Native => report.native_pages += 1,
                PageKind::Redirect => report.redirect_pages += 1,
                PageKind::Attachment => report.attachment_pages += 1,
                PageKind::Diagram => report.diagram_pages += 1,
            }
            let expected = match page.kind {
                PageKind::Native => IdClass::Native,
                PageKind::Redirect => IdClass::Redirect,
                PageKind::Attachment => IdClass::Attachment,
                PageKind::Diagram => IdClass::Diagram,
            };
            if ids::classify(page.id) != Some(expected) {
                report.misplaced_ids.push(page.id);
            }
            if !titles.insert(page.formatted_title.as_str()) {
                report.duplicate_titles.push(page.formatted_title.clone());
            }
            if revisions.get(&page.id).is_none_or(BTreeMap::is_empty) {
                report.pages_without_revisions.push(page.id);
            }
        }

        for (page_id, versions) in revisions {
            if !pages.contains_key(page_id) {
                report.orphan_revision_pages.push(*page_id);
            }
            let mut previous = None;
            let mut broken = false;
            for (version, revision) in versions {
                report.revisions += 1;
                if revision.author_name.is_none() {
                    report.revisions_missing_author += 1;
                }
                if wikitext
                    .get(page_id)
                    .is_some_and(|converted| converted.contains_key(version))
                {
                    report.converted_revisions += 1;
                } else {
                    report.unconverted_revisions += 1;
                }
                broken |= revision.parent_rev_id != previous;
                previous = Some(revision.rev_id);
            }
            if broken {
                report.broken_chains.push(*page_id);
            }
        }
        report
    }

    /// Builds the report from whatever buckets exist in the workspace.
    pub fn from_workspace(workspace: &Path) -> Result<Self> {
        let store = DataBuckets::open(
            workspace,
            &[
                buckets::WIKI_PAGES,
                buckets::PAGE_REVISIONS,
                buckets::REVISION_WIKITEXT,
                buckets::UNRESOLVED_LINKS,
                buckets::MISSING_TITLES,
                buckets::MISSING_ATTACHMENTS,
                buckets::UNRESOLVED_REDIRECTS,
            ],
        )?;
        let pages: PageMap = store.get(buckets::WIKI_PAGES)?;
        let revisions: RevisionMap = store.get(buckets::PAGE_REVISIONS)?;
        let wikitext: WikitextMap = store.get(buckets::REVISION_WIKITEXT)?;
        let links: BTreeMap<u32, Vec<UnresolvedLink>> = store.get(buckets::UNRESOLVED_LINKS)?;
        let titles: BTreeMap<String, bool> = store.get(buckets::MISSING_TITLES)?;
        let attachments: BTreeMap<String, bool> = store.get(buckets::MISSING_ATTACHMENTS)?;
        let redirects: Vec<UnresolvedRedirect> = if store.is_empty(buckets::UNRESOLVED_REDIRECTS) {
            Vec::new()
        } else {
            store.get(buckets::UNRESOLVED_REDIRECTS)?
        };

        let mut report = Self::build(&pages, &revisions, &wikitext);
        report.unresolved_links = links.values().map(Vec::len).sum();
        report.missing_titles = titles.len();
        report.missing_attachments = attachments.len();
        report.unresolved_redirects = redirects.len();
        Ok(report)
    }

    /// Structural problems that make the dump unsafe to import.
    pub fn has_integrity_failures(&self) -> bool {
        !self.duplicate_titles.is_empty()
            || !self.broken_chains.is_empty()
            || !self.orphan_revision_pages.is_empty()
            || !self.misplaced_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ATTACHMENT_ID_OFFSET, REDIRECT_ID_CEILING};
    use crate::models::Revision;
    use crate::source::parse_timestamp;
    use tempfile::TempDir;

    fn page(id: u32, kind: PageKind, title: &str) -> Page {
        Page {
            id,
            kind,
            namespace: 0,
            wiki_id: Some(1),
            project_id: Some(1),
            project_name: None,
            project_identifier: None,
            title: title.to_string(),
            parent_id: None,
            content_id: None,
            version: 1,
            protected: false,
            categories: Vec::new(),
            formatted_title: title.to_string(),
            redirects_to: None,
        }
    }

    fn revision(page_id: u32, version: u32, rev_id: u32, parent: Option<u32>, author: Option<&str>) -> Revision {
        Revision {
            rev_id,
            page_id,
            version,
            author_id: Some(1),
            author_name: author.map(str::to_string),
            text: String::new(),
            comment: String::new(),
            timestamp: parse_timestamp("2024-01-01 00:00:00").unwrap(),
            parent_rev_id: parent,
        }
    }

    #[test]
    fn from_checkpoint_initializes_correctly() {
        let cp = CheckpointStats {
            pages_converted: 4,
            revisions_converted: 10,
            links_resolved: 30,
            links_unresolved: 2,
            converter_calls: 20,
            converter_failures: 1,
            converter_timeouts: 1,
            code_blocks: 5,
            macros_expanded: 6,
        };
        let stats = ConversionStats::from_checkpoint(&cp);
        assert_eq!(stats.pages(), 4);
        assert_eq!(stats.revisions(), 10);
        assert_eq!(stats.resolved(), 30);
        assert_eq!(stats.unresolved(), 2);
        assert_eq!(stats.converter_calls(), 20);
        assert_eq!(stats.converter_failures(), 1);
        assert_eq!(stats.converter_timeouts(), 1);
        assert_eq!(stats.code_blocks(), 5);
        assert_eq!(stats.macros(), 6);
    }

    #[test]
    fn checkpoint_roundtrip() {
        let original = ConversionStats::new();
        original.inc_pages();
        original.inc_revisions();
        original.inc_revisions();
        original.add_links(7, 1);
        original.inc_converter_calls();
        original.inc_converter_timeouts();
        original.add_code_blocks(3);

        let restored = ConversionStats::from_checkpoint(&original.to_checkpoint());
        assert_eq!(restored.pages(), 1);
        assert_eq!(restored.revisions(), 2);
        assert_eq!(restored.resolved(), 7);
        assert_eq!(restored.unresolved(), 1);
        assert_eq!(restored.converter_timeouts(), 1);
        assert_eq!(restored.code_blocks(), 3);
    }

    #[test]
    fn diagnostics_group_by_page() {
        let diagnostics = Diagnostics::default();
        let a = page(1, PageKind::Native, "A");
        let b = page(2, PageKind::Native, "B");
        diagnostics.record_unresolved_link(&b, 1, "X");
        diagnostics.record_unresolved_link(&a, 1, "Y");
        diagnostics.record_unresolved_link(&a, 1, "Z");
        diagnostics.record_missing_title("T");
        diagnostics.record_missing_title("T");

        let links = diagnostics.unresolved_links();
        assert_eq!(links.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(links[&1].len(), 2);
        assert_eq!(diagnostics.unresolved_count(), 3);
        assert_eq!(diagnostics.missing_titles().len(), 1);

        diagnostics.forget_page(1);
        assert_eq!(diagnostics.unresolved_count(), 1);
    }

    #[test]
    fn csv_lists_every_unresolved_link() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unresolved_links.csv");
        let diagnostics = Diagnostics::default();
        diagnostics.record_unresolved_link(&page(3, PageKind::Native, "Home_P"), 2, "Ghost");

        assert_eq!(diagnostics.write_csv(&path).unwrap(), 1);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "page_id,version,page_title,target\n3,2,Home_P,Ghost\n");
    }

    #[test]
    fn report_counts_and_flags() {
        let mut pages = PageMap::new();
        let redirect = REDIRECT_ID_CEILING;
        let attachment = ATTACHMENT_ID_OFFSET + 3;
        pages.insert(1, page(1, PageKind::Native, "A"));
        pages.insert(redirect, page(redirect, PageKind::Redirect, "B"));
        pages.insert(attachment, page(attachment, PageKind::Attachment, "File:c.png"));

        let mut revisions = RevisionMap::new();
        revisions
            .entry(1)
            .or_default()
            .insert(1, revision(1, 1, 10, None, Some("alice")));
        revisions
            .entry(1)
            .or_default()
            .insert(2, revision(1, 2, 11, Some(10), None));
        revisions
            .entry(redirect)
            .or_default()
            .insert(1, revision(redirect, 1, redirect, None, Some("bob")));

        let mut wikitext = WikitextMap::new();
        wikitext.entry(1).or_default().insert(1, "a".to_string());

        let report = IntegrityReport::build(&pages, &revisions, &wikitext);
        assert_eq!(report.native_pages, 1);
        assert_eq!(report.redirect_pages, 1);
        assert_eq!(report.attachment_pages, 1);
        assert_eq!(report.revisions, 3);
        assert_eq!(report.revisions_missing_author, 1);
        assert_eq!(report.pages_without_revisions, vec![attachment]);
        assert_eq!(report.converted_revisions, 1);
        assert_eq!(report.unconverted_revisions, 2);
        assert!(!report.has_integrity_failures());
    }

    #[test]
    fn report_detects_broken_chain_and_duplicates() {
        let mut pages = PageMap::new();
        pages.insert(1, page(1, PageKind::Native, "Same"));
        pages.insert(2, page(2, PageKind::Native, "Same"));
        let mut revisions = RevisionMap::new();
        revisions
            .entry(1)
            .or_default()
            .insert(2, revision(1, 2, 11, Some(99), Some("a")));

        let report = IntegrityReport::build(&pages, &revisions, &WikitextMap::new());
        assert_eq!(report.duplicate_titles, vec!["Same".to_string()]);
        assert_eq!(report.broken_chains, vec![1]);
        assert!(report.has_integrity_failures());
    }

    #[test]
    fn report_flags_ids_outside_their_range() {
        let mut pages = PageMap::new();
        pages.insert(5, page(5, PageKind::Attachment, "File:x.png"));
        let mut revisions = RevisionMap::new();
        revisions
            .entry(5)
            .or_default()
            .insert(1, revision(5, 1, 5, None, Some("a")));

        let report = IntegrityReport::build(&pages, &revisions, &WikitextMap::new());
        assert_eq!(report.misplaced_ids, vec![5]);
        assert!(report.has_integrity_failures());
    }
}
