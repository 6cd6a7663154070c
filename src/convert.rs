//! The convert stage: every revision body through the markup pipeline.
//!
//! A revision passes through [`PIPELINE`] strictly in order. Pages are
//! independent once the title space is frozen, so the driver converts up to
//! `max_parallel` pages at a time, each page's revisions in version order.

use crate::buckets::{self, DataBuckets, WriteMode};
use crate::checkpoint::{self, CheckpointManager, CheckpointStats};
use crate::config::{TIMEOUT_MARKER, UNRESOLVED_LINKS_CSV};
use crate::content::{self, Segment};
use crate::customize::Customizations;
use crate::external::{Conversion, Dialect, MarkupConverter};
use crate::index::TitleSpace;
use crate::links::LinkResolver;
use crate::models::{Page, Revision, RevisionMap, WikitextMap};
use crate::placeholder::ProtectedRegions;
use crate::stats::{ConversionStats, Diagnostics};
use anyhow::{bail, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Source HTML cleanup; `<pre>` regions set aside
    Preprocess,
    /// HTML -> Textile -> MediaWiki through the external converter
    ExternalConversion,
    /// `<pre>` regions back, converter escaping undone
    FixAfterConversion,
    /// Code regions set aside again, now as target code blocks
    IsolateCode,
    ExpandMacros,
    /// Images, anchors and HTML tables
    NormalizeMarkup,
    ResolveLinks,
    InjectCategories,
    RestoreRegions,
}

pub const PIPELINE: [Stage; 9] = [
    Stage::Preprocess,
    Stage::ExternalConversion,
    Stage::FixAfterConversion,
    Stage::IsolateCode,
    Stage::ExpandMacros,
    Stage::NormalizeMarkup,
    Stage::ResolveLinks,
    Stage::InjectCategories,
    Stage::RestoreRegions,
];

/// One revision body on its way through the pipeline.
struct RevisionJob<'a> {
    page: &'a Page,
    version: u32,
    text: String,
    pre: ProtectedRegions,
    code: ProtectedRegions,
}

pub struct Pipeline<C> {
    space: TitleSpace,
    custom: Customizations,
    converter: C,
    stats: ConversionStats,
    diagnostics: Diagnostics,
}

impl<C: MarkupConverter> Pipeline<C> {
    pub fn new(space: TitleSpace, custom: Customizations, converter: C) -> Self {
        Self {
            space,
            custom,
            converter,
            stats: ConversionStats::new(),
            diagnostics: Diagnostics::default(),
        }
    }

    /// Continues counting from an earlier, interrupted run.
    pub fn with_stats(mut self, stats: ConversionStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn space(&self) -> &TitleSpace {
        &self.space
    }

    pub fn stats(&self) -> &ConversionStats {
        &self.stats
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// One converter call; a failure passes the input through.
    async fn hop(&self, text: &str, from: Dialect, to: Dialect) -> Conversion {
        if text.trim().is_empty() {
            return Conversion::Converted(text.to_string());
        }
        self.stats.inc_converter_calls();
        let outcome = self.converter.convert(text, from, to).await;
        match outcome {
            Conversion::Failed => self.stats.inc_converter_failures(),
            Conversion::TimedOut => self.stats.inc_converter_timeouts(),
            Conversion::Converted(_) => {}
        }
        outcome
    }

    async fn convert_tables(&self, text: &str) -> String {
        let text = content::unwrap_table_figures(text);
        if !text.contains("<table") {
            return text;
        }
        let mut out = String::with_capacity(text.len());
        for segment in content::split_html_tables(&text) {
            match segment {
                Segment::Text(t) => out.push_str(&t),
                Segment::Table(html) => {
                    let table = self
                        .hop(&html, Dialect::Html, Dialect::MediaWiki)
                        .await
                        .into_text(&html);
                    out.push_str(&content::split_cell_lists(&table));
                }
            }
        }
        out
    }

    async fn run_stage(&self, stage: Stage, job: &mut RevisionJob<'_>, resolver: &LinkResolver<'_>) {
        let text = std::mem::take(&mut job.text);
        job.text = match stage {
            Stage::Preprocess => {
                let text = content::preprocess(&text, &self.custom);
                content::protect_pre_blocks(&text, &mut job.pre)
            }
            Stage::ExternalConversion => {
                match self.hop(&text, Dialect::Html, Dialect::Textile).await {
                    Conversion::TimedOut => {
                        warn!(page_id = job.page.id, version = job.version, "Revision needs manual review");
                        format!("{TIMEOUT_MARKER}\n{text}")
                    }
                    first => {
                        let textile = content::break_list_items(&first.into_text(&text));
                        self.hop(&textile, Dialect::Textile, Dialect::MediaWiki)
                            .await
                            .into_text(&textile)
                    }
                }
            }
            Stage::FixAfterConversion => {
                let text = job.pre.restore(&text);
                content::fix_after_conversion(&text)
            }
            Stage::IsolateCode => {
                let (text, blocks) = content::isolate_code(&text, &mut job.code);
                self.stats.add_code_blocks(blocks);
                text
            }
            Stage::ExpandMacros => {
                let text = content::replace_inline_titles(&text, "attachment:\"", "\"", |title| {
                    resolver.formatted_title_for(title)
                });
                let text = content::replace_inline_elements(&text);
                let (text, expanded) = content::expand_macros(
                    &text,
                    |id| self.space.diagram(id).map(|d| d.target_filename.clone()),
                    self.custom.domain(),
                );
                self.stats.add_macros(expanded);
                text
            }
            Stage::NormalizeMarkup => {
                let text = content::unwrap_image_figures(&text);
                let text = content::rewrite_images(&text, resolver);
                let text = content::rewrite_anchors(&text);
                self.convert_tables(&text).await
            }
            Stage::ResolveLinks => {
                let text = resolver.pre_handle_urls(&text);
                let (text, counts) = resolver.rewrite_links(&text, job.page, job.version);
                self.stats.add_links(counts.resolved, counts.unresolved);
                text
            }
            Stage::InjectCategories => content::append_categories(&text, &job.page.categories),
            Stage::RestoreRegions => {
                let text = job.code.restore(&text);
                job.pre.restore(&text)
            }
        };
    }

    async fn convert_with(&self, resolver: &LinkResolver<'_>, page: &Page, revision: &Revision) -> String {
        if revision.text.trim().is_empty() || revision.text.starts_with("#REDIRECT") {
            return revision.text.clone();
        }
        let mut job = RevisionJob {
            page,
            version: revision.version,
            text: revision.text.clone(),
            pre: ProtectedRegions::new("PRE"),
            code: ProtectedRegions::new("CODE"),
        };
        for stage in PIPELINE {
            self.run_stage(stage, &mut job, resolver).await;
        }
        job.text
    }

    /// Converts one revision body of `page`.
    ///
    /// Redirect bodies already point at final titles and are kept as written.
    pub async fn convert_revision(&self, page: &Page, revision: &Revision) -> String {
        let resolver = LinkResolver::new(&self.space, &self.custom, &self.diagnostics);
        self.convert_with(&resolver, page, revision).await
    }

    /// Converts every revision of one page, oldest first.
    pub async fn convert_page(&self, page_id: u32, revisions: &BTreeMap<u32, Revision>) -> Option<BTreeMap<u32, String>> {
        let Some(page) = self.space.page(page_id) else {
            warn!(page_id, "Revisions without a page, skipped");
            return None;
        };
        self.diagnostics.forget_page(page_id);
        let resolver = LinkResolver::new(&self.space, &self.custom, &self.diagnostics);

        let mut converted = BTreeMap::new();
        for (version, revision) in revisions {
            let text = self.convert_with(&resolver, page, revision).await;
            self.stats.inc_revisions();
            converted.insert(*version, text);
        }
        debug!(page_id, revisions = converted.len(), "Page converted");
        Some(converted)
    }
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub max_parallel: usize,
    pub resume: bool,
    pub checkpoint_interval: u32,
    pub show_progress: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            max_parallel: crate::config::DEFAULT_MAX_PARALLEL,
            resume: false,
            checkpoint_interval: crate::config::CHECKPOINT_INTERVAL,
            show_progress: false,
        }
    }
}

#[derive(Debug)]
pub struct ConvertSummary {
    pub pages: usize,
    pub resumed_pages: usize,
    pub stats: CheckpointStats,
    pub unresolved_links: usize,
    pub missing_titles: usize,
    pub missing_attachments: usize,
    pub csv_path: PathBuf,
}

fn make_progress_bar(total: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("    {spinner:.cyan} converting [{bar:30.cyan/blue}] {pos}/{len} pages {elapsed_precise}")
    {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

/// Converts every page in the workspace and writes the `revision-wikitext`
/// and diagnostics buckets plus the unresolved-links CSV.
pub async fn run<C: MarkupConverter>(
    workspace: &Path,
    converter: C,
    options: &ConvertOptions,
) -> Result<ConvertSummary> {
    let input = DataBuckets::open(
        workspace,
        &[
            buckets::WIKI_PAGES,
            buckets::PAGE_REVISIONS,
            buckets::DIAGRAM_CONTENTS,
            buckets::CUSTOMIZATIONS,
        ],
    )?;
    if input.is_empty(buckets::WIKI_PAGES) {
        bail!("No pages found in {:?}; run analyze first", workspace);
    }
    let space = TitleSpace::from_buckets(&input)?;
    let mut revisions: RevisionMap = input.get(buckets::PAGE_REVISIONS)?;
    let custom: Customizations = input.get(buckets::CUSTOMIZATIONS)?;
    drop(input);

    let checkpoint = if options.resume {
        checkpoint::load_if_valid(workspace)?
    } else {
        checkpoint::clear(workspace)?;
        None
    };
    let manager = CheckpointManager::new(workspace, options.checkpoint_interval)?;

    let (mut converted, stats, restored_links): (WikitextMap, _, _) = match checkpoint {
        Some(cp) => {
            info!(pages = cp.converted.len(), "Resuming from checkpoint");
            (cp.converted, ConversionStats::from_checkpoint(&cp.stats), cp.unresolved_links)
        }
        None => (WikitextMap::new(), ConversionStats::new(), BTreeMap::new()),
    };
    let resumed_pages = converted.len();

    let jobs: Vec<(u32, BTreeMap<u32, Revision>)> = space
        .pages()
        .map(|p| p.id)
        .filter(|id| !converted.contains_key(id))
        .filter_map(|id| revisions.remove(&id).map(|revs| (id, revs)))
        .collect();
    for orphan in revisions.keys().filter(|id| !converted.contains_key(*id)) {
        if space.page(*orphan).is_none() {
            warn!(page_id = *orphan, "Revisions without a page, skipped");
        }
    }

    let pipeline = Arc::new(Pipeline::new(space, custom, converter).with_stats(stats));
    pipeline.diagnostics().restore(restored_links);

    info!(pages = jobs.len(), max_parallel = options.max_parallel, "Starting conversion");
    let pb = make_progress_bar(jobs.len() as u64, options.show_progress);

    let spawn = |(page_id, revs): (u32, BTreeMap<u32, Revision>)| {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            let result = pipeline.convert_page(page_id, &revs).await;
            (page_id, result)
        })
    };

    let mut in_flight = FuturesUnordered::new();
    let mut job_iter = jobs.into_iter();
    for job in job_iter.by_ref().take(options.max_parallel.max(1)) {
        in_flight.push(spawn(job));
    }

    while let Some(join_result) = in_flight.next().await {
        let (page_id, result) = join_result.context("Task join error")?;
        if let Some(texts) = result {
            converted.insert(page_id, texts);
            pipeline.stats().inc_pages();
            if let Err(e) = manager.maybe_save(&converted, pipeline.stats(), pipeline.diagnostics()) {
                warn!(error = %e, "Failed to save checkpoint");
            }
        }
        pb.inc(1);

        if let Some(job) = job_iter.next() {
            in_flight.push(spawn(job));
        }
    }
    pb.finish_and_clear();

    let mut output = DataBuckets::open(
        workspace,
        &[
            buckets::REVISION_WIKITEXT,
            buckets::UNRESOLVED_LINKS,
            buckets::MISSING_TITLES,
            buckets::MISSING_ATTACHMENTS,
        ],
    )?;
    output.put(buckets::REVISION_WIKITEXT, &converted, WriteMode::Overwrite)?;
    let diagnostics = pipeline.diagnostics();
    diagnostics.write_buckets(&mut output)?;
    output.flush()?;

    let csv_path = workspace.join(UNRESOLVED_LINKS_CSV);
    diagnostics.write_csv(&csv_path)?;

    if let Err(e) = manager.clear() {
        warn!(error = %e, "Failed to clear checkpoint");
    }

    let summary = ConvertSummary {
        pages: converted.len(),
        resumed_pages,
        stats: pipeline.stats().to_checkpoint(),
        unresolved_links: diagnostics.unresolved_count(),
        missing_titles: diagnostics.missing_titles().len(),
        missing_attachments: diagnostics.missing_attachments().len(),
        csv_path,
    };
    info!(
        pages = summary.pages,
        revisions = summary.stats.revisions_converted,
        unresolved = summary.unresolved_links,
        "Conversion complete"
    );
    Ok(summary)
}
