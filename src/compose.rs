//! MediaWiki XML import dump composer.

use crate::buckets::{self, DataBuckets};
use crate::config::{PROGRESS_INTERVAL, UNKNOWN_AUTHOR};
use crate::models::{Page, PageMap, Revision, RevisionMap, WikitextMap};
use anyhow::{bail, Context, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

const EXPORT_NS: &str = "http://www.mediawiki.org/xml/export-0.11/";
const EXPORT_VERSION: &str = "0.11";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ComposeSummary {
    pub pages: usize,
    pub revisions: usize,
    /// Revisions written with their unconverted source body
    pub raw_fallbacks: usize,
}

/// `alice.SMITH` -> `Alice.smith`; no login -> the import placeholder.
pub fn contributor_name(login: Option<&str>) -> String {
    let Some(login) = login.filter(|l| !l.trim().is_empty()) else {
        return UNKNOWN_AUTHOR.to_string();
    };
    let lower = login.trim().to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => lower,
    }
}

struct DumpWriter<W: Write> {
    xml: Writer<W>,
}

impl<W: Write> DumpWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            xml: Writer::new_with_indent(inner, b' ', 2),
        }
    }

    fn open(&mut self, name: &str) -> Result<()> {
        self.xml.write_event(Event::Start(BytesStart::new(name)))?;
        Ok(())
    }

    fn close(&mut self, name: &str) -> Result<()> {
        self.xml.write_event(Event::End(BytesEnd::new(name)))?;
        Ok(())
    }

    fn element(&mut self, name: &str, value: &str) -> Result<()> {
        self.open(name)?;
        self.xml.write_event(Event::Text(BytesText::new(value)))?;
        self.close(name)
    }

    fn header(&mut self) -> Result<()> {
        self.xml
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        let mut root = BytesStart::new("mediawiki");
        root.push_attribute(("xmlns", EXPORT_NS));
        root.push_attribute(("version", EXPORT_VERSION));
        root.push_attribute(("xml:lang", "en"));
        self.xml.write_event(Event::Start(root))?;
        Ok(())
    }

    fn revision(&mut self, revision: &Revision, text: &str) -> Result<()> {
        let mut ibuf = itoa::Buffer::new();
        self.open("revision")?;
        self.element("id", ibuf.format(revision.rev_id))?;
        if let Some(parent) = revision.parent_rev_id {
            self.element("parentid", ibuf.format(parent))?;
        }
        self.element("timestamp", &revision.timestamp.format(TIMESTAMP_FORMAT).to_string())?;

        self.open("contributor")?;
        self.element("username", &contributor_name(revision.author_name.as_deref()))?;
        self.element("id", ibuf.format(revision.author_id.unwrap_or(0)))?;
        self.close("contributor")?;

        self.element("comment", &revision.comment)?;
        self.element("model", "wikitext")?;
        self.element("format", "text/x-wiki")?;

        let mut body = BytesStart::new("text");
        body.push_attribute(("xml:space", "preserve"));
        self.xml.write_event(Event::Start(body))?;
        self.xml.write_event(Event::Text(BytesText::new(text)))?;
        self.close("text")?;

        self.close("revision")
    }

    fn finish(mut self) -> Result<W> {
        self.close("mediawiki")?;
        let mut inner = self.xml.into_inner();
        inner.write_all(b"\n")?;
        Ok(inner)
    }
}

/// Writes the dump for `pages` in id order, revisions in version order.
pub fn write_dump<W: Write>(
    out: W,
    pages: &PageMap,
    revisions: &RevisionMap,
    wikitext: &WikitextMap,
) -> Result<(W, ComposeSummary)> {
    let mut dump = DumpWriter::new(out);
    let mut summary = ComposeSummary::default();
    dump.header()?;

    for page in pages.values() {
        let Some(page_revisions) = revisions.get(&page.id).filter(|r| !r.is_empty()) else {
            warn!(page_id = page.id, title = %page.formatted_title, "Page has no revisions, skipped");
            continue;
        };
        write_page(&mut dump, page, page_revisions, wikitext.get(&page.id), &mut summary)?;
        summary.pages += 1;
        if summary.pages % PROGRESS_INTERVAL as usize == 0 {
            info!(pages = summary.pages, "Composing");
        }
    }

    let out = dump.finish()?;
    Ok((out, summary))
}

fn write_page<W: Write>(
    dump: &mut DumpWriter<W>,
    page: &Page,
    revisions: &BTreeMap<u32, Revision>,
    converted: Option<&BTreeMap<u32, String>>,
    summary: &mut ComposeSummary,
) -> Result<()> {
    let mut ibuf = itoa::Buffer::new();
    dump.open("page")?;
    dump.element("title", &page.formatted_title)?;
    dump.element("ns", ibuf.format(page.namespace))?;
    dump.element("id", ibuf.format(page.id))?;

    for (version, revision) in revisions {
        let text = match converted.and_then(|c| c.get(version)) {
            Some(text) => text.as_str(),
            None => {
                warn!(page_id = page.id, version = *version, "No converted text, using source body");
                summary.raw_fallbacks += 1;
                revision.text.as_str()
            }
        };
        dump.revision(revision, text)?;
        summary.revisions += 1;
    }
    dump.close("page")
}

pub fn run(workspace: &Path, output: &Path) -> Result<ComposeSummary> {
    let store = DataBuckets::open(
        workspace,
        &[buckets::WIKI_PAGES, buckets::PAGE_REVISIONS, buckets::REVISION_WIKITEXT],
    )?;
    if store.is_empty(buckets::WIKI_PAGES) {
        bail!("No pages found in {:?}; run analyze first", workspace);
    }
    let pages: PageMap = store.get(buckets::WIKI_PAGES)?;
    let revisions: RevisionMap = store.get(buckets::PAGE_REVISIONS)?;
    let wikitext: WikitextMap = store.get(buckets::REVISION_WIKITEXT)?;
    if wikitext.is_empty() {
        warn!("No converted wikitext found; every revision keeps its source body");
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let tmp = output.with_extension("xml.tmp");
    let file = File::create(&tmp).with_context(|| format!("Failed to create dump: {:?}", tmp))?;
    let (writer, summary) = write_dump(BufWriter::new(file), &pages, &revisions, &wikitext)?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("Failed to flush dump: {:?}", tmp))?
        .sync_all()?;
    fs::rename(&tmp, output).with_context(|| format!("Failed to move dump into place: {:?}", output))?;

    info!(
        path = ?output,
        pages = summary.pages,
        revisions = summary.revisions,
        raw_fallbacks = summary.raw_fallbacks,
        "Dump written"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageKind;
    use crate::source::parse_timestamp;

    fn page(id: u32, title: &str) -> Page {
        Page {
            id,
            kind: PageKind::Native,
            namespace: 0,
            wiki_id: Some(1),
            project_id: Some(10),
            project_name: None,
            project_identifier: Some("P".to_string()),
            title: title.to_string(),
            parent_id: None,
            content_id: None,
            version: 2,
            protected: false,
            categories: Vec::new(),
            formatted_title: format!("{title}_P"),
            redirects_to: None,
        }
    }

    fn revision(page_id: u32, version: u32, parent: Option<u32>, author: Option<&str>) -> Revision {
        Revision {
            rev_id: page_id * 10 + version,
            page_id,
            version,
            author_id: author.map(|_| 7),
            author_name: author.map(str::to_string),
            text: format!("raw {version}"),
            comment: format!("edit {version}"),
            timestamp: parse_timestamp("2024-03-05 14:07:09").unwrap(),
            parent_rev_id: parent,
        }
    }

    fn compose(pages: &PageMap, revisions: &RevisionMap, wikitext: &WikitextMap) -> (String, ComposeSummary) {
        let (out, summary) = write_dump(Vec::new(), pages, revisions, wikitext).unwrap();
        (String::from_utf8(out).unwrap(), summary)
    }

    #[test]
    fn contributor_names() {
        assert_eq!(contributor_name(Some("aLICE")), "Alice");
        assert_eq!(contributor_name(Some("émile")), "Émile");
        assert_eq!(contributor_name(None), UNKNOWN_AUTHOR);
        assert_eq!(contributor_name(Some("  ")), UNKNOWN_AUTHOR);
    }

    #[test]
    fn revisions_in_version_order_without_first_parent() {
        let pages: PageMap = BTreeMap::from([(1, page(1, "Home"))]);
        let revisions: RevisionMap = BTreeMap::from([(
            1,
            BTreeMap::from([
                (2, revision(1, 2, Some(11), Some("BOB"))),
                (1, revision(1, 1, None, None)),
            ]),
        )]);
        let wikitext: WikitextMap = BTreeMap::from([(
            1,
            BTreeMap::from([(1, "first <b>".to_string()), (2, "second & more".to_string())]),
        )]);

        let (xml, summary) = compose(&pages, &revisions, &wikitext);
        assert_eq!(summary, ComposeSummary { pages: 1, revisions: 2, raw_fallbacks: 0 });

        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<title>Home_P</title>"));
        assert!(xml.contains("<ns>0</ns>"));
        assert!(xml.contains("<timestamp>2024-03-05T14:07:09Z</timestamp>"));
        assert!(xml.contains("<username>Bob</username>"));
        assert!(xml.contains(&format!("<username>{UNKNOWN_AUTHOR}</username>")));
        assert!(xml.contains("first &lt;b&gt;"));
        assert!(xml.contains("second &amp; more"));
        assert_eq!(xml.matches("<parentid>").count(), 1);
        assert!(xml.contains("<parentid>11</parentid>"));

        let first = xml.find("<id>11</id>").unwrap();
        let second = xml.find("<id>12</id>").unwrap();
        assert!(first < second);
        assert!(xml.trim_end().ends_with("</mediawiki>"));
    }

    #[test]
    fn missing_wikitext_falls_back_to_source() {
        let pages: PageMap = BTreeMap::from([(1, page(1, "Home")), (2, page(2, "Empty"))]);
        let revisions: RevisionMap = BTreeMap::from([(1, BTreeMap::from([(1, revision(1, 1, None, Some("a")))]))]);

        let (xml, summary) = compose(&pages, &revisions, &WikitextMap::new());
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.raw_fallbacks, 1);
        assert!(xml.contains("raw 1"));
        assert!(!xml.contains("Empty_P"));
    }
}
