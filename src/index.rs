use crate::attachment::DiagramMap;
use crate::buckets::{self, DataBuckets};
use crate::ids;
use crate::links::loose_key;
use crate::models::{DiagramContent, Page, PageMap};
use anyhow::Result;
use rustc_hash::FxHashMap;
use tracing::info;

/// The frozen set of every migrated page's final title.
///
/// Built once after analysis and shared read-only by every conversion task.
/// Lookups that can match several pages return the lowest page id.
pub struct TitleSpace {
    pages: PageMap,
    by_formatted: FxHashMap<String, u32>,
    by_raw: FxHashMap<String, u32>,
    /// loose key -> page ids, ascending
    by_loose: FxHashMap<String, Vec<u32>>,
    diagrams: DiagramMap,
}

impl TitleSpace {
    pub fn new(pages: PageMap, diagrams: DiagramMap) -> Self {
        let mut by_formatted = FxHashMap::default();
        let mut by_raw = FxHashMap::default();
        let mut by_loose: FxHashMap<String, Vec<u32>> = FxHashMap::default();

        for page in pages.values() {
            by_formatted
                .entry(page.formatted_title.clone())
                .or_insert(page.id);
            by_raw.entry(page.title.clone()).or_insert(page.id);
            by_loose.entry(loose_key(&page.title)).or_default().push(page.id);
        }

        Self {
            pages,
            by_formatted,
            by_raw,
            by_loose,
            diagrams,
        }
    }

    pub fn from_buckets(store: &DataBuckets) -> Result<Self> {
        let pages: PageMap = store.get(buckets::WIKI_PAGES)?;
        let diagrams: DiagramMap = store.get(buckets::DIAGRAM_CONTENTS)?;
        let space = Self::new(pages, diagrams);
        info!(
            pages = space.len(),
            diagrams = space.diagrams.len(),
            "Title space built"
        );
        Ok(space)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, id: u32) -> Option<&Page> {
        self.pages.get(&id)
    }

    /// Pages in ascending id order
    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    pub fn by_formatted_title(&self, title: &str) -> Option<&Page> {
        self.by_formatted.get(title).and_then(|id| self.pages.get(id))
    }

    pub fn by_raw_title(&self, title: &str) -> Option<&Page> {
        self.by_raw.get(title).and_then(|id| self.pages.get(id))
    }

    /// Pages whose raw title is loosely equivalent to `title`, ascending by id.
    pub fn loosely_matching<'a>(&'a self, title: &str) -> impl Iterator<Item = &'a Page> + 'a {
        self.by_loose
            .get(&loose_key(title))
            .into_iter()
            .flatten()
            .filter_map(|id| self.pages.get(id))
    }

    /// Formatted title of the file page for a source attachment id.
    pub fn attachment_title(&self, attachment_id: u32) -> Option<&str> {
        let id = ids::attachment_page_id(attachment_id).ok()?;
        self.pages.get(&id).map(|p| p.formatted_title.as_str())
    }

    pub fn diagram(&self, id: u32) -> Option<&DiagramContent> {
        self.diagrams.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ATTACHMENT_ID_OFFSET;
    use crate::models::PageKind;

    fn page(id: u32, title: &str, formatted: &str) -> Page {
        Page {
            id,
            kind: PageKind::Native,
            namespace: 0,
            wiki_id: Some(1),
            project_id: Some(10),
            project_name: None,
            project_identifier: None,
            title: title.to_string(),
            parent_id: None,
            content_id: None,
            version: 1,
            protected: false,
            categories: Vec::new(),
            formatted_title: formatted.to_string(),
            redirects_to: None,
        }
    }

    fn space(pages: Vec<Page>) -> TitleSpace {
        TitleSpace::new(pages.into_iter().map(|p| (p.id, p)).collect(), DiagramMap::new())
    }

    #[test]
    fn exact_lookups() {
        let space = space(vec![page(1, "Home", "Home_P"), page(2, "Setup", "Home_P/Setup")]);
        assert_eq!(space.by_formatted_title("Home_P/Setup").map(|p| p.id), Some(2));
        assert_eq!(space.by_raw_title("Home").map(|p| p.id), Some(1));
        assert!(space.by_formatted_title("home_p").is_none());
    }

    #[test]
    fn raw_title_prefers_lowest_id() {
        let space = space(vec![page(9, "Home", "Home_Q"), page(3, "Home", "Home_P")]);
        assert_eq!(space.by_raw_title("Home").map(|p| p.id), Some(3));
    }

    #[test]
    fn loose_matches_in_id_order() {
        let space = space(vec![
            page(5, "What's new?", "A"),
            page(2, "whats new", "B"),
            page(7, "Other", "C"),
        ]);
        let ids: Vec<u32> = space.loosely_matching("What\u{2019}s_New").map(|p| p.id).collect();
        assert_eq!(ids, vec![5]);
    }

    #[test]
    fn attachment_title_uses_file_page() {
        let mut file = page(ATTACHMENT_ID_OFFSET + 4, "logo.png", "File:logo.png");
        file.kind = PageKind::Attachment;
        let space = space(vec![file]);
        assert_eq!(space.attachment_title(4), Some("File:logo.png"));
        assert_eq!(space.attachment_title(5), None);
    }
}
