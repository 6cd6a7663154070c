//! Hierarchical title building.

use crate::config::PARENT_CHAIN_MAX_DEPTH;
use crate::error::IntegrityError;
use crate::models::{Page, PageMap};
use anyhow::Result;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

pub const SEGMENT_SEPARATOR: char = '/';
pub const JOINER: char = '_';

/// Collapses every whitespace run (NBSP included) into a single `_` and trims
/// the ends.
pub fn normalize_whitespace(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_joiner = false;
    for c in raw.chars() {
        if c.is_whitespace() || c == JOINER {
            pending_joiner = !out.is_empty();
            continue;
        }
        if pending_joiner {
            out.push(JOINER);
            pending_joiner = false;
        }
        out.push(c);
    }
    out
}

/// Root pages are disambiguated by project: `<title>_<identifier>`, falling
/// back to the numeric project id.
pub fn root_segment(page: &Page) -> String {
    let project = match (&page.project_identifier, page.project_id) {
        (Some(identifier), _) if !identifier.is_empty() => identifier.clone(),
        (_, Some(id)) => id.to_string(),
        _ => return page.title.clone(),
    };
    format!("{}{}{}", page.title, JOINER, project)
}

/// Walks from `page_id` to its root and joins the segments root first.
pub fn build_title(page_id: u32, pages: &PageMap) -> Result<String, IntegrityError> {
    let mut segments: Vec<String> = Vec::new();
    let mut visited = FxHashSet::default();
    let mut current = page_id;

    loop {
        if !visited.insert(current) || visited.len() > PARENT_CHAIN_MAX_DEPTH {
            return Err(IntegrityError::CyclicParent { page_id });
        }
        let page = pages.get(&current).ok_or(IntegrityError::MissingParent {
            page_id,
            parent_id: current,
        })?;
        match page.parent_id {
            None => {
                segments.push(normalize_whitespace(&root_segment(page)));
                break;
            }
            Some(parent) => {
                segments.push(normalize_whitespace(&page.title));
                current = parent;
            }
        }
    }

    segments.reverse();
    let separator = SEGMENT_SEPARATOR.to_string();
    Ok(segments.join(&separator))
}

/// Computes every page's formatted title from the frozen parent map.
pub fn assign_titles(pages: &mut PageMap) -> Result<()> {
    let built: Vec<(u32, String)> = pages
        .par_iter()
        .map(|(id, _)| build_title(*id, pages).map(|title| (*id, title)))
        .collect::<Result<_, IntegrityError>>()?;

    for (id, title) in built {
        if let Some(page) = pages.get_mut(&id) {
            page.formatted_title = title;
        }
    }
    Ok(())
}

pub fn check_unique_titles(pages: &PageMap) -> Result<(), IntegrityError> {
    let mut seen: FxHashMap<&str, u32> = FxHashMap::default();
    for page in pages.values() {
        if let Some(first) = seen.insert(page.formatted_title.as_str(), page.id) {
            return Err(IntegrityError::DuplicateTitle {
                title: page.formatted_title.clone(),
                first,
                second: page.id,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageKind;

    fn page(id: u32, title: &str, parent_id: Option<u32>) -> Page {
        Page {
            id,
            kind: PageKind::Native,
            namespace: 0,
            wiki_id: Some(1),
            project_id: Some(9),
            project_name: Some("Project".to_string()),
            project_identifier: Some("P".to_string()),
            title: title.to_string(),
            parent_id,
            content_id: None,
            version: 1,
            protected: false,
            categories: Vec::new(),
            formatted_title: String::new(),
            redirects_to: None,
        }
    }

    fn map(pages: Vec<Page>) -> PageMap {
        pages.into_iter().map(|p| (p.id, p)).collect()
    }

    #[test]
    fn whitespace_collapses_to_joiner() {
        assert_eq!(normalize_whitespace("Release  notes"), "Release_notes");
        assert_eq!(normalize_whitespace("A\u{a0}B\tC"), "A_B_C");
        assert_eq!(normalize_whitespace(" padded "), "padded");
        assert_eq!(normalize_whitespace("a _ b"), "a_b");
    }

    #[test]
    fn root_page_yields_root_segment() {
        let pages = map(vec![page(1, "A", None)]);
        assert_eq!(build_title(1, &pages).unwrap(), "A_P");
    }

    #[test]
    fn child_title_is_root_first() {
        let pages = map(vec![
            page(1, "A", None),
            page(2, "B", Some(1)),
            page(3, "Deep page", Some(2)),
        ]);
        assert_eq!(build_title(2, &pages).unwrap(), "A_P/B");
        assert_eq!(build_title(3, &pages).unwrap(), "A_P/B/Deep_page");
    }

    #[test]
    fn root_falls_back_to_project_id() {
        let mut root = page(1, "Home", None);
        root.project_identifier = None;
        let pages = map(vec![root]);
        assert_eq!(build_title(1, &pages).unwrap(), "Home_9");
    }

    #[test]
    fn cycle_is_rejected() {
        let pages = map(vec![page(1, "A", Some(2)), page(2, "B", Some(1))]);
        assert_eq!(
            build_title(1, &pages),
            Err(IntegrityError::CyclicParent { page_id: 1 })
        );
    }

    #[test]
    fn self_parent_is_a_cycle() {
        let pages = map(vec![page(1, "A", Some(1))]);
        assert!(matches!(
            build_title(1, &pages),
            Err(IntegrityError::CyclicParent { .. })
        ));
    }

    #[test]
    fn missing_parent_is_reported() {
        let pages = map(vec![page(2, "B", Some(7))]);
        assert_eq!(
            build_title(2, &pages),
            Err(IntegrityError::MissingParent {
                page_id: 2,
                parent_id: 7
            })
        );
    }

    #[test]
    fn assign_titles_fills_every_page() {
        let mut pages = map(vec![page(1, "A", None), page(2, "B", Some(1))]);
        assign_titles(&mut pages).unwrap();
        assert_eq!(pages[&1].formatted_title, "A_P");
        assert_eq!(pages[&2].formatted_title, "A_P/B");
        assert!(check_unique_titles(&pages).is_ok());
    }

    #[test]
    fn assign_titles_surfaces_cycle_as_integrity_error() {
        let mut pages = map(vec![page(1, "A", Some(2)), page(2, "B", Some(1))]);
        let err = assign_titles(&mut pages).unwrap_err();
        assert!(err.downcast_ref::<IntegrityError>().is_some());
    }

    #[test]
    fn duplicate_titles_detected() {
        let mut a = page(1, "A", None);
        let mut b = page(2, "A", None);
        a.formatted_title = "Same".to_string();
        b.formatted_title = "Same".to_string();
        let pages = map(vec![a, b]);
        assert_eq!(
            check_unique_titles(&pages),
            Err(IntegrityError::DuplicateTitle {
                title: "Same".to_string(),
                first: 1,
                second: 2
            })
        );
    }
}
