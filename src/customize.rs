//! Per-migration overrides supplied as a JSON document.

use crate::models::{PageMap, RevisionMap};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageModification {
    /// New formatted title
    Rename(String),
    /// `false` drops the page, `true` leaves it alone
    Keep(bool),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Customizations {
    pub unwanted_projects: Vec<u32>,
    pub categories_to_add: BTreeMap<String, Vec<String>>,
    pub pages_to_modify: BTreeMap<String, PageModification>,
    pub current_revision_only: bool,
    pub redmine_domain: Option<String>,
    /// Literal substitutions, applied in document order
    #[serde(with = "ordered_pairs")]
    pub customized_replace: Vec<(String, String)>,
    pub title_cheatsheet: BTreeMap<String, String>,
    pub story_titles: BTreeMap<String, String>,
}

/// A JSON object read into `(key, value)` pairs without losing entry order.
mod ordered_pairs {
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(pairs: &[(String, String)], serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(pairs.len()))?;
        for (key, value) in pairs {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<(String, String)>, D::Error> {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of string replacements")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    pairs.push((key, value));
                }
                Ok(pairs)
            }
        }

        deserializer.deserialize_map(PairsVisitor)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ModifyReport {
    pub removed: usize,
    pub renamed: usize,
    pub categorized: usize,
}

impl Customizations {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read customizations: {}", path.display()))?;
        let parsed: Customizations = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse customizations: {}", path.display()))?;
        info!(path = %path.display(), "Customizations loaded");
        Ok(parsed)
    }

    pub fn is_unwanted(&self, project_id: u32) -> bool {
        self.unwanted_projects.contains(&project_id)
    }

    /// Source host without scheme or trailing slash.
    pub fn domain(&self) -> Option<&str> {
        let raw = self.redmine_domain.as_deref()?.trim();
        let raw = raw
            .strip_prefix("https://")
            .or_else(|| raw.strip_prefix("http://"))
            .unwrap_or(raw)
            .trim_end_matches('/');
        (!raw.is_empty()).then_some(raw)
    }

    pub fn replace_customized(&self, content: &str) -> String {
        let mut out = content.to_string();
        for (old, new) in &self.customized_replace {
            if !old.is_empty() && out.contains(old.as_str()) {
                out = out.replace(old.as_str(), new);
            }
        }
        out
    }

    /// Applies `pages-to-modify` and `categories-to-add`, keyed by formatted title
    /// first and raw title second.
    pub fn apply_page_rules(&self, pages: &mut PageMap, revisions: &mut RevisionMap) -> ModifyReport {
        let mut report = ModifyReport::default();
        let mut dropped = Vec::new();

        for page in pages.values_mut() {
            let rule = self
                .pages_to_modify
                .get(&page.formatted_title)
                .or_else(|| self.pages_to_modify.get(&page.title));
            match rule {
                Some(PageModification::Keep(false)) => {
                    dropped.push(page.id);
                    continue;
                }
                Some(PageModification::Rename(new_title)) => {
                    info!(from = %page.formatted_title, to = %new_title, "Renaming page");
                    page.formatted_title = new_title.clone();
                    report.renamed += 1;
                }
                _ => {}
            }

            let categories = self
                .categories_to_add
                .get(&page.formatted_title)
                .or_else(|| self.categories_to_add.get(&page.title));
            if let Some(categories) = categories {
                for category in categories {
                    if !page.categories.contains(category) {
                        page.categories.push(category.clone());
                    }
                }
                report.categorized += 1;
            }
        }

        for id in dropped {
            pages.remove(&id);
            revisions.remove(&id);
            report.removed += 1;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Page, PageKind};
    use std::collections::BTreeMap;

    fn page(id: u32, title: &str, formatted: &str) -> Page {
        Page {
            id,
            kind: PageKind::Native,
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
            formatted_title: formatted.to_string(),
            redirects_to: None,
        }
    }

    #[test]
    fn parses_kebab_case_document() {
        let parsed: Customizations = serde_json::from_str(
            r#"{
                "unwanted-projects": [3],
                "pages-to-modify": {"Old": "New", "Gone": false, "Same": true},
                "current-revision-only": true,
                "redmine-domain": "https://redmine.example.com/"
            }"#,
        )
        .unwrap();
        assert!(parsed.is_unwanted(3));
        assert!(parsed.current_revision_only);
        assert_eq!(parsed.domain(), Some("redmine.example.com"));
        assert_eq!(
            parsed.pages_to_modify.get("Gone"),
            Some(&PageModification::Keep(false))
        );
        assert_eq!(
            parsed.pages_to_modify.get("Old"),
            Some(&PageModification::Rename("New".to_string()))
        );
    }

    #[test]
    fn domain_absent_or_blank() {
        let mut custom = Customizations::default();
        assert_eq!(custom.domain(), None);
        custom.redmine_domain = Some("  ".to_string());
        assert_eq!(custom.domain(), None);
    }

    #[test]
    fn replace_customized_applies_all_pairs() {
        let mut custom = Customizations::default();
        custom.customized_replace = vec![
            ("foo".to_string(), "bar".to_string()),
            ("{{old}}".to_string(), String::new()),
        ];
        assert_eq!(custom.replace_customized("foo {{old}} foo"), "bar  bar");
    }

    #[test]
    fn replacements_chain_in_document_order() {
        let custom: Customizations =
            serde_json::from_str(r#"{"customized-replace": {"zz": "aa", "aa": "bb"}}"#).unwrap();
        assert_eq!(custom.replace_customized("zz"), "bb");

        let reversed: Customizations =
            serde_json::from_str(r#"{"customized-replace": {"aa": "bb", "zz": "aa"}}"#).unwrap();
        assert_eq!(reversed.replace_customized("zz"), "aa");

        let written = serde_json::to_string(&custom).unwrap();
        let reread: Customizations = serde_json::from_str(&written).unwrap();
        assert_eq!(reread.customized_replace, custom.customized_replace);
    }

    #[test]
    fn page_rules_drop_rename_and_categorize() {
        let mut pages = PageMap::new();
        pages.insert(1, page(1, "A", "A_P"));
        pages.insert(2, page(2, "B", "A_P/B"));
        pages.insert(3, page(3, "C", "A_P/C"));
        let mut revisions = RevisionMap::new();
        revisions.insert(2, BTreeMap::new());

        let mut custom = Customizations::default();
        custom
            .pages_to_modify
            .insert("A_P/B".to_string(), PageModification::Keep(false));
        custom
            .pages_to_modify
            .insert("C".to_string(), PageModification::Rename("Renamed".to_string()));
        custom
            .categories_to_add
            .insert("A_P".to_string(), vec!["Imported".to_string()]);

        let report = custom.apply_page_rules(&mut pages, &mut revisions);
        assert_eq!(
            report,
            ModifyReport {
                removed: 1,
                renamed: 1,
                categorized: 1
            }
        );
        assert!(!pages.contains_key(&2));
        assert!(!revisions.contains_key(&2));
        assert_eq!(pages[&3].formatted_title, "Renamed");
        assert_eq!(pages[&3].title, "C");
        assert_eq!(pages[&1].categories, vec!["Imported"]);
    }
}
