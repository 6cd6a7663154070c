//! Link resolution against the frozen title space.
//!
//! A `[[target|text]]` token is matched in four steps, first hit wins:
//!
//! 1. exact formatted title (`target`, `ns:title`, or the bare title)
//! 2. explicit non-file namespace naming a project + loose raw title
//! 3. no namespace (or `File:`) + same wiki + loose raw title
//! 4. loose raw title anywhere
//!
//! Tokens that still do not resolve are left exactly as written.

use crate::config::{CATEGORY_NAMESPACE, FILE_NAMESPACE, STORY_NAMESPACE, USER_NAMESPACE};
use crate::customize::Customizations;
use crate::index::TitleSpace;
use crate::models::Page;
use crate::stats::Diagnostics;
use once_cell::sync::Lazy;
use percent_encoding::percent_decode_str;
use regex::{Captures, Regex};

static LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\]|]+)(?:\|([^\]]+))?\]\]").unwrap());

static DOUBLE_BRACKET_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([^\]]*://[^\]]*)\]\]").unwrap());

static FILE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[File:(https?://[^\]\s]+)(?:\s+([^\]]+))?\]").unwrap());

static BRACKETED_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[https?://([^\]\s]+)(?:\s+([^\]]+))?\]").unwrap());

static RAW_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)https?://([^\s<>"'\]\[]+)"#).unwrap());

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".gif"];

/// Comparison key for loose title equivalence: whitespace becomes `_`,
/// `. , / ? ¶` are dropped, curly single quotes become `'`, then lowercase.
pub fn loose_key(title: &str) -> String {
    let mut key = String::with_capacity(title.len());
    for c in title.chars() {
        match c {
            '.' | ',' | '/' | '?' | '¶' => {}
            '\u{2018}' | '\u{2019}' => key.push('\''),
            c if c.is_whitespace() => key.push('_'),
            c => key.extend(c.to_lowercase()),
        }
    }
    key
}

pub fn is_same_title(a: &str, b: &str) -> bool {
    a == b || loose_key(a) == loose_key(b)
}

pub fn url_decode(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// A parsed `[[...]]` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkToken {
    /// Decoded target with spaces turned into `_`
    pub target: String,
    pub text: Option<String>,
    pub namespace: Option<String>,
    pub title: String,
    pub fragment: Option<String>,
}

impl LinkToken {
    pub fn parse(raw_target: &str, raw_text: Option<&str>) -> Self {
        let target = url_decode(raw_target).replace(' ', "_");
        let text = raw_text.map(|t| url_decode(t).trim().to_string());

        let (namespace, rest) = match target.split_once(':') {
            Some((ns, rest)) if !ns.is_empty() && !rest.is_empty() => {
                (Some(ns.to_string()), rest.trim().to_string())
            }
            _ => (None, target.clone()),
        };

        let (title, fragment) = match rest.char_indices().find(|(i, c)| *c == '#' && *i > 0) {
            Some((i, _)) if i + 1 < rest.len() => (
                rest[..i].trim().to_string(),
                Some(rest[i + 1..].to_string()),
            ),
            _ => (rest.trim().to_string(), None),
        };

        Self {
            target,
            text,
            namespace,
            title,
            fragment,
        }
    }

    fn namespace_is(&self, name: &str) -> bool {
        self.namespace.as_deref() == Some(name)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkCounts {
    pub resolved: u64,
    pub unresolved: u64,
}

pub struct LinkResolver<'a> {
    space: &'a TitleSpace,
    custom: &'a Customizations,
    diagnostics: &'a Diagnostics,
    domain: Option<&'a str>,
    attachment_url: Option<Regex>,
    project_url: Option<Regex>,
    story_url: Option<Regex>,
}

impl<'a> LinkResolver<'a> {
    pub fn new(space: &'a TitleSpace, custom: &'a Customizations, diagnostics: &'a Diagnostics) -> Self {
        let domain = custom.domain();
        let compile = |pattern: String| Regex::new(&pattern).ok();
        let escaped = domain.map(regex::escape);
        Self {
            space,
            custom,
            diagnostics,
            domain,
            attachment_url: escaped.as_ref().and_then(|d| {
                compile(format!(
                    r"(?i)https?://{d}/attachments/(?:(?:download|thumbnail)/)?(\d+)(?:/[^?#\s]*)?(?:\?[^#\s]*)?(?:#\S*)?"
                ))
            }),
            project_url: escaped
                .as_ref()
                .and_then(|d| compile(format!(r"(?i){d}/projects/([^?\s]+)"))),
            story_url: escaped
                .as_ref()
                .and_then(|d| compile(format!(r"(?i){d}/easy_knowledge_stories/(\d+)"))),
        }
    }

    pub fn space(&self) -> &TitleSpace {
        self.space
    }

    /// Finds the formatted title a token points at.
    pub fn resolve(&self, token: &LinkToken, current: &Page) -> Option<String> {
        let space = self.space;
        let is_file = token.namespace_is(FILE_NAMESPACE);

        let mut exact: Vec<&str> = vec![token.target.as_str()];
        let qualified = token.namespace.as_ref().map(|ns| format!("{ns}:{}", token.title));
        if let Some(q) = &qualified {
            exact.push(q);
        }
        if token.namespace.is_none() || is_file {
            exact.push(&token.title);
        }
        if let Some(page) = exact
            .iter()
            .filter_map(|t| space.by_formatted_title(t))
            .min_by_key(|p| p.id)
        {
            return Some(page.formatted_title.clone());
        }

        match token.namespace.as_deref() {
            Some(ns) if !is_file => {
                if let Some(page) = space
                    .loosely_matching(&token.title)
                    .find(|p| project_matches(p, ns))
                {
                    return Some(page.formatted_title.clone());
                }
            }
            _ => {
                if let Some(page) = space
                    .loosely_matching(&token.title)
                    .find(|p| p.wiki_id.is_some() && p.wiki_id == current.wiki_id)
                {
                    return Some(page.formatted_title.clone());
                }
            }
        }

        let by_target = space.loosely_matching(&token.target).next();
        let by_title = space.loosely_matching(&token.title).next();
        by_target
            .into_iter()
            .chain(by_title)
            .min_by_key(|p| p.id)
            .map(|p| p.formatted_title.clone())
    }

    /// Rewrites every `[[...]]` token in `content`.
    ///
    /// Misses are recorded only for the page's latest version.
    pub fn rewrite_links(&self, content: &str, current: &Page, version: u32) -> (String, LinkCounts) {
        let mut counts = LinkCounts::default();
        let rewritten = LINK.replace_all(content, |caps: &Captures| {
            let whole = &caps[0];
            let token = LinkToken::parse(&caps[1], caps.get(2).map(|m| m.as_str()));

            if token.namespace_is(CATEGORY_NAMESPACE) || token.namespace_is(USER_NAMESPACE) {
                return whole.to_string();
            }
            if token.namespace_is(STORY_NAMESPACE) {
                if let Some(story) = self.custom.story_titles.get(&token.title) {
                    counts.resolved += 1;
                    return format!("[[{story}]]");
                }
            }
            if token.target.starts_with('#') {
                return url_decode(whole);
            }

            let Some(mut target) = self.resolve(&token, current) else {
                counts.unresolved += 1;
                if version == current.version {
                    self.diagnostics
                        .record_unresolved_link(current, version, &token.target);
                }
                return whole.to_string();
            };
            counts.resolved += 1;

            if let Some(fragment) = &token.fragment {
                target.push('#');
                target.push_str(fragment);
            }

            let text = match &token.text {
                Some(text) if text.starts_with("class=image") || text.starts_with("class=ckeditor") => {
                    None
                }
                Some(text) => Some(text.clone()),
                None if token.namespace_is(FILE_NAMESPACE) => None,
                None => Some(url_decode(&caps[1]).trim().to_string()),
            };
            match text {
                Some(text) if text != target && text.replace(' ', "_") != target => {
                    format!("[[{target}|{text}]]")
                }
                _ => format!("[[{target}]]"),
            }
        });
        (rewritten.into_owned(), counts)
    }

    /// Title lookup for `attachment:"..."` references and local image sources.
    ///
    /// Exact raw title, then an image base-name prefix, then the title
    /// cheatsheet. Anything else is recorded as missing and returned as-is.
    pub fn formatted_title_for(&self, title: &str) -> String {
        if let Some(page) = self.space.by_raw_title(title) {
            return page.formatted_title.clone();
        }
        let base = IMAGE_EXTENSIONS
            .iter()
            .find_map(|ext| title.strip_suffix(ext))
            .filter(|base| !base.is_empty());
        if let Some(base) = base {
            if let Some(page) = self.space.pages().find(|p| p.title.starts_with(base)) {
                return page.formatted_title.clone();
            }
        }
        if let Some(mapped) = self.custom.title_cheatsheet.get(title) {
            return mapped.clone();
        }
        self.diagnostics.record_missing_title(title);
        title.to_string()
    }

    /// Maps a source-system attachment URL to its file page title.
    pub fn attachment_title_from_link(&self, link: &str) -> Option<String> {
        let caps = self.attachment_url.as_ref()?.captures(link)?;
        let id: u32 = caps[1].parse().ok()?;
        match self.space.attachment_title(id) {
            Some(title) => Some(title.to_string()),
            None => {
                self.diagnostics.record_missing_attachment(link);
                Some(format!("Attachment-{id}"))
            }
        }
    }

    /// Maps a source-system URL (scheme stripped) to a wiki title.
    pub fn correspond_url(&self, url: &str) -> Option<String> {
        let domain = self.domain?;
        if !url.contains(domain) {
            return None;
        }
        if let Some(caps) = self.project_url.as_ref().and_then(|re| re.captures(url)) {
            let path = &caps[1];
            let parts: Vec<&str> = path.split('/').collect();
            return match parts.as_slice() {
                [single] if single.contains(':') => Some(single.to_string()),
                [_, "issues", ..] => None,
                [project, .., last] => Some(format!("{project}:{last}")),
                _ => None,
            };
        }
        if url.contains("/attachments/") {
            return self.attachment_title_from_link(&format!("https://{url}"));
        }
        if let Some(caps) = self.story_url.as_ref().and_then(|re| re.captures(url)) {
            return Some(format!("{STORY_NAMESPACE}:{}", &caps[1]));
        }
        None
    }

    /// Normalizes URL-shaped links and maps source-system URLs to internal links.
    pub fn pre_handle_urls(&self, content: &str) -> String {
        let content = DOUBLE_BRACKET_URL.replace_all(content, |caps: &Captures| {
            format!("[{}]", caps[1].replace('|', " "))
        });
        let content = FILE_URL.replace_all(&content, |caps: &Captures| match caps.get(2) {
            Some(text) => format!("[{} {}]", &caps[1], text.as_str()),
            None => format!("[{}]", &caps[1]),
        });
        if self.domain.is_none() {
            return content.into_owned();
        }

        let content = BRACKETED_URL.replace_all(&content, |caps: &Captures| {
            match (self.correspond_url(&caps[1]), caps.get(2)) {
                (Some(title), Some(text)) => format!("[[{title}|{}]]", text.as_str()),
                (Some(title), None) => format!("[[{title}]]"),
                (None, _) => caps[0].to_string(),
            }
        });

        let mut out = String::with_capacity(content.len());
        let mut last = 0;
        for caps in RAW_URL.captures_iter(&content) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let before = content[..whole.start()].chars().next_back();
            let after = content[whole.end()..].chars().next();
            let blocked_before =
                matches!(before, Some(c) if c == '[' || c == '|' || c == '"' || c == '\'' || is_word(c));
            let blocked_after =
                matches!(after, Some(c) if c == ']' || c == '"' || c == '\'' || is_word(c));
            if blocked_before || blocked_after {
                continue;
            }
            if let Some(title) = self.correspond_url(&caps[1]) {
                out.push_str(&content[last..whole.start()]);
                out.push_str(&format!("[[{title}]]"));
                last = whole.end();
            }
        }
        out.push_str(&content[last..]);
        out
    }
}

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn project_matches(page: &Page, namespace: &str) -> bool {
    let ns = namespace.replace(' ', "_");
    page.project_name
        .as_deref()
        .is_some_and(|name| name.replace(' ', "_") == ns)
        || page.project_identifier.as_deref() == Some(ns.as_str())
        || page.project_id.is_some_and(|id| id.to_string() == ns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::DiagramMap;
    use crate::config::ATTACHMENT_ID_OFFSET;
    use crate::models::{PageKind, PageMap};

    fn page(id: u32, wiki_id: u32, title: &str, formatted: &str) -> Page {
        Page {
            id,
            kind: PageKind::Native,
            namespace: 0,
            wiki_id: Some(wiki_id),
            project_id: Some(wiki_id * 10),
            project_name: Some(format!("Project {wiki_id}")),
            project_identifier: Some(format!("p{wiki_id}")),
            title: title.to_string(),
            parent_id: None,
            content_id: None,
            version: 2,
            protected: false,
            categories: Vec::new(),
            formatted_title: formatted.to_string(),
            redirects_to: None,
        }
    }

    fn space() -> TitleSpace {
        let mut logo = page(ATTACHMENT_ID_OFFSET + 7, 1, "logo.png", "File:logo.png");
        logo.kind = PageKind::Attachment;
        logo.namespace = 6;
        let pages: PageMap = vec![
            page(1, 1, "Home", "Home_p1"),
            page(2, 1, "Setup Guide", "Home_p1/Setup_Guide"),
            page(3, 2, "Setup Guide", "Other_p2/Setup_Guide"),
            page(4, 2, "FAQ", "Other_p2/FAQ"),
            page(5, 2, "diagram-overview", "Other_p2/diagram-overview"),
            logo,
        ]
        .into_iter()
        .map(|p| (p.id, p))
        .collect();
        TitleSpace::new(pages, DiagramMap::new())
    }

    fn custom() -> Customizations {
        let mut custom = Customizations {
            redmine_domain: Some("redmine.example.com".to_string()),
            ..Default::default()
        };
        custom
            .story_titles
            .insert("12".to_string(), "Stories/Onboarding".to_string());
        custom
            .title_cheatsheet
            .insert("old-name".to_string(), "Home_p1".to_string());
        custom
    }

    #[test]
    fn loose_equivalence() {
        assert!(is_same_title("Setup Guide", "setup_guide"));
        assert!(is_same_title("What's new?", "What\u{2019}s new"));
        assert!(is_same_title("v1.2, notes", "V12_notes"));
        assert!(!is_same_title("Setup", "Setup Guide"));
    }

    #[test]
    fn token_parsing_splits_namespace_and_fragment() {
        let token = LinkToken::parse("p2:Setup%20Guide#Install", Some(" Guide "));
        assert_eq!(token.target, "p2:Setup_Guide#Install");
        assert_eq!(token.namespace.as_deref(), Some("p2"));
        assert_eq!(token.title, "Setup_Guide");
        assert_eq!(token.fragment.as_deref(), Some("Install"));
        assert_eq!(token.text.as_deref(), Some("Guide"));

        let bare = LinkToken::parse("Home", None);
        assert_eq!(bare.namespace, None);
        assert_eq!(bare.fragment, None);
    }

    #[test]
    fn resolution_order() {
        let space = space();
        let custom = custom();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);
        let current = space.page(4).unwrap().clone();

        // exact formatted title
        let t = LinkToken::parse("Home_p1/Setup_Guide", None);
        assert_eq!(resolver.resolve(&t, &current).as_deref(), Some("Home_p1/Setup_Guide"));
        // project namespace wins over the current wiki
        let t = LinkToken::parse("p1:setup guide", None);
        assert_eq!(resolver.resolve(&t, &current).as_deref(), Some("Home_p1/Setup_Guide"));
        // same wiki preferred for bare titles
        let t = LinkToken::parse("Setup Guide", None);
        assert_eq!(resolver.resolve(&t, &current).as_deref(), Some("Other_p2/Setup_Guide"));
        // global fallback
        let t = LinkToken::parse("home", None);
        assert_eq!(resolver.resolve(&t, &current).as_deref(), Some("Home_p1"));
        let t = LinkToken::parse("Nope", None);
        assert_eq!(resolver.resolve(&t, &current), None);
    }

    #[test]
    fn rewrite_preserves_fragment_and_text() {
        let space = space();
        let custom = custom();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);
        let current = space.page(4).unwrap().clone();

        let (out, counts) = resolver.rewrite_links(
            "See [[Setup Guide#Install|the guide]] and [[FAQ]] and [[File:logo.png]].",
            &current,
            2,
        );
        assert_eq!(
            out,
            "See [[Other_p2/Setup_Guide#Install|the guide]] and [[Other_p2/FAQ|FAQ]] and [[File:logo.png]]."
        );
        assert_eq!(counts, LinkCounts { resolved: 3, unresolved: 0 });
    }

    #[test]
    fn category_user_and_anchor_links_untouched() {
        let space = space();
        let custom = custom();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);
        let current = space.page(1).unwrap().clone();

        let input = "[[Category:Home]] [[User:Home]] [[#Top%20section]]";
        let (out, counts) = resolver.rewrite_links(input, &current, 2);
        assert_eq!(out, "[[Category:Home]] [[User:Home]] [[#Top section]]");
        assert_eq!(counts, LinkCounts::default());
    }

    #[test]
    fn story_links_use_story_table() {
        let space = space();
        let custom = custom();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);
        let current = space.page(1).unwrap().clone();
        let (out, _) = resolver.rewrite_links("[[EKBStory:12|Read this]]", &current, 2);
        assert_eq!(out, "[[Stories/Onboarding]]");
    }

    #[test]
    fn unresolved_link_kept_and_reported_once() {
        let space = space();
        let custom = custom();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);
        let current = space.page(1).unwrap().clone();

        for version in 1..=2 {
            let (out, counts) = resolver.rewrite_links("x [[NonExistentPage]] y", &current, version);
            assert_eq!(out, "x [[NonExistentPage]] y");
            assert_eq!(counts.unresolved, 1);
        }
        let links = diagnostics.unresolved_links();
        assert_eq!(links.len(), 1);
        let entries = &links[&1];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, 2);
        assert_eq!(entries[0].target, "NonExistentPage");
    }

    #[test]
    fn formatted_title_lookup_falls_through() {
        let space = space();
        let custom = custom();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);

        assert_eq!(resolver.formatted_title_for("FAQ"), "Other_p2/FAQ");
        assert_eq!(
            resolver.formatted_title_for("diagram-overview.png"),
            "Other_p2/diagram-overview"
        );
        assert_eq!(resolver.formatted_title_for("old-name"), "Home_p1");
        assert_eq!(resolver.formatted_title_for("ghost.txt"), "ghost.txt");
        assert!(diagnostics.missing_titles().contains("ghost.txt"));
    }

    #[test]
    fn attachment_urls_map_to_file_pages() {
        let space = space();
        let custom = custom();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);

        assert_eq!(
            resolver
                .attachment_title_from_link("https://redmine.example.com/attachments/download/7/logo.png")
                .as_deref(),
            Some("File:logo.png")
        );
        assert_eq!(
            resolver
                .attachment_title_from_link("http://redmine.example.com/attachments/99")
                .as_deref(),
            Some("Attachment-99")
        );
        assert_eq!(diagnostics.missing_attachments().len(), 1);
        assert_eq!(
            resolver.attachment_title_from_link("https://elsewhere.org/attachments/7"),
            None
        );
    }

    #[test]
    fn source_urls_become_internal_links() {
        let space = space();
        let custom = custom();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);

        let input = "[https://redmine.example.com/projects/p2/wiki/FAQ the faq] \
                     https://redmine.example.com/easy_knowledge_stories/12 \
                     [https://redmine.example.com/projects/p2/issues/4 bug] \
                     [[https://example.org/a|b]]";
        let out = resolver.pre_handle_urls(input);
        assert_eq!(
            out,
            "[[p2:FAQ|the faq]] [[EKBStory:12]] \
             [https://redmine.example.com/projects/p2/issues/4 bug] \
             [https://example.org/a b]"
        );
    }

    #[test]
    fn raw_url_inside_attribute_left_alone() {
        let space = space();
        let custom = custom();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);
        let input = r#"<a href="https://redmine.example.com/projects/p2/wiki/FAQ">x</a>"#;
        assert_eq!(resolver.pre_handle_urls(input), input);
    }

    #[test]
    fn file_url_bracket_repaired_without_domain() {
        let space = space();
        let custom = Customizations::default();
        let diagnostics = Diagnostics::default();
        let resolver = LinkResolver::new(&space, &custom, &diagnostics);
        assert_eq!(
            resolver.pre_handle_urls("[File:https://example.org/x.png caption]"),
            "[https://example.org/x.png caption]"
        );
    }
}
