//! Text rewrite stages of the revision conversion pipeline.
//!
//! Every function here is `text -> text`; anything a stage needs to look up
//! is passed in explicitly. The order in which they run lives in `convert`.

use crate::customize::Customizations;
use crate::lexers::convert_lexer_name;
use crate::links::{url_decode, LinkResolver};
use crate::placeholder::ProtectedRegions;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static BR_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<br />\n?").unwrap());

static PRE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<pre(?:\s[^>]*)?>.*?</pre>").unwrap());

static LIST_ITEM_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"([^\n])</li>").unwrap());

static ESCAPED_LINE_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\\([#*])").unwrap());

static ESCAPED_CELL_MARKER_SPACED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\|\s+)\\([#*])(\s+)").unwrap());

static ESCAPED_CELL_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\|\s+)\\([#*])(\S)").unwrap());

static HEADING_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^=+\s+.+\s+=+$").unwrap());

static REENCODED_ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)&amp;(#x[0-9a-f]+|#[0-9]+|[a-z0-9]+);").unwrap());

static COLLAPSE_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"===\s*\{\{collapse\((.*?)\)\s*===").unwrap());

static PLAINTEXT_PRE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<pre class="plaintext">"#).unwrap());

static PRE_CONTENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<pre>(.*?)</pre>").unwrap());

static SYNTAXHIGHLIGHT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<syntaxhighlight\s+lang\s*=\s*["'](.*?)["']\s*>(.*?)</syntaxhighlight>"#).unwrap()
});

static CODE_CONTENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<code>(.*?)</code>").unwrap());

static HIGHLIGHT_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?is)<span\s+class="[a-z0-9]+">(.*?)</span>"#).unwrap());

static CODE_CLASS_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<code\s+class="([^"]+)">"#).unwrap());

static CODE_CLOSE_AT_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"</code>\s*$").unwrap());

static BR_ANY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());

static EMPTY_SPAN_ANCHOR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<span\s+id="[^"]*"></span>"#).unwrap());

static TOC_MACRO: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*>?toc\s*\}\}").unwrap());

static INCLUDE_DIAGRAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\{\{include_diagram\((\d+)--([^)]+)\)\}\}").unwrap());

static THUMBNAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\{\{thumbnail\(([^,)]+)[^)]*\)\}\}").unwrap());

static ISSUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\{\{issue\((\d+)(?:,\s*[^)]+)?\)\}\}").unwrap());

static INCLUDE_PAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\{\{include\(([^)]+)\)\}\}").unwrap());

static CHILD_PAGES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\{\{child_pages(?:\(([^)]*)\))?\}\}").unwrap());

static PNG_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\.png$").unwrap());

static IMG_SRC: Lazy<Regex> = Lazy::new(|| Regex::new(r#"src="([^"]+)""#).unwrap());

static ANCHOR_HREF: Lazy<Regex> = Lazy::new(|| Regex::new(r#"href="([^"]+)""#).unwrap());

static TEXTILE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n!([^!\n]+?)!").unwrap());

const COLLAPSE_OPEN: &str = "{{collapse";
const COLLAPSIBLE_DIV: &str = r#"<div class="toccolours mw-collapsible mw-collapsed">"#;
const COLLAPSIBLE_CONTENT_DIV: &str = r#"<div class="mw-collapsible-content">"#;

/// Inserts `\n` before every `tag` that does not already start a line.
fn newline_before(content: &str, tag: &str) -> String {
    let mut out = String::with_capacity(content.len() + 8);
    let mut last = 0;
    for (pos, _) in content.match_indices(tag) {
        out.push_str(&content[last..pos]);
        if !content[..pos].ends_with('\n') {
            out.push('\n');
        }
        last = pos;
    }
    out.push_str(&content[last..]);
    out
}

/// Shapes raw source HTML for the converter's line-oriented parsing.
pub fn preprocess(content: &str, custom: &Customizations) -> String {
    let content = BR_TAG.replace_all(content, "<br />\n");
    let content = content.replace("</a>", "</a> ");
    let content = newline_before(&content, "<ul>");
    let content = newline_before(&content, "<table>");
    let content = custom.replace_customized(&content);
    content.replace("&nbsp;", " ").replace('\u{a0}', " ")
}

/// Swaps every `<pre>` element for a token so the converter never sees code.
pub fn protect_pre_blocks(content: &str, regions: &mut ProtectedRegions) -> String {
    PRE_BLOCK
        .replace_all(content, |caps: &Captures| {
            let token = regions.protect(&caps[0]);
            format!("\n\n{token}\n\n")
        })
        .into_owned()
}

/// Gives `</li>` its own line between the two converter hops.
pub fn break_list_items(content: &str) -> String {
    LIST_ITEM_END.replace_all(content, "${1}\n</li>").into_owned()
}

/// Undoes the converter's escaping of `#` and `*` at line starts and in table cells.
pub fn unescape_markers(content: &str) -> String {
    let content = ESCAPED_LINE_MARKER.replace_all(content, "$1");
    let content = ESCAPED_CELL_MARKER_SPACED.replace_all(&content, "${1}\n${2}${3}");
    ESCAPED_CELL_MARKER
        .replace_all(&content, "${1}${2}${3}")
        .into_owned()
}

/// Comments out a heading on the first or second line.
///
/// The converter turns a leading title paragraph into a heading that would
/// otherwise duplicate the page title.
pub fn comment_first_heading(content: &str) -> String {
    let mut lines: Vec<String> = content.splitn(3, '\n').map(str::to_string).collect();
    if HEADING_LINE.is_match(&lines[0]) {
        lines[0] = format!("<!--{}-->", lines[0]);
    } else if lines.get(1).is_some_and(|l| !l.is_empty() && HEADING_LINE.is_match(l)) {
        lines[1] = format!("<!--{}-->", lines[1]);
    } else {
        return content.to_string();
    }
    lines.join("\n")
}

/// Decodes markup-significant entities, including doubly encoded ones.
///
/// Other named or numeric entities are kept, but lose a second `&amp;` layer.
pub fn decode_entities(content: &str) -> String {
    if !content.contains('&') {
        return content.to_string();
    }
    let content = content
        .replace("&amp;lt;", "<")
        .replace("&amp;gt;", ">")
        .replace("&amp;quot;", "\"")
        .replace("&amp;amp;", "&");
    let content = REENCODED_ENTITY.replace_all(&content, "&$1;");
    content
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Byte offset of the first `}}` that is not part of a longer brace run.
fn find_block_close(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'}' && bytes[i + 1] == b'}' {
            let preceded = i > 0 && bytes[i - 1] == b'}';
            let followed = bytes.get(i + 2) == Some(&b'}');
            if !preceded && !followed {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

/// Rewrites `{{collapse(title) ... }}` blocks as collapsible divs.
pub fn expand_collapse_blocks(content: &str) -> String {
    if !content.contains(COLLAPSE_OPEN) {
        return content.to_string();
    }
    let content = COLLAPSE_HEADING.replace_all(content, "{{collapse(=== $1 ===)");

    let mut out = String::with_capacity(content.len() + 128);
    let mut rest: &str = &content;
    while let Some(start) = rest.find(COLLAPSE_OPEN) {
        let after_open = &rest[start + COLLAPSE_OPEN.len()..];
        let (title, body_start) = match after_open.strip_prefix('(') {
            Some(inner) => match inner.find(')') {
                Some(end) => (Some(&inner[..end]), &inner[end + 1..]),
                None => (None, after_open),
            },
            None => (None, after_open),
        };
        let Some(close) = find_block_close(body_start) else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push_str(COLLAPSIBLE_DIV);
        if let Some(title) = title {
            out.push('\n');
            out.push_str(title);
            out.push('\n');
        }
        out.push_str(COLLAPSIBLE_CONTENT_DIV);
        out.push('\n');
        out.push_str(&body_start[..close]);
        out.push_str("\n</div></div>");
        rest = &body_start[close + 2..];
    }
    out.push_str(rest);
    out
}

/// Converter-output fixes run right after the second hop.
pub fn fix_after_conversion(content: &str) -> String {
    let content = unescape_markers(content);
    let content = comment_first_heading(&content);
    let content = decode_entities(&content);
    expand_collapse_blocks(&content)
}

/// Renders the inside of a `<pre>` element as a target code block.
pub fn convert_code_block(inner: &str) -> String {
    let mut content = decode_entities(inner);
    loop {
        let stripped = HIGHLIGHT_SPAN.replace_all(&content, "$1");
        if stripped == content {
            break;
        }
        content = stripped.into_owned();
    }

    let block = if let Some(caps) = CODE_CLASS_OPEN.captures(&content) {
        let lexer = convert_lexer_name(&caps[1]);
        let body = CODE_CLASS_OPEN.replace(&content, "");
        let body = CODE_CLOSE_AT_END.replace(&body, "");
        format!("<syntaxhighlight lang=\"{lexer}\">\n{body}\n</syntaxhighlight>")
    } else {
        let body = content.replace("<code>", "").replace("</code>", "");
        format!("<pre>{body}</pre>")
    };

    let block = decode_entities(&block);
    BR_ANY.replace_all(&block, "\n").into_owned()
}

/// Moves every code region into `regions`, returning the text and the count moved.
pub fn isolate_code(content: &str, regions: &mut ProtectedRegions) -> (String, u64) {
    let mut count = 0u64;
    let content = PLAINTEXT_PRE.replace_all(content, "<pre>");
    let content = PRE_CONTENT.replace_all(&content, |caps: &Captures| {
        count += 1;
        regions.protect(convert_code_block(&caps[1]))
    });
    let content = SYNTAXHIGHLIGHT.replace_all(&content, |caps: &Captures| {
        count += 1;
        regions.protect(format!(
            "<syntaxhighlight lang=\"{}\">{}</syntaxhighlight>",
            convert_lexer_name(&caps[1]),
            decode_entities(&caps[2])
        ))
    });
    let content = CODE_CONTENT.replace_all(&content, |caps: &Captures| {
        count += 1;
        regions.protect(format!("<code>{}</code>", decode_entities(&caps[1])))
    });
    (content.into_owned(), count)
}

/// Replaces `open TITLE close` spans with `[[formatted title]]`, line by line.
pub fn replace_inline_titles<F>(content: &str, open: &str, close: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> String,
{
    if !content.contains(open) {
        return content.to_string();
    }
    content
        .split('\n')
        .map(|line| {
            let mut parts = line.split(open);
            let mut new_line = parts.next().unwrap_or_default().to_string();
            for part in parts {
                match part.find(close) {
                    Some(end) => {
                        new_line.push_str("[[");
                        new_line.push_str(&lookup(&part[..end]));
                        new_line.push_str("]]");
                        new_line.push_str(&part[end + close.len()..]);
                    }
                    None => {
                        new_line.push_str(open);
                        new_line.push_str(part);
                    }
                }
            }
            new_line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Drops lines holding empty `<span id>` anchors and turns toc macros into `__TOC__`.
pub fn replace_inline_elements(content: &str) -> String {
    content
        .split('\n')
        .filter(|line| !EMPTY_SPAN_ANCHOR.is_match(line))
        .map(|line| TOC_MACRO.replace_all(line, "__TOC__"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Expands the known Redmine macros, returning the text and the number expanded.
///
/// `diagram_file` maps a diagram id to its uploaded file name.
pub fn expand_macros<F>(content: &str, diagram_file: F, domain: Option<&str>) -> (String, u64)
where
    F: Fn(u32) -> Option<String>,
{
    if !content.contains("{{") {
        return (content.to_string(), 0);
    }
    let mut count = 0u64;

    let content = INCLUDE_DIAGRAM.replace_all(content, |caps: &Captures| {
        let file = caps[1].parse::<u32>().ok().and_then(&diagram_file);
        match file {
            Some(file) => {
                count += 1;
                let name = PNG_SUFFIX.replace(&file, "");
                format!("<drawio filename=\"{name}\" alt=\"{}\"></drawio>", &caps[2])
            }
            None => caps[0].to_string(),
        }
    });

    let content = THUMBNAIL.replace_all(&content, |caps: &Captures| {
        count += 1;
        format!("[[File:{}]]", caps[1].trim())
    });

    let content = ISSUE.replace_all(&content, |caps: &Captures| match domain {
        Some(domain) => {
            count += 1;
            format!("[https://{domain}/issues/{id} #{id}]", id = &caps[1])
        }
        None => caps[0].to_string(),
    });

    let content = INCLUDE_PAGE.replace_all(&content, |caps: &Captures| {
        count += 1;
        format!("{{{{:{}}}}}", caps[1].trim())
    });

    let content = CHILD_PAGES.replace_all(&content, |caps: &Captures| {
        count += 1;
        let title = caps
            .get(1)
            .and_then(|args| args.as_str().split(',').find(|part| !part.contains('=')))
            .map(str::trim)
            .unwrap_or_default();
        format!("{{{{#subpages:{title}}}}}")
    });

    (content.into_owned(), count)
}

/// Replaces `<open…>inner</close>` wrappers with whatever `render` builds from
/// the opening tag's attributes and the inner text.
///
/// A wrapper whose opening tag never closes is kept as written.
fn rewrite_elements<F>(content: &str, open: &str, close: &str, mut render: F) -> String
where
    F: FnMut(&str, Option<&str>) -> String,
{
    let mut chunks = content.split(open);
    let mut out = chunks.next().unwrap_or_default().to_string();
    for chunk in chunks {
        match chunk.split_once('>') {
            Some((attrs, rest)) => match rest.split_once(close) {
                Some((inner, tail)) => {
                    out.push_str(&render(attrs, Some(inner)));
                    out.push_str(tail);
                }
                None => {
                    out.push_str(&render(attrs, None));
                    out.push_str(rest);
                }
            },
            None => {
                out.push_str(open);
                out.push_str(chunk);
            }
        }
    }
    out
}

/// Unwraps `<figure class="image…">` so the image inside becomes inline.
pub fn unwrap_image_figures(content: &str) -> String {
    if !content.contains("<figure class=\"image") {
        return content.to_string();
    }
    rewrite_elements(content, "<figure class=\"image", "</figure>", |_, inner| {
        inner.unwrap_or_default().to_string()
    })
}

/// Turns `<img>` elements and line-leading Textile `!name!` images into links.
pub fn rewrite_images(content: &str, resolver: &LinkResolver) -> String {
    let mut chunks = content.split("<img ");
    let mut out = chunks.next().unwrap_or_default().to_string();
    for chunk in chunks {
        let Some((attrs, rest)) = chunk.split_once('>') else {
            out.push_str("<img ");
            out.push_str(chunk);
            continue;
        };
        let Some(caps) = IMG_SRC.captures(attrs) else {
            out.push_str("<img ");
            out.push_str(chunk);
            continue;
        };
        let src = &caps[1];
        if !src.contains(":/") {
            out.push_str("[[");
            out.push_str(&resolver.formatted_title_for(&url_decode(src)));
            out.push_str("]]");
        } else {
            match resolver.attachment_title_from_link(src) {
                Some(title) => {
                    out.push_str("[[");
                    out.push_str(&title);
                    out.push_str("]]");
                }
                None => {
                    out.push('[');
                    out.push_str(src);
                    out.push(']');
                }
            }
        }
        out.push_str(rest);
    }

    TEXTILE_IMAGE
        .replace_all(&out, |caps: &Captures| format!("\n[[File:{}]]", caps[1].trim()))
        .into_owned()
}

/// Converts `<a href>` elements into `[href text]` external links.
pub fn rewrite_anchors(content: &str) -> String {
    if !content.contains("<a ") {
        return content.to_string();
    }
    rewrite_elements(content, "<a ", "</a>", |attrs, inner| {
        let link = ANCHOR_HREF
            .captures(attrs)
            .map(|caps| caps[1].to_string())
            .unwrap_or_else(|| {
                tracing::debug!(attrs, "Anchor without href");
                "#".to_string()
            });
        let text = inner
            .map(|inner| {
                inner
                    .replace("<br />", "")
                    .replace('\n', "")
                    .replace("[[", "")
                    .replace("]]", "")
                    .trim()
                    .to_string()
            })
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| link.clone());
        format!("[{link} {text}]")
    })
}

/// Drops `<figure class="table">` wrappers and splits list items out of cells.
pub fn unwrap_table_figures(content: &str) -> String {
    if !content.contains("<figure class=\"table\">") {
        return content.to_string();
    }
    rewrite_elements(content, "<figure class=\"table\"", "</figure>", |_, inner| {
        split_cell_lists(inner.unwrap_or_default())
    })
}

/// Puts a `*` list that directly follows a cell separator on its own line.
pub fn split_cell_lists(table: &str) -> String {
    table.replace("| *", "|\n*")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    /// A complete `<table>…</table>` element
    Table(String),
}

/// Splits content around embedded HTML tables.
pub fn split_html_tables(content: &str) -> Vec<Segment> {
    let mut chunks = content.split("<table");
    let mut segments = vec![Segment::Text(chunks.next().unwrap_or_default().to_string())];
    for chunk in chunks {
        match chunk.split_once('>') {
            Some((attrs, rest)) => {
                let (inner, tail) = rest.split_once("</table>").unwrap_or((rest, ""));
                segments.push(Segment::Table(format!("<table{attrs}>{inner}</table>")));
                segments.push(Segment::Text(tail.to_string()));
            }
            None => segments.push(Segment::Text(format!("<table{chunk}"))),
        }
    }
    segments
}

/// Appends one category marker per category.
pub fn append_categories(content: &str, categories: &[String]) -> String {
    if categories.is_empty() {
        return content.to_string();
    }
    let mut out = content.trim_end_matches('\n').to_string();
    for category in categories {
        out.push_str("\n[[Category:");
        out.push_str(category);
        out.push_str("]]");
    }
    out
}
