//! Side tables for text regions that later rewrite stages must not touch.
//!
//! A region is swapped for an alphanumeric token (`MIGRATIONKEEP<TAG><n>END`)
//! that survives the external converter unchanged, and swapped back in a
//! dedicated restore step.

use memchr::memmem;

const TOKEN_START: &str = "MIGRATIONKEEP";
const TOKEN_END: &str = "END";

#[derive(Debug)]
pub struct ProtectedRegions {
    tag: &'static str,
    regions: Vec<String>,
}

impl ProtectedRegions {
    /// `tag` must be uppercase ASCII letters so tokens of different tables never collide.
    pub fn new(tag: &'static str) -> Self {
        debug_assert!(tag.bytes().all(|b| b.is_ascii_uppercase()));
        Self {
            tag,
            regions: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    fn prefix(&self) -> String {
        let mut prefix = String::with_capacity(TOKEN_START.len() + self.tag.len());
        prefix.push_str(TOKEN_START);
        prefix.push_str(self.tag);
        prefix
    }

    pub fn token(&self, index: usize) -> String {
        let mut buf = itoa::Buffer::new();
        let mut token = self.prefix();
        token.push_str(buf.format(index));
        token.push_str(TOKEN_END);
        token
    }

    /// Stores `original` and returns the token that stands in for it.
    pub fn protect(&mut self, original: impl Into<String>) -> String {
        self.regions.push(original.into());
        self.token(self.regions.len() - 1)
    }

    /// Puts every stored region back in place of its token.
    ///
    /// Text that merely looks like a token but names no stored region is kept.
    pub fn restore(&self, content: &str) -> String {
        if self.regions.is_empty() {
            return content.to_string();
        }
        let prefix = self.prefix();
        let finder = memmem::Finder::new(prefix.as_bytes());
        let bytes = content.as_bytes();

        let mut out = String::with_capacity(content.len());
        let mut last = 0;
        for start in finder.find_iter(bytes) {
            if start < last {
                continue;
            }
            let digits_start = start + prefix.len();
            let digits_len = bytes[digits_start..]
                .iter()
                .take_while(|b| b.is_ascii_digit())
                .count();
            let digits_end = digits_start + digits_len;
            if digits_len == 0 || !content[digits_end..].starts_with(TOKEN_END) {
                continue;
            }
            let Some(region) = content[digits_start..digits_end]
                .parse::<usize>()
                .ok()
                .and_then(|i| self.regions.get(i))
            else {
                continue;
            };
            out.push_str(&content[last..start]);
            out.push_str(region);
            last = digits_end + TOKEN_END.len();
        }
        out.push_str(&content[last..]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protect_then_restore() {
        let mut regions = ProtectedRegions::new("PRE");
        let a = regions.protect("<pre>[[not a link]]</pre>");
        let b = regions.protect("second");
        assert_eq!(a, "MIGRATIONKEEPPRE0END");
        let text = format!("before\n{a}\nmiddle {b} after");
        assert_eq!(
            regions.restore(&text),
            "before\n<pre>[[not a link]]</pre>\nmiddle second after"
        );
    }

    #[test]
    fn double_digit_tokens_do_not_shadow_single_digit() {
        let mut regions = ProtectedRegions::new("CODE");
        let tokens: Vec<String> = (0..12).map(|i| regions.protect(format!("r{i}"))).collect();
        let text = format!("{} {}", tokens[1], tokens[11]);
        assert_eq!(regions.restore(&text), "r1 r11");
    }

    #[test]
    fn tables_with_other_tags_are_left_alone() {
        let mut pre = ProtectedRegions::new("PRE");
        let mut code = ProtectedRegions::new("CODE");
        let p = pre.protect("p");
        let c = code.protect("c");
        let text = format!("{p} {c}");
        assert_eq!(pre.restore(&text), format!("p {c}"));
    }

    #[test]
    fn unknown_index_is_kept() {
        let mut regions = ProtectedRegions::new("PRE");
        regions.protect("x");
        assert_eq!(
            regions.restore("MIGRATIONKEEPPRE7END and MIGRATIONKEEPPRE"),
            "MIGRATIONKEEPPRE7END and MIGRATIONKEEPPRE"
        );
    }

    #[test]
    fn empty_table_is_identity() {
        let regions = ProtectedRegions::new("PRE");
        assert!(regions.is_empty());
        assert_eq!(regions.restore("plain"), "plain");
    }
}
