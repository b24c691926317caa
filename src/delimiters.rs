use crate::error::{FuyuzoraError, Result};

/// Default start delimiter. Templates using the default pair may also use the
/// triple-marker unescaped form `{{{name}}}`.
pub const DEFAULT_START: &str = "{{";
/// Default end delimiter.
pub const DEFAULT_END: &str = "}}";

/// The current tag delimiter pair of a compilation.
///
/// A set-delimiters tag mutates the pair mid-document; the tokenizer reads
/// the pair through a shared cell so the change applies to every character
/// tokenized after the tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiters {
    start: Vec<char>,
    end: Vec<char>,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            start: DEFAULT_START.chars().collect(),
            end: DEFAULT_END.chars().collect(),
        }
    }
}

impl Delimiters {
    pub fn new(start: &str, end: &str) -> Result<Self> {
        if start.is_empty() || end.is_empty() {
            return Err(FuyuzoraError::InvalidDelimiters {
                message: "delimiters must be non-empty".to_string(),
            });
        }
        Ok(Self {
            start: start.chars().collect(),
            end: end.chars().collect(),
        })
    }

    pub fn start(&self) -> String {
        self.start.iter().collect()
    }

    pub fn end(&self) -> String {
        self.end.iter().collect()
    }

    pub fn start_len(&self) -> usize {
        self.start.len()
    }

    pub fn end_len(&self) -> usize {
        self.end.len()
    }

    pub fn start_char(&self, index: usize) -> Option<char> {
        self.start.get(index).copied()
    }

    pub fn end_char(&self, index: usize) -> Option<char> {
        self.end.get(index).copied()
    }

    /// The triple-marker unescaped form is only recognized for the default
    /// pair, where an extra `{`/`}` around the key reads naturally.
    pub fn is_default(&self) -> bool {
        self.start.iter().collect::<String>() == DEFAULT_START
            && self.end.iter().collect::<String>() == DEFAULT_END
    }

    pub fn set(&mut self, start: &str, end: &str) -> Result<()> {
        let next = Self::new(start, end)?;
        *self = next;
        Ok(())
    }

    /// Parse the body of a set-delimiters tag.
    ///
    /// The tag reads `{{=<% %>=}}`; after the leading `=` command character is
    /// stripped the content is `<% %>=`. The trailing `=` must be present and
    /// the remainder must split into exactly two non-empty markers.
    pub fn parse_pair(content: &str) -> Option<(String, String)> {
        let inner = content.trim().strip_suffix('=')?;
        let mut parts = inner.split_whitespace();
        let start = parts.next()?;
        let end = parts.next()?;
        if parts.next().is_some() || start.contains('=') || end.contains('=') {
            return None;
        }
        Some((start.to_string(), end.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pair() {
        let d = Delimiters::default();
        assert_eq!(d.start(), "{{");
        assert_eq!(d.end(), "}}");
        assert!(d.is_default());
    }

    #[test]
    fn test_custom_pair_is_not_default() {
        let d = Delimiters::new("<%", "%>").unwrap();
        assert!(!d.is_default());
        assert_eq!(d.start_char(0), Some('<'));
        assert_eq!(d.end_char(1), Some('>'));
    }

    #[test]
    fn test_empty_marker_rejected() {
        assert!(Delimiters::new("", "}}").is_err());
        assert!(Delimiters::new("{{", "").is_err());
    }

    #[test]
    fn test_parse_pair() {
        assert_eq!(
            Delimiters::parse_pair("<% %>="),
            Some(("<%".to_string(), "%>".to_string()))
        );
        assert_eq!(
            Delimiters::parse_pair("  [[ ]]=  "),
            Some(("[[".to_string(), "]]".to_string()))
        );
    }

    #[test]
    fn test_parse_pair_rejects_malformed() {
        // Missing trailing '='
        assert_eq!(Delimiters::parse_pair("<% %>"), None);
        // Only one marker
        assert_eq!(Delimiters::parse_pair("<%="), None);
        // Three markers
        assert_eq!(Delimiters::parse_pair("a b c="), None);
        // '=' inside a marker
        assert_eq!(Delimiters::parse_pair("=a b="), None);
    }

    #[test]
    fn test_set_replaces_pair() {
        let mut d = Delimiters::default();
        d.set("<%", "%>").unwrap();
        assert_eq!(d.start(), "<%");
        assert_eq!(d.end(), "%>");
        assert!(!d.is_default());
    }
}
