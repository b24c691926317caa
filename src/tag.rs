use crate::error::Location;

/// The closed set of tag kinds.
///
/// Every kind except `Variable` is selected by a single leading command
/// character inside the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Variable,
    UnescapedVariable,
    Section,
    InvertedSection,
    SectionEnd,
    Comment,
    Partial,
    SetDelimiters,
    Extend,
    ExtendSection,
}

impl TagKind {
    pub fn command(self) -> Option<char> {
        match self {
            TagKind::Variable => None,
            TagKind::UnescapedVariable => Some('&'),
            TagKind::Section => Some('#'),
            TagKind::InvertedSection => Some('^'),
            TagKind::SectionEnd => Some('/'),
            TagKind::Comment => Some('!'),
            TagKind::Partial => Some('>'),
            TagKind::SetDelimiters => Some('='),
            TagKind::Extend => Some('<'),
            TagKind::ExtendSection => Some('$'),
        }
    }
}

/// A single scanned tag, produced by the tokenizer and consumed immediately
/// by the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTag {
    pub kind: TagKind,
    /// Tag content after command-character stripping and trimming. May be
    /// empty; the compiler rejects empty content.
    pub content: String,
    /// The full source text of the tag, delimiters included.
    pub source: String,
    pub location: Location,
}

/// Derive the tag kind and extract its content from the raw text between the
/// delimiters.
///
/// `default_end` reports whether the end delimiter in effect is the default
/// `}}`; only then is the `{name}` triple shorthand recognized, with both the
/// leading `{` and the trailing `}` stripped from the content.
pub fn classify(raw: &str, default_end: bool, source: String, location: Location) -> ParsedTag {
    let trimmed = raw.trim();
    let (kind, content) = match trimmed.chars().next() {
        Some('#') => (TagKind::Section, strip_command(trimmed)),
        Some('^') => (TagKind::InvertedSection, strip_command(trimmed)),
        Some('/') => (TagKind::SectionEnd, strip_command(trimmed)),
        Some('!') => (TagKind::Comment, strip_command(trimmed)),
        Some('>') => (TagKind::Partial, strip_command(trimmed)),
        Some('=') => (TagKind::SetDelimiters, strip_command(trimmed)),
        Some('<') => (TagKind::Extend, strip_command(trimmed)),
        Some('$') => (TagKind::ExtendSection, strip_command(trimmed)),
        Some('&') => (TagKind::UnescapedVariable, strip_command(trimmed)),
        Some('{') if default_end => (TagKind::UnescapedVariable, strip_braces(trimmed)),
        _ => (TagKind::Variable, trimmed.to_string()),
    };
    ParsedTag {
        kind,
        content,
        source,
        location,
    }
}

fn strip_command(trimmed: &str) -> String {
    let mut chars = trimmed.chars();
    chars.next();
    chars.as_str().trim().to_string()
}

fn strip_braces(trimmed: &str) -> String {
    let inner = trimmed.strip_prefix('{').unwrap_or(trimmed);
    let inner = inner.strip_suffix('}').unwrap_or(inner);
    inner.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_content(raw: &str) -> (TagKind, String) {
        let tag = classify(raw, true, String::new(), Location::default());
        (tag.kind, tag.content)
    }

    #[test]
    fn test_variable() {
        assert_eq!(classify_content(" name "), (TagKind::Variable, "name".to_string()));
    }

    #[test]
    fn test_command_characters() {
        assert_eq!(classify_content("#items"), (TagKind::Section, "items".to_string()));
        assert_eq!(classify_content("^items"), (TagKind::InvertedSection, "items".to_string()));
        assert_eq!(classify_content("/items"), (TagKind::SectionEnd, "items".to_string()));
        assert_eq!(classify_content("! a comment"), (TagKind::Comment, "a comment".to_string()));
        assert_eq!(classify_content("> header"), (TagKind::Partial, "header".to_string()));
        assert_eq!(classify_content("<base"), (TagKind::Extend, "base".to_string()));
        assert_eq!(classify_content("$title"), (TagKind::ExtendSection, "title".to_string()));
        assert_eq!(classify_content("&raw"), (TagKind::UnescapedVariable, "raw".to_string()));
    }

    #[test]
    fn test_command_with_surrounding_whitespace() {
        assert_eq!(classify_content(" # items "), (TagKind::Section, "items".to_string()));
    }

    #[test]
    fn test_triple_form_strips_both_braces() {
        assert_eq!(
            classify_content("{raw}"),
            (TagKind::UnescapedVariable, "raw".to_string())
        );
    }

    #[test]
    fn test_triple_form_requires_default_end() {
        let tag = classify("{raw}", false, String::new(), Location::default());
        assert_eq!(tag.kind, TagKind::Variable);
        assert_eq!(tag.content, "{raw}");
    }

    #[test]
    fn test_set_delimiters_keeps_trailing_marker() {
        assert_eq!(
            classify_content("=<% %>="),
            (TagKind::SetDelimiters, "<% %>=".to_string())
        );
    }
}
