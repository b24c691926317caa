use std::cell::RefCell;
use std::rc::Rc;

use crate::compiler::CompilerSink;
use crate::delimiters::Delimiters;
use crate::error::{FuyuzoraError, Location, Result};
use crate::tag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    StartTag,
    Tag,
    EndTag,
    LineSeparator,
}

/// Character-driven tokenizer.
///
/// Emits parse events to a [`CompilerSink`] as it scans. The delimiter pair
/// is read through a shared cell on every character, so a set-delimiters tag
/// handled by the compiler takes effect for the rest of the document.
pub struct Lexer {
    template: String,
    chars: Vec<char>,
    delimiters: Rc<RefCell<Delimiters>>,
    state: State,
    /// Pending literal text run.
    text: String,
    /// Pending tag content, without delimiters.
    tag: String,
    /// Characters of the start delimiter matched so far.
    start_match: usize,
    /// Characters of the end delimiter matched so far.
    end_match: usize,
    /// The tag began with an extra start-delimiter character (`{{{` form).
    triple: bool,
    /// The extra closing character of a triple tag has not been consumed yet.
    triple_pending: bool,
    tag_location: Location,
    line: u32,
    column: u32,
}

impl Lexer {
    pub fn new(template: &str, source: &str, delimiters: Rc<RefCell<Delimiters>>) -> Self {
        Self {
            template: template.to_string(),
            chars: source.chars().collect(),
            delimiters,
            state: State::Text,
            text: String::new(),
            tag: String::new(),
            start_match: 0,
            end_match: 0,
            triple: false,
            triple_pending: false,
            tag_location: Location::new(1, 1),
            line: 1,
            column: 1,
        }
    }

    /// Scan the whole source, emitting events to the sink.
    pub fn run(&mut self, sink: &mut dyn CompilerSink) -> Result<()> {
        sink.start_template()?;
        let mut pos = 0;
        while pos < self.chars.len() {
            let c = self.chars[pos];
            self.feed(c, sink)?;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            pos += 1;
        }
        self.finish(sink)
    }

    fn feed(&mut self, c: char, sink: &mut dyn CompilerSink) -> Result<()> {
        match self.state {
            State::Text => self.feed_text(c, sink),
            State::StartTag => self.feed_start_tag(c, sink),
            State::Tag => self.feed_tag(c, sink),
            State::EndTag => self.feed_end_tag(c, sink),
            State::LineSeparator => self.feed_line_separator(c, sink),
        }
    }

    fn feed_text(&mut self, c: char, sink: &mut dyn CompilerSink) -> Result<()> {
        let (first, len) = {
            let d = self.delimiters.borrow();
            (d.start_char(0), d.start_len())
        };
        if Some(c) == first {
            self.tag_location = Location::new(self.line, self.column);
            if len == 1 {
                self.flush_text(sink)?;
                self.enter_tag();
            } else {
                self.state = State::StartTag;
                self.start_match = 1;
            }
            return Ok(());
        }
        match c {
            '\n' => {
                self.flush_text(sink)?;
                sink.line_separator("\n")
            }
            '\r' => {
                // Both "\r" and "\r\n" remain candidates until the next char.
                self.state = State::LineSeparator;
                Ok(())
            }
            _ => {
                self.text.push(c);
                Ok(())
            }
        }
    }

    fn feed_line_separator(&mut self, c: char, sink: &mut dyn CompilerSink) -> Result<()> {
        self.flush_text(sink)?;
        self.state = State::Text;
        if c == '\n' {
            sink.line_separator("\r\n")
        } else {
            sink.line_separator("\r")?;
            self.feed(c, sink)
        }
    }

    fn feed_start_tag(&mut self, c: char, sink: &mut dyn CompilerSink) -> Result<()> {
        let expected = {
            let d = self.delimiters.borrow();
            d.start_char(self.start_match)
        };
        if Some(c) == expected {
            self.start_match += 1;
            let len = {
                let d = self.delimiters.borrow();
                d.start_len()
            };
            if self.start_match == len {
                self.flush_text(sink)?;
                self.enter_tag();
            }
            Ok(())
        } else {
            // The partially matched prefix was literal text after all.
            let prefix: String = {
                let d = self.delimiters.borrow();
                d.start().chars().take(self.start_match).collect()
            };
            self.text.push_str(&prefix);
            self.start_match = 0;
            self.state = State::Text;
            self.feed(c, sink)
        }
    }

    fn feed_tag(&mut self, c: char, sink: &mut dyn CompilerSink) -> Result<()> {
        let (is_default, first_end, end_len) = {
            let d = self.delimiters.borrow();
            (d.is_default(), d.end_char(0), d.end_len())
        };
        if self.tag.is_empty() && !self.triple && is_default && c == '{' {
            self.triple = true;
            self.triple_pending = true;
            self.tag.push(c);
            return Ok(());
        }
        if Some(c) == first_end {
            if self.triple_pending {
                // The extra closing character belongs to the content.
                self.triple_pending = false;
                self.tag.push(c);
                return Ok(());
            }
            if end_len == 1 {
                return self.flush_tag(sink);
            }
            self.state = State::EndTag;
            self.end_match = 1;
            return Ok(());
        }
        self.tag.push(c);
        Ok(())
    }

    fn feed_end_tag(&mut self, c: char, sink: &mut dyn CompilerSink) -> Result<()> {
        let expected = {
            let d = self.delimiters.borrow();
            d.end_char(self.end_match)
        };
        if Some(c) == expected {
            self.end_match += 1;
            let len = {
                let d = self.delimiters.borrow();
                d.end_len()
            };
            if self.end_match == len {
                return self.flush_tag(sink);
            }
            Ok(())
        } else {
            // A partial end-delimiter match inside a tag usually means a
            // malformed key; keep it as content and carry on.
            let prefix: String = {
                let d = self.delimiters.borrow();
                d.end().chars().take(self.end_match).collect()
            };
            log::warn!(
                "template '{}' {}: '{}' inside a tag looks like a malformed key",
                self.template,
                self.tag_location,
                prefix
            );
            self.tag.push_str(&prefix);
            self.end_match = 0;
            self.state = State::Tag;
            self.feed(c, sink)
        }
    }

    fn enter_tag(&mut self) {
        self.state = State::Tag;
        self.tag.clear();
        self.end_match = 0;
        self.triple = false;
        self.triple_pending = false;
    }

    fn flush_text(&mut self, sink: &mut dyn CompilerSink) -> Result<()> {
        let text = std::mem::take(&mut self.text);
        if !text.is_empty() {
            sink.text(&text)?;
        }
        Ok(())
    }

    fn flush_tag(&mut self, sink: &mut dyn CompilerSink) -> Result<()> {
        let raw = std::mem::take(&mut self.tag);
        let (source, default_end) = {
            let d = self.delimiters.borrow();
            (format!("{}{}{}", d.start(), raw, d.end()), d.is_default())
        };
        let parsed = tag::classify(&raw, default_end, source, self.tag_location);
        self.state = State::Text;
        sink.tag(parsed)
    }

    fn finish(&mut self, sink: &mut dyn CompilerSink) -> Result<()> {
        match self.state {
            State::Text => {
                self.flush_text(sink)?;
                sink.end_template()
            }
            State::LineSeparator => {
                // A trailing '\r' resolves to the lone-CR separator.
                self.flush_text(sink)?;
                sink.line_separator("\r")?;
                sink.end_template()
            }
            State::StartTag | State::Tag | State::EndTag => Err(FuyuzoraError::UnterminatedTag {
                template: self.template.clone(),
                location: self.tag_location,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::{ParsedTag, TagKind};

    #[derive(Debug, PartialEq)]
    enum Event {
        Start,
        Text(String),
        Tag(TagKind, String),
        Separator(&'static str),
        End,
    }

    /// Sink that records events and applies set-delimiters tags the way the
    /// compiler would.
    struct EventSink {
        events: Vec<Event>,
        delimiters: Rc<RefCell<Delimiters>>,
    }

    impl CompilerSink for EventSink {
        fn start_template(&mut self) -> Result<()> {
            self.events.push(Event::Start);
            Ok(())
        }

        fn text(&mut self, text: &str) -> Result<()> {
            self.events.push(Event::Text(text.to_string()));
            Ok(())
        }

        fn tag(&mut self, tag: ParsedTag) -> Result<()> {
            if tag.kind == TagKind::SetDelimiters {
                if let Some((start, end)) = Delimiters::parse_pair(&tag.content) {
                    self.delimiters.borrow_mut().set(&start, &end)?;
                }
            }
            self.events.push(Event::Tag(tag.kind, tag.content));
            Ok(())
        }

        fn line_separator(&mut self, separator: &'static str) -> Result<()> {
            self.events.push(Event::Separator(separator));
            Ok(())
        }

        fn end_template(&mut self) -> Result<()> {
            self.events.push(Event::End);
            Ok(())
        }
    }

    fn scan_with(source: &str, delimiters: Delimiters) -> Result<Vec<Event>> {
        let cell = Rc::new(RefCell::new(delimiters));
        let mut sink = EventSink {
            events: Vec::new(),
            delimiters: cell.clone(),
        };
        Lexer::new("test", source, cell).run(&mut sink)?;
        Ok(sink.events)
    }

    fn scan(source: &str) -> Result<Vec<Event>> {
        scan_with(source, Delimiters::default())
    }

    #[test]
    fn test_plain_text() {
        let events = scan("Hello, world!").unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Text("Hello, world!".to_string()),
                Event::End
            ]
        );
    }

    #[test]
    fn test_simple_variable() {
        let events = scan("Hi {{ name }}!").unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Text("Hi ".to_string()),
                Event::Tag(TagKind::Variable, "name".to_string()),
                Event::Text("!".to_string()),
                Event::End
            ]
        );
    }

    #[test]
    fn test_tag_kinds() {
        let events = scan("{{#a}}{{^b}}{{/b}}{{/a}}{{>p}}{{!c}}{{<base}}{{$s}}{{/s}}{{/base}}").unwrap();
        let kinds: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                Event::Tag(kind, _) => Some(*kind),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                TagKind::Section,
                TagKind::InvertedSection,
                TagKind::SectionEnd,
                TagKind::SectionEnd,
                TagKind::Partial,
                TagKind::Comment,
                TagKind::Extend,
                TagKind::ExtendSection,
                TagKind::SectionEnd,
                TagKind::SectionEnd,
            ]
        );
    }

    #[test]
    fn test_triple_unescaped() {
        let events = scan("{{{raw}}}").unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Tag(TagKind::UnescapedVariable, "raw".to_string()),
                Event::End
            ]
        );
    }

    #[test]
    fn test_ampersand_unescaped() {
        let events = scan("{{& raw }}").unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Tag(TagKind::UnescapedVariable, "raw".to_string()),
                Event::End
            ]
        );
    }

    #[test]
    fn test_line_separators() {
        let events = scan("a\nb\r\nc\rd").unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Text("a".to_string()),
                Event::Separator("\n"),
                Event::Text("b".to_string()),
                Event::Separator("\r\n"),
                Event::Text("c".to_string()),
                Event::Separator("\r"),
                Event::Text("d".to_string()),
                Event::End
            ]
        );
    }

    #[test]
    fn test_trailing_carriage_return() {
        let events = scan("a\r").unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Text("a".to_string()),
                Event::Separator("\r"),
                Event::End
            ]
        );
    }

    #[test]
    fn test_partial_start_delimiter_is_text() {
        let events = scan("a {curly} b").unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Text("a {curly} b".to_string()),
                Event::End
            ]
        );
    }

    #[test]
    fn test_partial_end_delimiter_reinjected() {
        let events = scan("{{a}b}}").unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Tag(TagKind::Variable, "a}b".to_string()),
                Event::End
            ]
        );
    }

    #[test]
    fn test_delimiter_switch_mid_document() {
        let events = scan("{{=<% %>=}}<%foo%> {{bar}}").unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Tag(TagKind::SetDelimiters, "<% %>=".to_string()),
                Event::Tag(TagKind::Variable, "foo".to_string()),
                Event::Text(" {{bar}}".to_string()),
                Event::End
            ]
        );
    }

    #[test]
    fn test_single_character_delimiters() {
        let events = scan_with("<a> text", Delimiters::new("<", ">").unwrap()).unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Tag(TagKind::Variable, "a".to_string()),
                Event::Text(" text".to_string()),
                Event::End
            ]
        );
    }

    #[test]
    fn test_unterminated_tag_error() {
        let err = scan("text {{name").unwrap_err();
        assert!(matches!(err, FuyuzoraError::UnterminatedTag { .. }));
    }

    #[test]
    fn test_unterminated_start_delimiter_error() {
        let err = scan("text {").unwrap_err();
        assert!(matches!(err, FuyuzoraError::UnterminatedTag { .. }));
    }

    #[test]
    fn test_repeated_prefix_before_tag() {
        // "aab" restarts the start-delimiter match after the stray 'a'.
        let events = scan_with("aabxba", Delimiters::new("ab", "ba").unwrap()).unwrap();
        assert_eq!(
            events,
            vec![
                Event::Start,
                Event::Text("a".to_string()),
                Event::Tag(TagKind::Variable, "x".to_string()),
                Event::End
            ]
        );
    }
}
