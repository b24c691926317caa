use std::fmt;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::resolver::Hint;
use crate::template::Template;

/// Where a segment came from, for diagnostics.
///
/// `line` and `index` are `None` for synthetically constructed segments such
/// as the indentation text injected ahead of partial output lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub template: Arc<str>,
    pub line: Option<u32>,
    pub index: Option<u32>,
}

impl Origin {
    pub fn new(template: Arc<str>, line: u32, index: u32) -> Self {
        Self {
            template,
            line: Some(line),
            index: Some(index),
        }
    }

    pub fn synthetic(template: Arc<str>) -> Self {
        Self {
            template,
            line: None,
            index: None,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "template '{}', line {}", self.template, line),
            None => write!(f, "template '{}'", self.template),
        }
    }
}

/// A node of the compiled segment tree.
///
/// The tree is immutable once its template is sealed and is shared freely
/// across concurrent renders. Children are owned by value inside their
/// parent; no segment holds a reference back to its parent.
#[derive(Debug, Clone)]
pub enum Segment {
    Text(TextSegment),
    Value(ValueSegment),
    Section(BlockSegment),
    InvertedSection(BlockSegment),
    Comment(CommentSegment),
    SetDelimiters(SetDelimitersSegment),
    LineSeparator(Arc<LineSeparatorSegment>),
    Partial(PartialSegment),
    Extend(ExtendSegment),
    ExtendSection(BlockSegment),
    Root(RootSegment),
}

#[derive(Debug, Clone)]
pub struct TextSegment {
    pub text: String,
    pub origin: Origin,
}

#[derive(Debug, Clone)]
pub struct ValueSegment {
    pub key: String,
    pub unescape: bool,
    /// Full source text of the tag, for literal reconstruction.
    pub source: String,
    pub origin: Origin,
    pub(crate) hint: OnceCell<Hint>,
}

#[derive(Debug, Clone)]
pub struct CommentSegment {
    pub source: String,
    pub origin: Origin,
}

#[derive(Debug, Clone)]
pub struct SetDelimitersSegment {
    pub source: String,
    pub origin: Origin,
}

/// One of `\n`, `\r` or `\r\n`. Instances are interned per template after
/// compilation, so the same `Arc` is shared by every occurrence of a given
/// separator text.
#[derive(Debug, Clone)]
pub struct LineSeparatorSegment {
    pub text: &'static str,
    pub origin: Origin,
}

#[derive(Debug, Clone)]
pub struct PartialSegment {
    pub key: String,
    /// Leading whitespace captured from a standalone partial line; re-applied
    /// to every output line of the included template.
    pub indentation: Option<String>,
    pub source: String,
    pub origin: Origin,
    /// Write-once resolution cache. Populated on first render when partial
    /// caching is enabled; duplicate first computation is tolerated.
    pub(crate) resolved: OnceCell<Arc<Template>>,
    /// Derived template with the indentation applied, built lazily.
    pub(crate) indented: OnceCell<Arc<Template>>,
}

/// A section-like container: `Section`, `InvertedSection` or `ExtendSection`.
#[derive(Debug, Clone)]
pub struct BlockSegment {
    pub key: String,
    pub children: Vec<Segment>,
    pub open_source: String,
    pub close_source: String,
    pub origin: Origin,
    pub(crate) hint: OnceCell<Hint>,
    literal: OnceCell<String>,
}

#[derive(Debug, Clone)]
pub struct ExtendSegment {
    pub key: String,
    /// The overriding sections supplied at the invocation site. Anything else
    /// inside an extend body is discarded at compile time.
    pub overrides: Vec<BlockSegment>,
    pub open_source: String,
    pub close_source: String,
    pub origin: Origin,
    pub(crate) resolved: OnceCell<Arc<Template>>,
    literal: OnceCell<String>,
}

#[derive(Debug, Clone)]
pub struct RootSegment {
    pub children: Vec<Segment>,
}

impl ValueSegment {
    pub fn new(key: String, unescape: bool, source: String, origin: Origin) -> Self {
        Self {
            key,
            unescape,
            source,
            origin,
            hint: OnceCell::new(),
        }
    }
}

impl PartialSegment {
    pub fn new(key: String, source: String, origin: Origin) -> Self {
        Self {
            key,
            indentation: None,
            source,
            origin,
            resolved: OnceCell::new(),
            indented: OnceCell::new(),
        }
    }
}

impl BlockSegment {
    pub fn new(
        key: String,
        children: Vec<Segment>,
        open_source: String,
        close_source: String,
        origin: Origin,
    ) -> Self {
        Self {
            key,
            children,
            open_source,
            close_source,
            origin,
            hint: OnceCell::new(),
            literal: OnceCell::new(),
        }
    }

    /// The block's reconstructed source text, open and close tags included.
    /// Computed once and cached; the compiler may populate the cache eagerly.
    pub fn literal(&self) -> &str {
        self.literal.get_or_init(|| {
            let mut out = String::from(&self.open_source);
            for child in &self.children {
                child.append_literal(&mut out);
            }
            out.push_str(&self.close_source);
            out
        })
    }
}

impl ExtendSegment {
    pub fn new(
        key: String,
        overrides: Vec<BlockSegment>,
        open_source: String,
        close_source: String,
        origin: Origin,
    ) -> Self {
        Self {
            key,
            overrides,
            open_source,
            close_source,
            origin,
            resolved: OnceCell::new(),
            literal: OnceCell::new(),
        }
    }

    pub fn literal(&self) -> &str {
        self.literal.get_or_init(|| {
            let mut out = String::from(&self.open_source);
            for section in &self.overrides {
                out.push_str(section.literal());
            }
            out.push_str(&self.close_source);
            out
        })
    }
}

impl Segment {
    /// Compile-order index from the segment's origin, if it has one.
    pub(crate) fn index(&self) -> Option<u32> {
        match self {
            Segment::Text(s) => s.origin.index,
            Segment::Value(s) => s.origin.index,
            Segment::Section(s) | Segment::InvertedSection(s) | Segment::ExtendSection(s) => {
                s.origin.index
            }
            Segment::Comment(s) => s.origin.index,
            Segment::SetDelimiters(s) => s.origin.index,
            Segment::LineSeparator(s) => s.origin.index,
            Segment::Partial(s) => s.origin.index,
            Segment::Extend(s) => s.origin.index,
            Segment::Root(_) => None,
        }
    }

    pub(crate) fn append_literal(&self, out: &mut String) {
        match self {
            Segment::Text(s) => out.push_str(&s.text),
            Segment::Value(s) => out.push_str(&s.source),
            Segment::Comment(s) => out.push_str(&s.source),
            Segment::SetDelimiters(s) => out.push_str(&s.source),
            Segment::LineSeparator(s) => out.push_str(s.text),
            Segment::Partial(s) => out.push_str(&s.source),
            Segment::Section(s) | Segment::InvertedSection(s) | Segment::ExtendSection(s) => {
                out.push_str(s.literal());
            }
            Segment::Extend(s) => out.push_str(s.literal()),
            Segment::Root(s) => {
                for child in &s.children {
                    child.append_literal(out);
                }
            }
        }
    }
}
