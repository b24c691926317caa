use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::EngineConfig;
use crate::delimiters::Delimiters;
use crate::error::{FuyuzoraError, Result};
use crate::lexer::Lexer;
use crate::segment::{
    BlockSegment, CommentSegment, ExtendSegment, LineSeparatorSegment, Origin, PartialSegment,
    RootSegment, Segment, SetDelimitersSegment, TextSegment, ValueSegment,
};
use crate::tag::{ParsedTag, TagKind};
use crate::template::Template;

/// The event boundary between the tokenizer and the compiler.
pub trait CompilerSink {
    fn start_template(&mut self) -> Result<()>;
    fn text(&mut self, text: &str) -> Result<()>;
    fn tag(&mut self, tag: ParsedTag) -> Result<()>;
    fn line_separator(&mut self, separator: &'static str) -> Result<()>;
    fn end_template(&mut self) -> Result<()>;
}

static TAG_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\.|[A-Za-z_][A-Za-z0-9_./-]*)$").expect("tag name pattern is valid")
});

/// Compile a single source string into a sealed template.
pub(crate) fn compile_str(
    name: &str,
    source: &str,
    config: &EngineConfig,
) -> Result<Arc<Template>> {
    let mut compiler = Compiler::new(name, config.clone())?;
    let delimiters = compiler.delimiters_cell();
    Lexer::new(name, source, delimiters).run(&mut compiler)?;
    compiler.compiled_result()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuilderKind {
    Root,
    Section,
    Inverted,
    Extend,
    ExtendSection,
}

/// Mutable container on the open stack, turned into an immutable segment on
/// pop. Children are owned by value; there is no parent back-reference.
struct BlockBuilder {
    kind: BuilderKind,
    key: String,
    open_source: String,
    origin: Origin,
    children: Vec<Segment>,
}

impl BlockBuilder {
    fn into_segment(self, close_source: String) -> Segment {
        match self.kind {
            BuilderKind::Section => Segment::Section(BlockSegment::new(
                self.key,
                self.children,
                self.open_source,
                close_source,
                self.origin,
            )),
            BuilderKind::Inverted => Segment::InvertedSection(BlockSegment::new(
                self.key,
                self.children,
                self.open_source,
                close_source,
                self.origin,
            )),
            BuilderKind::ExtendSection => Segment::ExtendSection(BlockSegment::new(
                self.key,
                self.children,
                self.open_source,
                close_source,
                self.origin,
            )),
            BuilderKind::Extend => {
                // Only overriding sections matter inside an extend body.
                let overrides = self
                    .children
                    .into_iter()
                    .filter_map(|child| match child {
                        Segment::ExtendSection(block) => Some(block),
                        _ => None,
                    })
                    .collect();
                Segment::Extend(ExtendSegment::new(
                    self.key,
                    overrides,
                    self.open_source,
                    close_source,
                    self.origin,
                ))
            }
            BuilderKind::Root => Segment::Root(RootSegment {
                children: self.children,
            }),
        }
    }
}

/// Consumes parse events and builds the segment tree, then runs the
/// post-processing passes and seals the result.
pub struct Compiler {
    name: Arc<str>,
    config: EngineConfig,
    delimiters: Rc<RefCell<Delimiters>>,
    stack: Vec<BlockBuilder>,
    line: u32,
    next_index: u32,
    result: Option<RootSegment>,
}

impl Compiler {
    pub fn new(name: &str, config: EngineConfig) -> Result<Self> {
        let delimiters = Delimiters::new(&config.start_delimiter, &config.end_delimiter)?;
        Ok(Self {
            name: Arc::from(name),
            config,
            delimiters: Rc::new(RefCell::new(delimiters)),
            stack: Vec::new(),
            line: 1,
            next_index: 0,
            result: None,
        })
    }

    /// The delimiter cell shared with the tokenizer.
    pub fn delimiters_cell(&self) -> Rc<RefCell<Delimiters>> {
        self.delimiters.clone()
    }

    /// The sealed template. Valid once `end_template` has been received.
    pub fn compiled_result(self) -> Result<Arc<Template>> {
        let Self {
            name,
            stack,
            result,
            ..
        } = self;
        let Some(root) = result else {
            return Err(FuyuzoraError::UnbalancedSections {
                key: stack.last().map(|b| b.key.clone()).unwrap_or_default(),
                template: name.to_string(),
            });
        };
        let template = Template::new(name);
        template.attach_root(root)?;
        Ok(Arc::new(template))
    }

    fn next_origin(&mut self) -> Origin {
        let origin = Origin::new(self.name.clone(), self.line, self.next_index);
        self.next_index += 1;
        origin
    }

    fn append(&mut self, segment: Segment) {
        if let Some(top) = self.stack.last_mut() {
            top.children.push(segment);
        }
    }

    fn push_container(&mut self, kind: BuilderKind, tag: &ParsedTag) {
        let origin = self.next_origin();
        self.stack.push(BlockBuilder {
            kind,
            key: tag.content.clone(),
            open_source: tag.source.clone(),
            origin,
            children: Vec::new(),
        });
    }

    fn validate_content(&self, tag: &ParsedTag) -> Result<()> {
        if tag.content.is_empty() {
            return Err(FuyuzoraError::EmptyTag {
                template: self.name.to_string(),
                location: tag.location,
            });
        }
        let named = matches!(
            tag.kind,
            TagKind::Variable
                | TagKind::UnescapedVariable
                | TagKind::Section
                | TagKind::InvertedSection
                | TagKind::SectionEnd
                | TagKind::Partial
                | TagKind::Extend
                | TagKind::ExtendSection
        );
        if self.config.strict_tag_names && named && !TAG_NAME.is_match(&tag.content) {
            return Err(FuyuzoraError::InvalidTagName {
                name: tag.content.clone(),
                template: self.name.to_string(),
                location: tag.location,
            });
        }
        Ok(())
    }

    fn close_container(&mut self, tag: ParsedTag) -> Result<()> {
        let builder = match self.stack.pop() {
            Some(builder) if builder.kind != BuilderKind::Root => builder,
            other => {
                if let Some(root) = other {
                    self.stack.push(root);
                }
                return Err(FuyuzoraError::UnexpectedSectionEnd {
                    key: tag.content,
                    template: self.name.to_string(),
                    location: tag.location,
                });
            }
        };

        let matched = match builder.kind {
            BuilderKind::Section | BuilderKind::Inverted => tag.content == builder.key,
            // Extend-style closers also accept the open key as a prefix of
            // the closing content when strict validation is off.
            BuilderKind::Extend | BuilderKind::ExtendSection => {
                tag.content == builder.key
                    || (!self.config.strict_tag_names && tag.content.starts_with(&builder.key))
            }
            BuilderKind::Root => false,
        };
        if !matched {
            return Err(FuyuzoraError::MismatchedSectionEnd {
                expected: builder.key,
                found: tag.content,
                template: self.name.to_string(),
                location: tag.location,
            });
        }

        let segment = builder.into_segment(tag.source);
        self.append(segment);
        Ok(())
    }

    fn set_delimiters(&mut self, tag: ParsedTag) -> Result<()> {
        let Some((start, end)) = Delimiters::parse_pair(&tag.content) else {
            return Err(FuyuzoraError::MalformedSetDelimiters {
                content: tag.content,
                template: self.name.to_string(),
                location: tag.location,
            });
        };
        self.delimiters.borrow_mut().set(&start, &end)?;
        log::debug!(
            "template '{}': delimiters changed to '{}' '{}'",
            self.name,
            start,
            end
        );
        let origin = self.next_origin();
        self.append(Segment::SetDelimiters(SetDelimitersSegment {
            source: tag.source,
            origin,
        }));
        Ok(())
    }

    fn run_passes(&self, root: &mut RootSegment) {
        if self.config.remove_standalone_lines {
            let mut pass = StandalonePass::default();
            pass.collect(&root.children);
            pass.flush();
            pass.apply(&mut root.children);
        }
        if self.config.remove_redundant_segments {
            strip_redundant(&mut root.children);
        }
        let mut interned = HashMap::new();
        intern_separators(&mut root.children, &mut interned, &self.name);
        if self.config.cache_literal_blocks {
            cache_literals(&root.children);
        }
    }
}

impl CompilerSink for Compiler {
    fn start_template(&mut self) -> Result<()> {
        self.stack.clear();
        self.line = 1;
        self.next_index = 0;
        self.result = None;
        self.stack.push(BlockBuilder {
            kind: BuilderKind::Root,
            key: String::new(),
            open_source: String::new(),
            origin: Origin::synthetic(self.name.clone()),
            children: Vec::new(),
        });
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<()> {
        let origin = self.next_origin();
        self.append(Segment::Text(TextSegment {
            text: text.to_string(),
            origin,
        }));
        Ok(())
    }

    fn tag(&mut self, tag: ParsedTag) -> Result<()> {
        self.validate_content(&tag)?;
        match tag.kind {
            TagKind::Variable | TagKind::UnescapedVariable => {
                let unescape = tag.kind == TagKind::UnescapedVariable;
                let origin = self.next_origin();
                self.append(Segment::Value(ValueSegment::new(
                    tag.content,
                    unescape,
                    tag.source,
                    origin,
                )));
                Ok(())
            }
            TagKind::Comment => {
                let origin = self.next_origin();
                self.append(Segment::Comment(CommentSegment {
                    source: tag.source,
                    origin,
                }));
                Ok(())
            }
            TagKind::SetDelimiters => self.set_delimiters(tag),
            TagKind::Partial => {
                let origin = self.next_origin();
                self.append(Segment::Partial(PartialSegment::new(
                    tag.content,
                    tag.source,
                    origin,
                )));
                Ok(())
            }
            TagKind::Section => {
                self.push_container(BuilderKind::Section, &tag);
                Ok(())
            }
            TagKind::InvertedSection => {
                self.push_container(BuilderKind::Inverted, &tag);
                Ok(())
            }
            TagKind::Extend => {
                self.push_container(BuilderKind::Extend, &tag);
                Ok(())
            }
            TagKind::ExtendSection => {
                self.push_container(BuilderKind::ExtendSection, &tag);
                Ok(())
            }
            TagKind::SectionEnd => self.close_container(tag),
        }
    }

    fn line_separator(&mut self, separator: &'static str) -> Result<()> {
        let origin = self.next_origin();
        self.append(Segment::LineSeparator(Arc::new(LineSeparatorSegment {
            text: separator,
            origin,
        })));
        self.line += 1;
        Ok(())
    }

    fn end_template(&mut self) -> Result<()> {
        if self.stack.len() != 1 {
            let key = self.stack.last().map(|b| b.key.clone()).unwrap_or_default();
            return Err(FuyuzoraError::UnbalancedSections {
                key,
                template: self.name.to_string(),
            });
        }
        let Some(builder) = self.stack.pop() else {
            return Ok(());
        };
        let mut root = RootSegment {
            children: builder.children,
        };
        self.run_passes(&mut root);
        self.result = Some(root);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryClass {
    /// Text leaf consisting only of spaces and tabs.
    Whitespace,
    /// Text leaf with at least one non-whitespace character.
    Solid,
    Value,
    Separator,
    Comment,
    SetDelimiters,
    Partial,
    /// Pseudo-token for a section or inverted-section bracket.
    SectionMark,
    /// Pseudo-token for an extend-style bracket; keeps the line intact.
    NeutralMark,
}

struct LineEntry {
    id: Option<u32>,
    class: EntryClass,
    text: Option<String>,
}

/// Standalone-line removal.
///
/// Reconstructs lines across container boundaries (containers bracket as
/// pseudo-tokens within their parent's line), then deletes the whitespace and
/// separator leaves of every line that holds only removable tags. A partial
/// on such a line keeps the line's leading whitespace as its indentation.
#[derive(Default)]
struct StandalonePass {
    delete: HashSet<u32>,
    indents: HashMap<u32, String>,
    current: Vec<LineEntry>,
}

impl StandalonePass {
    fn collect(&mut self, children: &[Segment]) {
        for child in children {
            match child {
                Segment::Text(s) => {
                    let blank = s.text.chars().all(|c| c == ' ' || c == '\t');
                    self.current.push(LineEntry {
                        id: s.origin.index,
                        class: if blank {
                            EntryClass::Whitespace
                        } else {
                            EntryClass::Solid
                        },
                        text: blank.then(|| s.text.clone()),
                    });
                }
                Segment::Value(s) => self.push_mark(s.origin.index, EntryClass::Value),
                Segment::Comment(s) => self.push_mark(s.origin.index, EntryClass::Comment),
                Segment::SetDelimiters(s) => {
                    self.push_mark(s.origin.index, EntryClass::SetDelimiters)
                }
                Segment::Partial(s) => self.push_mark(s.origin.index, EntryClass::Partial),
                Segment::LineSeparator(s) => {
                    self.push_mark(s.origin.index, EntryClass::Separator);
                    self.flush();
                }
                Segment::Section(b) | Segment::InvertedSection(b) => {
                    self.push_mark(None, EntryClass::SectionMark);
                    self.collect(&b.children);
                    self.push_mark(None, EntryClass::SectionMark);
                }
                Segment::ExtendSection(b) => {
                    self.push_mark(None, EntryClass::NeutralMark);
                    self.collect(&b.children);
                    self.push_mark(None, EntryClass::NeutralMark);
                }
                Segment::Extend(e) => {
                    self.push_mark(None, EntryClass::NeutralMark);
                    for section in &e.overrides {
                        self.push_mark(None, EntryClass::NeutralMark);
                        self.collect(&section.children);
                        self.push_mark(None, EntryClass::NeutralMark);
                    }
                    self.push_mark(None, EntryClass::NeutralMark);
                }
                Segment::Root(r) => self.collect(&r.children),
            }
        }
    }

    fn push_mark(&mut self, id: Option<u32>, class: EntryClass) {
        self.current.push(LineEntry {
            id,
            class,
            text: None,
        });
    }

    fn flush(&mut self) {
        let line = std::mem::take(&mut self.current);
        let standalone = line.iter().all(|e| {
            !matches!(e.class, EntryClass::Solid | EntryClass::Value)
        }) && line.iter().any(|e| {
            matches!(
                e.class,
                EntryClass::Comment
                    | EntryClass::SetDelimiters
                    | EntryClass::Partial
                    | EntryClass::SectionMark
            )
        });
        if !standalone {
            return;
        }
        let mut leading = String::new();
        for entry in &line {
            match entry.class {
                EntryClass::Whitespace | EntryClass::Separator => {
                    if let Some(id) = entry.id {
                        self.delete.insert(id);
                    }
                    if entry.class == EntryClass::Whitespace {
                        if let Some(text) = &entry.text {
                            leading.push_str(text);
                        }
                    }
                }
                EntryClass::Partial => {
                    if let Some(id) = entry.id {
                        if !leading.is_empty() {
                            self.indents.insert(id, leading.clone());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn apply(&self, children: &mut Vec<Segment>) {
        children.retain(|child| match child.index() {
            Some(id) => !self.delete.contains(&id),
            None => true,
        });
        for child in children.iter_mut() {
            match child {
                Segment::Section(b) | Segment::InvertedSection(b) | Segment::ExtendSection(b) => {
                    self.apply(&mut b.children);
                }
                Segment::Extend(e) => {
                    for section in &mut e.overrides {
                        self.apply(&mut section.children);
                    }
                }
                Segment::Partial(p) => {
                    if let Some(id) = p.origin.index {
                        if let Some(indent) = self.indents.get(&id) {
                            p.indentation = Some(indent.clone());
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Strip comment and set-delimiters leaves; they only exist for the
/// standalone pass's bookkeeping.
fn strip_redundant(children: &mut Vec<Segment>) {
    children.retain(|child| {
        !matches!(child, Segment::Comment(_) | Segment::SetDelimiters(_))
    });
    for child in children.iter_mut() {
        match child {
            Segment::Section(b) | Segment::InvertedSection(b) | Segment::ExtendSection(b) => {
                strip_redundant(&mut b.children);
            }
            Segment::Extend(e) => {
                for section in &mut e.overrides {
                    strip_redundant(&mut section.children);
                }
            }
            _ => {}
        }
    }
}

/// Share one separator segment per distinct separator text.
fn intern_separators(
    children: &mut Vec<Segment>,
    interned: &mut HashMap<&'static str, Arc<LineSeparatorSegment>>,
    template: &Arc<str>,
) {
    for child in children.iter_mut() {
        match child {
            Segment::LineSeparator(sep) => {
                let canonical = interned
                    .entry(sep.text)
                    .or_insert_with(|| {
                        Arc::new(LineSeparatorSegment {
                            text: sep.text,
                            origin: Origin::synthetic(template.clone()),
                        })
                    })
                    .clone();
                *child = Segment::LineSeparator(canonical);
            }
            Segment::Section(b) | Segment::InvertedSection(b) | Segment::ExtendSection(b) => {
                intern_separators(&mut b.children, interned, template);
            }
            Segment::Extend(e) => {
                for section in &mut e.overrides {
                    intern_separators(&mut section.children, interned, template);
                }
            }
            _ => {}
        }
    }
}

/// Eagerly reconstruct literal blocks so lambdas never pay per invocation.
fn cache_literals(children: &[Segment]) {
    for child in children {
        match child {
            Segment::Section(b) | Segment::InvertedSection(b) | Segment::ExtendSection(b) => {
                b.literal();
                cache_literals(&b.children);
            }
            Segment::Extend(e) => {
                e.literal();
                for section in &e.overrides {
                    section.literal();
                    cache_literals(&section.children);
                }
            }
            _ => {}
        }
    }
}
