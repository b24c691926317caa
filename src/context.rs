use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::resolver::{Hint, ResolutionContext, ResolverChain};
use crate::segment::BlockSegment;
use crate::value::Value;

/// Metadata for the current section iteration: 1-based index, 0-based
/// position, first/last/has-next and parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationMeta {
    position: usize,
    length: usize,
}

impl IterationMeta {
    pub fn new(position: usize, length: usize) -> Self {
        Self { position, length }
    }

    pub fn index(&self) -> usize {
        self.position + 1
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_first(&self) -> bool {
        self.position == 0
    }

    pub fn is_last(&self) -> bool {
        self.index() == self.length
    }

    pub fn has_next(&self) -> bool {
        self.index() < self.length
    }

    pub fn is_odd(&self) -> bool {
        self.index() % 2 == 1
    }

    pub fn is_even(&self) -> bool {
        self.index() % 2 == 0
    }
}

/// Per-render state: the data-context stack and the template-invocation
/// stack, plus the defining-sections table maintained by extends.
///
/// A context belongs to exactly one render call and is never shared between
/// concurrent renders.
#[derive(Debug, Clone, Default)]
pub struct Context {
    stack: Vec<Value>,
    invocations: Vec<Arc<str>>,
    defining: Vec<(String, BlockSegment)>,
    active_overrides: HashSet<String>,
}

impl Context {
    pub fn new(root: Value) -> Self {
        Self {
            stack: vec![root],
            invocations: Vec::new(),
            defining: Vec::new(),
            active_overrides: HashSet::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.stack.pop()
    }

    /// Replace the frame at `index`; used to advance iteration metadata in
    /// place.
    pub(crate) fn replace(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.stack.get_mut(index) {
            *slot = value;
        }
    }

    pub(crate) fn push_invocation(&mut self, template: Arc<str>) {
        self.invocations.push(template);
    }

    pub(crate) fn pop_invocation(&mut self) {
        self.invocations.pop();
    }

    pub fn current_template(&self) -> Option<&str> {
        self.invocations.last().map(|name| name.as_ref())
    }

    /// Register the overriding sections of an extend invocation. A name that
    /// is already defined keeps its earlier (more derived) definition.
    /// Returns how many entries were added so the caller can unwind.
    pub(crate) fn register_defining(&mut self, sections: &[BlockSegment]) -> usize {
        let mut added = 0;
        for section in sections {
            if self.defining.iter().any(|(name, _)| *name == section.key) {
                continue;
            }
            self.defining.push((section.key.clone(), section.clone()));
            added += 1;
        }
        added
    }

    pub(crate) fn unwind_defining(&mut self, added: usize) {
        let len = self.defining.len().saturating_sub(added);
        self.defining.truncate(len);
    }

    pub(crate) fn find_defining(&self, name: &str) -> Option<BlockSegment> {
        self.defining
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, section)| section.clone())
    }

    /// Mark an override as being rendered so it is not consulted again from
    /// inside its own body. Returns false when already active.
    pub(crate) fn begin_override(&mut self, name: &str) -> bool {
        self.active_overrides.insert(name.to_string())
    }

    pub(crate) fn end_override(&mut self, name: &str) {
        self.active_overrides.remove(name);
    }

    /// Resolve a dot-separated key against the context stack.
    ///
    /// The first segment climbs the stack innermost-first through the
    /// resolver chain (with the tag's hint tried ahead of the chain on each
    /// frame); the remaining segments resolve against the previous value.
    pub(crate) fn lookup(
        &self,
        key: &str,
        chain: &ResolverChain,
        hint_cell: Option<&OnceCell<Hint>>,
        use_hints: bool,
    ) -> Option<Value> {
        let mut rctx = ResolutionContext::new();
        let parts: Vec<&str> = if key == "." {
            vec!["."]
        } else {
            key.split('.').collect()
        };

        let mut current = self.resolve_first(parts[0], chain, hint_cell, use_hints, &mut rctx)?;
        for part in &parts[1..] {
            let (value, _) = chain.resolve(Some(&current), part, &mut rctx)?;
            current = value;
        }
        Some(current)
    }

    fn resolve_first(
        &self,
        name: &str,
        chain: &ResolverChain,
        hint_cell: Option<&OnceCell<Hint>>,
        use_hints: bool,
        rctx: &mut ResolutionContext,
    ) -> Option<Value> {
        let hint = if use_hints {
            hint_cell.and_then(|cell| cell.get())
        } else {
            None
        };
        for frame in self.stack.iter().rev() {
            if let Some(hint) = hint {
                if let Some(value) = hint.resolve(frame, name) {
                    return Some(value);
                }
            }
            if let Some((value, fresh)) = chain.resolve(Some(frame), name, rctx) {
                if use_hints {
                    if let (Some(cell), Some(fresh)) = (hint_cell, fresh) {
                        let _ = cell.set(fresh);
                    }
                }
                return Some(value);
            }
        }
        // Final attempt without a context object, for resolvers that can
        // supply values of their own.
        chain.resolve(None, name, rctx).map(|(value, _)| value)
    }
}
