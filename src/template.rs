use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::OnceCell;

use crate::error::{FuyuzoraError, Result};
use crate::segment::{RootSegment, Segment};

/// A compiled template.
///
/// The root segment is attached exactly once when compilation finishes;
/// attaching a second root is an error. A sealed template is immutable and
/// safe to render from any number of threads concurrently.
pub struct Template {
    name: Arc<str>,
    root: OnceCell<Segment>,
}

impl Template {
    pub(crate) fn new(name: Arc<str>) -> Self {
        Self {
            name,
            root: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    /// Attach the compiled root, sealing the template.
    pub(crate) fn attach_root(&self, root: RootSegment) -> Result<()> {
        self.root
            .set(Segment::Root(root))
            .map_err(|_| FuyuzoraError::SealedTemplate {
                template: self.name.to_string(),
            })
    }

    /// The sealed root, or `None` for a template whose compilation never
    /// finished.
    pub fn root(&self) -> Option<&Segment> {
        self.root.get()
    }

    /// Reconstruct the template's source text from the segment tree.
    pub fn literal(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.root.get() {
            root.append_literal(&mut out);
        }
        out
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Template")
            .field("name", &self.name)
            .field("sealed", &self.root.get().is_some())
            .finish()
    }
}

/// Resolves partial and extend target names to compiled templates.
///
/// Template discovery (filesystem layouts, hot reload and the like) lives
/// behind this trait; the engine only ever asks for a name.
pub trait TemplateLocator: Send + Sync {
    fn locate(&self, name: &str) -> Option<Arc<Template>>;
}

/// A locator backed by an in-memory name map.
#[derive(Default)]
pub struct MapLocator {
    templates: RwLock<HashMap<String, Arc<Template>>>,
}

impl MapLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, template: Arc<Template>) {
        if let Ok(mut templates) = self.templates.write() {
            templates.insert(name.into(), template);
        }
    }
}

impl TemplateLocator for MapLocator {
    fn locate(&self, name: &str) -> Option<Arc<Template>> {
        self.templates
            .read()
            .ok()
            .and_then(|templates| templates.get(name).cloned())
    }
}
