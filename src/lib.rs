//! Fuyuzora - a Mustache-family template compiler and rendering engine
//!
//! Fuyuzora compiles template source text into an immutable segment tree and
//! renders that tree against hierarchical data, with:
//! - Safety-first design with HTML escaping by default
//! - Sections, inverted sections, comments and changeable delimiters
//! - Partials, template inheritance (extend / override sections) and lambdas
//! - A priority-ordered, extensible value-resolution chain
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//!
//! let result = fuyuzora::render(
//!     "Hello, {{name}}!",
//!     json!({"name": "World"}),
//! ).unwrap();
//!
//! assert_eq!(result, "Hello, World!");
//! ```

// Public modules - part of the API
pub mod compiler;
pub mod config;
pub mod context;
pub mod delimiters;
pub mod error;
pub mod helper;
pub mod lexer;
pub mod resolver;
pub mod segment;
pub mod tag;
pub mod template;
pub mod value;

// Internal implementation modules
mod deferred;
mod html_escape;
mod renderer;

pub use config::EngineConfig;
pub use context::IterationMeta;
pub use error::{FuyuzoraError, Location, Result};
pub use helper::{BlockHelper, HelperBlock};
pub use resolver::{CustomResolver, ResolutionContext, ResolverChain};
pub use template::{MapLocator, Template, TemplateLocator};
pub use value::{Lambda, LambdaKind, Value};

use std::collections::HashMap;
use std::sync::Arc;

use renderer::{RenderEnv, Renderer};

/// The template engine: configuration, resolver chain, helper registry and
/// template locator. Compiled templates are sealed and may be rendered from
/// any thread; the engine itself is cheap to share behind an `Arc`.
pub struct Fuyuzora {
    config: EngineConfig,
    chain: Arc<ResolverChain>,
    locator: Option<Arc<dyn TemplateLocator>>,
    helpers: Arc<HashMap<String, Arc<dyn BlockHelper>>>,
}

impl Default for Fuyuzora {
    fn default() -> Self {
        Self::new()
    }
}

impl Fuyuzora {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let chain = Arc::new(ResolverChain::new(config.member_cache_capacity));
        Self {
            config,
            chain,
            locator: None,
            helpers: Arc::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared resolver chain; custom resolvers and member accessors are
    /// registered here.
    pub fn resolvers(&self) -> &ResolverChain {
        &self.chain
    }

    /// Install the locator used to resolve partial and extend targets.
    pub fn set_locator(&mut self, locator: Arc<dyn TemplateLocator>) {
        self.locator = Some(locator);
    }

    /// Register a block helper under a section key.
    pub fn register_helper(&mut self, name: impl Into<String>, helper: Arc<dyn BlockHelper>) {
        let mut helpers = (*self.helpers).clone();
        helpers.insert(name.into(), helper);
        self.helpers = Arc::new(helpers);
    }

    /// Compile a template source string into a sealed template.
    ///
    /// # Example
    ///
    /// ```rust
    /// use serde_json::json;
    ///
    /// let engine = fuyuzora::Fuyuzora::new();
    /// let tmpl = engine.compile("greeting", "Hello, {{name}}!").unwrap();
    /// assert_eq!(engine.render_json(&tmpl, json!({"name": "Alice"})).unwrap(), "Hello, Alice!");
    /// assert_eq!(engine.render_json(&tmpl, json!({"name": "Bob"})).unwrap(), "Hello, Bob!");
    /// ```
    pub fn compile(&self, name: &str, source: &str) -> Result<Arc<Template>> {
        compiler::compile_str(name, source, &self.config)
    }

    /// Render a compiled template against the given data.
    pub fn render(&self, template: &Template, data: Value) -> Result<String> {
        self.renderer().render_template(template, data)
    }

    /// Render a compiled template against JSON data.
    pub fn render_json(&self, template: &Template, data: serde_json::Value) -> Result<String> {
        self.render(template, Value::from_json(data)?)
    }

    /// Render into any character sink.
    pub fn render_to(
        &self,
        template: &Template,
        data: Value,
        sink: &mut dyn std::fmt::Write,
    ) -> Result<()> {
        let output = self.render(template, data)?;
        sink.write_str(&output)?;
        Ok(())
    }

    fn renderer(&self) -> Renderer {
        Renderer::new(RenderEnv {
            config: self.config.clone(),
            chain: self.chain.clone(),
            locator: self.locator.clone(),
            helpers: self.helpers.clone(),
        })
    }
}

/// Convenience function: compile and render in one call
///
/// # Example
///
/// ```rust
/// use serde_json::json;
///
/// let result = fuyuzora::render(
///     "Hello, {{name}}!",
///     json!({"name": "World"}),
/// ).unwrap();
///
/// assert_eq!(result, "Hello, World!");
/// ```
pub fn render(source: &str, data: serde_json::Value) -> Result<String> {
    let engine = Fuyuzora::new();
    let template = engine.compile("main", source)?;
    engine.render_json(&template, data)
}
