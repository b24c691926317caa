use std::time::Duration;

use crate::delimiters::{DEFAULT_END, DEFAULT_START};

/// Engine configuration consumed by the compiler and the execution engine.
///
/// The defaults match conventional Mustache behavior: HTML escaping on,
/// standalone-line and redundant-segment clean-up on, soft misses render as
/// empty output.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Initial start delimiter for every compilation.
    pub start_delimiter: String,
    /// Initial end delimiter for every compilation.
    pub end_delimiter: String,
    /// Require tag names to match an identifier-like pattern.
    pub strict_tag_names: bool,
    /// HTML-escape interpolated values unless the tag opts out.
    pub escape_values: bool,
    /// Remove standalone tag lines after compilation.
    pub remove_standalone_lines: bool,
    /// Strip comment and set-delimiters segments after compilation.
    pub remove_redundant_segments: bool,
    /// Eagerly reconstruct and cache section literal blocks for lambdas.
    pub cache_literal_blocks: bool,
    /// Cache resolved partial and extend targets on their segments.
    pub cache_partials: bool,
    /// Treat an unresolved variable key as a render error.
    pub missing_is_error: bool,
    /// Keep a per-tag fast-path hint for value resolution.
    pub resolver_hints: bool,
    /// Upper bound on cached member-accessor entries.
    pub member_cache_capacity: usize,
    /// How long a join point waits for one deferred block.
    pub deferred_join_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_delimiter: DEFAULT_START.to_string(),
            end_delimiter: DEFAULT_END.to_string(),
            strict_tag_names: false,
            escape_values: true,
            remove_standalone_lines: true,
            remove_redundant_segments: true,
            cache_literal_blocks: false,
            cache_partials: true,
            missing_is_error: false,
            resolver_hints: true,
            member_cache_capacity: 1024,
            deferred_join_timeout: Duration::from_secs(60),
        }
    }
}
