use thiserror::Error;

use crate::segment::Origin;

/// Source location for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// All errors that can occur in Fuyuzora
#[derive(Error, Debug)]
pub enum FuyuzoraError {
    #[error("Unterminated tag in template '{template}' at {location}")]
    UnterminatedTag { template: String, location: Location },

    #[error("Empty tag in template '{template}' at {location}")]
    EmptyTag { template: String, location: Location },

    #[error("Invalid tag name '{name}' in template '{template}' at {location}")]
    InvalidTagName {
        name: String,
        template: String,
        location: Location,
    },

    #[error("Section end '{found}' does not match open section '{expected}' in template '{template}' at {location}")]
    MismatchedSectionEnd {
        expected: String,
        found: String,
        template: String,
        location: Location,
    },

    #[error("Section end '{key}' without a matching open section in template '{template}' at {location}")]
    UnexpectedSectionEnd {
        key: String,
        template: String,
        location: Location,
    },

    #[error("Malformed set-delimiters tag '{content}' in template '{template}' at {location}")]
    MalformedSetDelimiters {
        content: String,
        template: String,
        location: Location,
    },

    #[error("Section '{key}' is not closed at the end of template '{template}'")]
    UnbalancedSections { key: String, template: String },

    #[error("Template '{template}' is already sealed")]
    SealedTemplate { template: String },

    #[error("Invalid delimiters: {message}")]
    InvalidDelimiters { message: String },

    #[error("No value for '{key}' ({origin})")]
    MissingValue { key: String, origin: Origin },

    #[error("Unknown partial '{name}' ({origin})")]
    UnknownPartial { name: String, origin: Origin },

    #[error("Unbalanced helper push/pop on the context stack in helper '{helper}'")]
    HelperStackDiscipline { helper: String },

    #[error("Deferred block '{label}' failed: {message}")]
    DeferredJoin { label: String, message: String },

    #[error("Type error: {message}")]
    TypeError { message: String },

    #[error("Write error: {0}")]
    WriteError(#[from] std::fmt::Error),
}

/// Result type alias for Fuyuzora operations
pub type Result<T> = std::result::Result<T, FuyuzoraError>;
