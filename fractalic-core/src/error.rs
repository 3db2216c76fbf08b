//! Error handling for the Fractalic engine

use thiserror::Error;

/// Result type alias for Fractalic operations
pub type Result<T> = std::result::Result<T, FractalicError>;

/// Main error type for the Fractalic engine
#[derive(Error, Debug)]
pub enum FractalicError {
    /// Malformed Markdown or YAML, unknown operation, invalid parameters
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Address resolution failed where a node was required
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    /// Source file for `@import` or `@run` is missing
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Tool returned non-JSON, exited non-zero, or exceeded its timeout
    #[error("Tool error: {0}")]
    Tool(String),

    /// Provider rejected the request or the transport failed after retries
    #[error("LLM error: {0}")]
    Llm(String),

    /// Shell command exited non-zero
    #[error("Shell error: {0}")]
    Shell(String),

    /// Operation aborted by timeout or external cancel
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A child `@run` failed; wraps the original error
    #[error("Child run failed ({file}): {source}")]
    ChildFailed {
        file: String,
        #[source]
        source: Box<FractalicError>,
    },

    /// Invariant violation; a bug in the engine
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FractalicError {
    /// Create a new parse error pinned to a source line
    pub fn parse<S: Into<String>>(line: usize, message: S) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    /// Create a new block-not-found error
    pub fn block_not_found<S: Into<String>>(path: S) -> Self {
        Self::BlockNotFound(path.into())
    }

    /// Create a new file-not-found error
    pub fn file_not_found<S: Into<String>>(path: S) -> Self {
        Self::FileNotFound(path.into())
    }

    /// Create a new tool error
    pub fn tool<S: Into<String>>(msg: S) -> Self {
        Self::Tool(msg.into())
    }

    /// Create a new LLM error
    pub fn llm<S: Into<String>>(msg: S) -> Self {
        Self::Llm(msg.into())
    }

    /// Create a new shell error
    pub fn shell<S: Into<String>>(msg: S) -> Self {
        Self::Shell(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a child run failure
    pub fn child_failed<S: Into<String>>(file: S, source: FractalicError) -> Self {
        Self::ChildFailed {
            file: file.into(),
            source: Box::new(source),
        }
    }

    /// The stable error kind name surfaced to callers (`<kind>: <message>`)
    pub fn kind(&self) -> &'static str {
        match self {
            FractalicError::Parse { .. } => "ParseError",
            FractalicError::BlockNotFound(_) => "BlockNotFound",
            FractalicError::FileNotFound(_) => "FileNotFound",
            FractalicError::Tool(_) => "ToolError",
            FractalicError::Llm(_) => "LLMError",
            FractalicError::Shell(_) => "ShellError",
            FractalicError::Cancelled(_) => "Cancelled",
            FractalicError::ChildFailed { .. } => "ChildFailed",
            FractalicError::Internal(_) => "Internal",
            FractalicError::Io(_) => "Internal",
            FractalicError::Json(_) => "Internal",
            FractalicError::Yaml(_) => "ParseError",
            FractalicError::Config(_) => "ParseError",
        }
    }

    /// Process exit code for the headless CLI
    ///
    /// 0 success, 1 parse/validation error, 2 runtime error, 3 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self.root_cause() {
            FractalicError::Parse { .. }
            | FractalicError::Yaml(_)
            | FractalicError::Config(_) => 1,
            FractalicError::Cancelled(_) => 3,
            _ => 2,
        }
    }

    /// Unwrap `ChildFailed` chains down to the originating error
    pub fn root_cause(&self) -> &FractalicError {
        match self {
            FractalicError::ChildFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(FractalicError::parse(3, "bad yaml").exit_code(), 1);
        assert_eq!(FractalicError::shell("exit 2").exit_code(), 2);
        assert_eq!(FractalicError::cancelled("timeout").exit_code(), 3);
    }

    #[test]
    fn test_child_failed_unwraps_to_root() {
        let inner = FractalicError::parse(1, "broken");
        let wrapped = FractalicError::child_failed(
            "b.md",
            FractalicError::child_failed("a.md", inner),
        );
        assert_eq!(wrapped.root_cause().kind(), "ParseError");
        assert_eq!(wrapped.exit_code(), 1);
        assert_eq!(wrapped.kind(), "ChildFailed");
    }

    #[test]
    fn test_display_includes_kind_context() {
        let err = FractalicError::block_not_found("intro/details");
        assert!(err.to_string().contains("intro/details"));
    }
}
