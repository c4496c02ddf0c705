//! Error types for jsbridge-core
//!
//! Every failure that reaches host code is an [`Error`]. Script and runtime
//! failures carry an [`ErrorRecord`]; [`ErrorTranslator`] builds those
//! records from the runtime's raw [`NativeError`] vocabulary.

use std::fmt::{self, Write};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::{NativeError, ScriptRuntime, ScriptValue, ScriptValueType, SourceLocation};

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The script could not be parsed.
    Compilation,
    /// The script threw, or a host-side lookup failed during execution.
    Runtime,
    /// Execution was aborted by [`ScriptEngine::interrupt`](crate::ScriptEngine::interrupt).
    Interrupted,
    /// The runtime itself is unusable.
    Fatal,
    /// The caller passed invalid arguments or used a disposed engine.
    Usage,
}

impl ErrorCategory {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Compilation => "compilation",
            Self::Runtime => "runtime",
            Self::Interrupted => "interrupted",
            Self::Fatal => "fatal",
            Self::Usage => "usage",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One parsed frame of a script call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStackFrame {
    pub function_name: String,
    pub document_name: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for CallStackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.function_name.is_empty() {
            write!(
                f,
                "   at ({}:{}:{})",
                self.document_name, self.line, self.column
            )
        } else {
            write!(
                f,
                "   at {} ({}:{}:{})",
                self.function_name, self.document_name, self.line, self.column
            )
        }
    }
}

/// Structured description of a script or engine failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    /// Script-side error type name (`TypeError`, `SyntaxError`, ...).
    pub error_type: String,
    /// The script-side message, or the host-side description.
    pub description: String,
    /// Category message with the script message appended.
    pub message: String,
    #[serde(default)]
    pub document_name: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(default)]
    pub source_fragment: String,
    /// Normalized call stack, one `   at fn (doc:line:col)` line per frame.
    #[serde(default)]
    pub call_stack: String,
    #[serde(default)]
    pub frames: Vec<CallStackFrame>,
}

impl ErrorRecord {
    /// A record that carries only a message (no script location).
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            category,
            error_type: error_type.into(),
            description: message.clone(),
            message,
            document_name: String::new(),
            line: 0,
            column: 0,
            source_fragment: String::new(),
            call_stack: String::new(),
            frames: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_location(mut self, location: &SourceLocation) -> Self {
        self.document_name.clone_from(&location.document_name);
        self.line = location.line;
        self.column = location.column;
        self.source_fragment.clone_from(&location.source_fragment);
        self
    }

    #[must_use]
    pub fn has_location(&self) -> bool {
        !self.document_name.is_empty() && self.line > 0
    }

    /// Multi-line rendering: message, then the call stack or the location.
    #[must_use]
    pub fn render(&self) -> String {
        let mut output = self.message.clone();
        if !self.call_stack.is_empty() {
            let _ = write!(output, "\n{}", self.call_stack);
        } else if self.has_location() {
            let _ = write!(
                output,
                "\n   at {}:{}:{}",
                self.document_name, self.line, self.column
            );
            if !self.source_fragment.is_empty() {
                let _ = write!(output, " -> {}", self.source_fragment);
            }
        }
        output
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Main error type for jsbridge-core
#[derive(Error, Debug)]
pub enum Error {
    /// Script compilation (parse) errors
    #[error("{0}")]
    Compilation(Box<ErrorRecord>),

    /// Errors thrown while a script was running
    #[error("{0}")]
    Runtime(Box<ErrorRecord>),

    /// Execution aborted on request
    #[error("{0}")]
    Interrupted(Box<ErrorRecord>),

    /// The runtime is in an unrecoverable state
    #[error("{0}")]
    Fatal(Box<ErrorRecord>),

    /// Invalid arguments from the host
    #[error("{0}")]
    Usage(Box<ErrorRecord>),

    /// Operation on a disposed engine or dispatcher
    #[error("Script engine has been disposed")]
    Disposed,

    /// The backend could not be created
    #[error("Failed to load script engine: {0}")]
    EngineLoad(String),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// A Usage-category error carrying `message`.
    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage(Box::new(ErrorRecord::new(
            ErrorCategory::Usage,
            "UsageError",
            message,
        )))
    }

    /// Wrap a record in the variant that matches its category.
    #[must_use]
    pub fn from_record(record: ErrorRecord) -> Self {
        let record = Box::new(record);
        match record.category {
            ErrorCategory::Compilation => Self::Compilation(record),
            ErrorCategory::Runtime => Self::Runtime(record),
            ErrorCategory::Interrupted => Self::Interrupted(record),
            ErrorCategory::Fatal => Self::Fatal(record),
            ErrorCategory::Usage => Self::Usage(record),
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Compilation(_) => ErrorCategory::Compilation,
            Self::Runtime(_) => ErrorCategory::Runtime,
            Self::Interrupted(_) => ErrorCategory::Interrupted,
            Self::Fatal(_) | Self::EngineLoad(_) => ErrorCategory::Fatal,
            Self::Usage(_) | Self::Disposed | Self::Config(_) => ErrorCategory::Usage,
        }
    }

    #[must_use]
    pub fn record(&self) -> Option<&ErrorRecord> {
        match self {
            Self::Compilation(record)
            | Self::Runtime(record)
            | Self::Interrupted(record)
            | Self::Fatal(record)
            | Self::Usage(record) => Some(record),
            Self::Disposed | Self::EngineLoad(_) | Self::Config(_) => None,
        }
    }

    /// Whether the engine stays usable after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Fatal(_) | Self::Disposed | Self::EngineLoad(_)
        )
    }

    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Self::Compilation(_) => Some("Fix the syntax error at the reported location."),
            Self::Interrupted(_) => Some(
                "The engine is still usable; rerun the script if the interrupt was unexpected.",
            ),
            Self::Fatal(_) | Self::EngineLoad(_) => {
                Some("Dispose the engine and create a new one; the runtime cannot continue.")
            }
            Self::Disposed => Some("Create a new engine; disposed engines reject all operations."),
            Self::Config(_) => Some("Check the [engine] section of the configuration file."),
            Self::Runtime(_) | Self::Usage(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// `at fn (doc:line:col)` or `at (doc:line:col)`; the document name may
/// itself contain spaces and colons.
static FRAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at (?:(?P<func>[^()]*?) )?\((?P<doc>.*):(?P<line>\d+):(?P<col>\d+)\)\s*$")
        .unwrap()
});

/// Converts [`NativeError`]s into host [`Error`]s.
pub struct ErrorTranslator;

impl ErrorTranslator {
    /// Translate a runtime error. For thrown script errors the runtime is
    /// queried for `name`, `message` and `stack`.
    pub fn translate(runtime: &mut dyn ScriptRuntime, error: NativeError) -> Error {
        let record = match &error {
            NativeError::Syntax { message, location } => {
                let mut record = ErrorRecord::new(
                    ErrorCategory::Compilation,
                    "SyntaxError",
                    error.to_string(),
                )
                .with_location(location);
                record.description.clone_from(message);
                record
            }
            NativeError::Exception {
                exception,
                location,
            } => Self::exception_record(runtime, &error, *exception, location.as_ref()),
            NativeError::Interrupted => ErrorRecord::new(
                ErrorCategory::Interrupted,
                "InterruptedError",
                error.to_string(),
            ),
            NativeError::EngineFailure(_) => {
                ErrorRecord::new(ErrorCategory::Fatal, "EngineError", error.to_string())
            }
            NativeError::InvalidUsage(_) => {
                ErrorRecord::new(ErrorCategory::Usage, "UsageError", error.to_string())
            }
            NativeError::MissingMember { .. } | NativeError::TypeMismatch(_) => {
                ErrorRecord::new(ErrorCategory::Runtime, "TypeError", error.to_string())
            }
            NativeError::MissingProperty { .. } | NativeError::MissingVariable(_) => {
                ErrorRecord::new(ErrorCategory::Runtime, "ReferenceError", error.to_string())
            }
            NativeError::Host(_) => {
                ErrorRecord::new(ErrorCategory::Runtime, "Error", error.to_string())
            }
        };
        tracing::debug!(
            category = %record.category,
            error_type = %record.error_type,
            "translated script error"
        );
        Error::from_record(record)
    }

    fn exception_record(
        runtime: &mut dyn ScriptRuntime,
        error: &NativeError,
        exception: ScriptValue,
        location: Option<&SourceLocation>,
    ) -> ErrorRecord {
        let mut error_type = String::from("Error");
        let mut description = String::new();
        let mut stack = String::new();

        let is_object = runtime.value_type(exception).is_ok_and(|t| !t.is_primitive());
        if is_object {
            if let Some(name) = read_string_property(runtime, exception, "name") {
                error_type = name;
            }
            if let Some(message) = read_string_property(runtime, exception, "message") {
                description = message;
            }
            if let Some(text) = read_string_property(runtime, exception, "stack") {
                stack = text;
            }
        }
        if description.is_empty() {
            description = runtime.to_string_value(exception).unwrap_or_default();
        }

        let message = if description.is_empty() {
            error.to_string()
        } else {
            format!("{error}: {description}")
        };
        let mut record = ErrorRecord::new(ErrorCategory::Runtime, error_type, message);
        record.description = description;
        if let Some(location) = location {
            record = record.with_location(location);
        }

        let frames = Self::parse_call_stack(&stack);
        if let Some(top) = frames.first() {
            if !record.has_location() {
                record.document_name.clone_from(&top.document_name);
                record.line = top.line;
                record.column = top.column;
            }
        }
        record.call_stack = Self::format_call_stack(&frames);
        record.frames = frames;
        record
    }

    /// Extract the frames of a script `stack` string. Lines that are not
    /// frames (the leading `Name: message` line) are skipped.
    #[must_use]
    pub fn parse_call_stack(stack: &str) -> Vec<CallStackFrame> {
        stack
            .lines()
            .filter_map(|line| {
                let caps = FRAME_PATTERN.captures(line)?;
                Some(CallStackFrame {
                    function_name: caps
                        .name("func")
                        .map_or_else(String::new, |m| m.as_str().trim().to_string()),
                    document_name: caps["doc"].to_string(),
                    line: caps["line"].parse().ok()?,
                    column: caps["col"].parse().ok()?,
                })
            })
            .collect()
    }

    #[must_use]
    pub fn format_call_stack(frames: &[CallStackFrame]) -> String {
        frames
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn read_string_property(
    runtime: &mut dyn ScriptRuntime,
    object: ScriptValue,
    name: &str,
) -> Option<String> {
    let value = runtime.get_property(object, name).ok()?;
    match runtime.value_type(value).ok()? {
        ScriptValueType::Undefined | ScriptValueType::Null => None,
        _ => runtime.to_string_value(value).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ── categories ───────────────────────────────────────────

    #[test]
    fn category_of_each_variant() {
        let record = |c| Box::new(ErrorRecord::new(c, "Error", "x"));
        assert_eq!(
            Error::Compilation(record(ErrorCategory::Compilation)).category(),
            ErrorCategory::Compilation
        );
        assert_eq!(Error::Disposed.category(), ErrorCategory::Usage);
        assert_eq!(Error::Config("bad".into()).category(), ErrorCategory::Usage);
        assert_eq!(Error::EngineLoad("x".into()).category(), ErrorCategory::Fatal);
    }

    #[test]
    fn from_record_picks_variant_by_category() {
        let err = Error::from_record(ErrorRecord::new(ErrorCategory::Interrupted, "E", "stop"));
        assert!(matches!(err, Error::Interrupted(_)));
        assert!(err.is_recoverable());

        let err = Error::from_record(ErrorRecord::new(ErrorCategory::Fatal, "E", "dead"));
        assert!(matches!(err, Error::Fatal(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn usage_helper_sets_record() {
        let err = Error::usage("bad name");
        let record = err.record().expect("usage carries a record");
        assert_eq!(record.category, ErrorCategory::Usage);
        assert_eq!(record.message, "bad name");
        assert_eq!(err.to_string(), "bad name");
    }

    #[test]
    fn remediation_present_for_fatal_and_disposed() {
        assert!(Error::Disposed.remediation().is_some());
        assert!(Error::EngineLoad("x".into()).remediation().is_some());
        assert!(Error::usage("x").remediation().is_none());
    }

    // ── rendering ────────────────────────────────────────────

    #[test]
    fn render_prefers_call_stack_over_location() {
        let mut record = ErrorRecord::new(ErrorCategory::Runtime, "Error", "boom");
        record.document_name = "doc".into();
        record.line = 3;
        record.column = 7;
        assert_eq!(record.render(), "boom\n   at doc:3:7");

        record.call_stack = "   at f (doc:3:7)".into();
        assert_eq!(record.render(), "boom\n   at f (doc:3:7)");
    }

    #[test]
    fn render_appends_source_fragment() {
        let record = ErrorRecord::new(ErrorCategory::Compilation, "SyntaxError", "bad")
            .with_location(&SourceLocation {
                document_name: "a.js".into(),
                line: 1,
                column: 5,
                source_fragment: "var = 1".into(),
            });
        assert_eq!(record.render(), "bad\n   at a.js:1:5 -> var = 1");
    }

    #[test]
    fn record_serde_roundtrip() {
        let mut record = ErrorRecord::new(ErrorCategory::Runtime, "TypeError", "nope");
        record.frames.push(CallStackFrame {
            function_name: "f".into(),
            document_name: "d".into(),
            line: 1,
            column: 2,
        });
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"category\":\"runtime\""));
        let back: ErrorRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    // ── call stack parsing ───────────────────────────────────

    #[test]
    fn parse_skips_header_line() {
        let stack = "Error: boom\n   at add (Script Document:2:9)\n   \
                     at Global code (Script Document:5:1)";
        let frames = ErrorTranslator::parse_call_stack(stack);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].function_name, "add");
        assert_eq!(frames[0].document_name, "Script Document");
        assert_eq!(frames[0].line, 2);
        assert_eq!(frames[0].column, 9);
        assert_eq!(frames[1].function_name, "Global code");
    }

    #[test]
    fn parse_anonymous_frame() {
        let frames = ErrorTranslator::parse_call_stack("   at (lib.js:10:4)");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].function_name, "");
        assert_eq!(frames[0].document_name, "lib.js");
    }

    #[test]
    fn parse_document_name_with_colon() {
        let frames = ErrorTranslator::parse_call_stack("   at f (C:\\scripts\\a.js:4:2)");
        assert_eq!(frames[0].document_name, "C:\\scripts\\a.js");
        assert_eq!(frames[0].line, 4);
    }

    #[test]
    fn format_matches_frame_layout() {
        let frames = ErrorTranslator::parse_call_stack("x\n   at f (d:1:2)\n   at (d:3:4)");
        assert_eq!(
            ErrorTranslator::format_call_stack(&frames),
            "   at f (d:1:2)\n   at (d:3:4)"
        );
    }

    proptest! {
        #[test]
        fn formatted_stack_reparses(
            frames in prop::collection::vec(
                (
                    "[A-Za-z_][A-Za-z0-9_]{0,8}",
                    "[A-Za-z][A-Za-z0-9 ._-]{0,12}",
                    1u32..5000,
                    1u32..300,
                ),
                0..6,
            )
        ) {
            let frames: Vec<CallStackFrame> = frames
                .into_iter()
                .map(|(function_name, document_name, line, column)| CallStackFrame {
                    function_name,
                    document_name,
                    line,
                    column,
                })
                .collect();
            let text = ErrorTranslator::format_call_stack(&frames);
            prop_assert_eq!(ErrorTranslator::parse_call_stack(&text), frames);
        }
    }
}
