//! Structured compiler flag sets.
//!
//! The compiler driver parser (external to this system) turns a raw argument
//! vector into an [`Invocation`]: input and output are pulled out, flags that
//! must never affect caching land in `non_cached`, and everything else that
//! influences code generation stays in `other`. Fingerprinting consumes only
//! the cacheable subset, so the bucket rules here are normative.

use serde::{Deserialize, Serialize};

/// Identity of the compiler binary a job must run under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerId {
    /// Filesystem path of the compiler binary.
    pub path: String,
    /// Advertised version string.
    pub version: String,
}

impl CompilerId {
    pub fn new(path: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            version: version.into(),
        }
    }
}

/// What a flag set asks the compiler to do.
///
/// Only `Compile` jobs are eligible for caching and remote dispatch.
/// Everything else (preprocess-only runs, help/version queries, link-only
/// invocations, unparseable flag sets) short-circuits to direct local
/// execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Compile,
    Preprocess,
    Unknown,
}

/// Flags whose values never affect generated code. They are excluded from
/// fingerprinting and each consumes one value argument.
pub const NON_CACHED_FLAGS: &[&str] = &[
    "-main-file-name",
    "-coverage-file",
    "-resource-dir",
    "-internal-isystem",
    "-internal-externc-isystem",
    "-fdebug-compilation-dir",
];

/// Returns `true` for flags in the [`NON_CACHED_FLAGS`] table.
pub fn is_non_cached_flag(flag: &str) -> bool {
    NON_CACHED_FLAGS.contains(&flag)
}

/// A parsed compiler invocation, bucketed for caching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Compiler this job must run under.
    pub compiler: CompilerId,

    /// Positional input source path, if any.
    pub input: Option<String>,

    /// Requested output path (`-o <file>`), if any. Never fingerprinted.
    pub output: Option<String>,

    /// Source language (`-x <lang>` or inferred), if known.
    #[serde(default)]
    pub language: Option<String>,

    /// Cacheable flags: everything that can affect generated code.
    #[serde(default)]
    pub other: Vec<String>,

    /// Non-cacheable flags with their value arguments, interleaved.
    #[serde(default)]
    pub non_cached: Vec<String>,

    /// Requested action.
    pub action: Action,
}

impl Invocation {
    /// A bare compile invocation with no flags, for building up in tests and
    /// at the wire boundary.
    pub fn compile(compiler: CompilerId, input: impl Into<String>) -> Self {
        Self {
            compiler,
            input: Some(input.into()),
            output: None,
            language: None,
            other: Vec::new(),
            non_cached: Vec::new(),
            action: Action::Compile,
        }
    }

    /// Whether this job may go through the fingerprint/store/inflight path.
    ///
    /// A request with no preprocessable source cannot be fingerprinted and is
    /// routed direct, whatever its action says.
    pub fn is_cacheable(&self) -> bool {
        self.action == Action::Compile && self.input.is_some()
    }

    /// The cacheable flag subset in lexical order. Fingerprinting consumes
    /// this instead of `other` so that flag permutations hash identically.
    pub fn cacheable_flags_sorted(&self) -> Vec<&str> {
        let mut flags: Vec<&str> = self.other.iter().map(String::as_str).collect();
        flags.sort_unstable();
        flags
    }

    /// Splits a raw argument vector into buckets.
    ///
    /// This mirrors the external driver parser's contract and exists so the
    /// wire layer and tests can construct invocations from plain argv. Flags
    /// from [`NON_CACHED_FLAGS`] consume one value argument; `-o` sets the
    /// output; `-x` sets the language; the first non-flag argument is the
    /// input.
    pub fn from_args<I, S>(compiler: CompilerId, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut input = None;
        let mut output = None;
        let mut language = None;
        let mut other = Vec::new();
        let mut non_cached = Vec::new();
        let mut preprocess_only = false;

        let mut iter = args.into_iter().map(Into::into);
        while let Some(arg) = iter.next() {
            if is_non_cached_flag(&arg) {
                non_cached.push(arg);
                if let Some(value) = iter.next() {
                    non_cached.push(value);
                }
            } else if arg == "-o" {
                output = iter.next();
            } else if arg == "-x" {
                language = iter.next();
            } else if arg == "-E" {
                preprocess_only = true;
                other.push(arg);
            } else if arg.starts_with('-') {
                other.push(arg);
            } else if input.is_none() {
                input = Some(arg);
            } else {
                // Multiple positional inputs: not a single-TU compile.
                other.push(arg);
            }
        }

        let action = if preprocess_only {
            Action::Preprocess
        } else if input.is_some() {
            Action::Compile
        } else {
            Action::Unknown
        };

        Self {
            compiler,
            input,
            output,
            language,
            other,
            non_cached,
            action,
        }
    }
}
