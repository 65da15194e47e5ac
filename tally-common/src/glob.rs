use std::borrow::Cow;
use std::fmt;

use globset::GlobBuilder;
use regex::bytes::{Regex, RegexBuilder};

/// Separator between the segments of a dotted stat name.
const SEGMENT_SEPARATOR: char = '.';

/// Controls the options of the globber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GlobOptions {
    /// When enabled, `*` stops at `.` separators and `**` matches across them.
    ///
    /// By default `*` matches any sequence of characters, including separators.
    pub segment_wildcards: bool,
    /// Enables case insensitive matching.
    pub case_insensitive: bool,
}

/// An error raised when a glob pattern cannot be compiled.
#[derive(Debug, thiserror::Error)]
pub enum GlobError {
    /// The pattern is not valid glob syntax.
    #[error("invalid glob pattern")]
    Syntax(#[from] globset::Error),
    /// The translated pattern could not be compiled.
    #[error("glob pattern too complex")]
    Regex(#[from] regex::Error),
}

/// A compiled glob pattern for matching dotted names.
///
/// Supports `*`, `?`, `[...]` character classes and `{a,b}` alternates.
///
/// # Example
///
/// ```
/// use tally_common::Glob;
///
/// let glob = Glob::new("debug.*").unwrap();
/// assert!(glob.is_match("debug.trace"));
/// assert!(!glob.is_match("requests.total"));
/// ```
#[derive(Clone)]
pub struct Glob {
    pattern: String,
    options: GlobOptions,
    regex: Regex,
}

impl Glob {
    /// Compiles a glob with default options.
    pub fn new(pattern: &str) -> Result<Self, GlobError> {
        Self::with_options(pattern, GlobOptions::default())
    }

    /// Compiles a glob with the given options.
    pub fn with_options(pattern: &str, options: GlobOptions) -> Result<Self, GlobError> {
        let translated = translate_separators(pattern, options);

        let glob = GlobBuilder::new(&translated)
            .case_insensitive(options.case_insensitive)
            .literal_separator(options.segment_wildcards)
            .build()?;

        let regex = RegexBuilder::new(glob.regex())
            .dot_matches_new_line(true)
            .build()?;

        Ok(Self {
            pattern: pattern.to_owned(),
            options,
            regex,
        })
    }

    /// Returns the original pattern.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Returns `true` if the glob matches the entire `value`.
    pub fn is_match(&self, value: &str) -> bool {
        let value = translate_separators(value, self.options);
        self.regex.is_match(value.as_bytes())
    }
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Glob").field(&self.pattern).finish()
    }
}

impl PartialEq for Glob {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.options == other.options
    }
}

/// Maps name separators onto path separators, which the globber understands natively.
fn translate_separators(value: &str, options: GlobOptions) -> Cow<'_, str> {
    if options.segment_wildcards && value.contains(SEGMENT_SEPARATOR) {
        Cow::Owned(value.replace(SEGMENT_SEPARATOR, "/"))
    } else {
        Cow::Borrowed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_globs() {
        macro_rules! test_glob {
            ($value:expr, $pat:expr, $is_match:expr, {$($k:ident: $v:expr),*}) => {{
                #[allow(clippy::needless_update)]
                let options = GlobOptions { $($k: $v,)* ..Default::default() };
                let glob = Glob::with_options($pat, options).unwrap();
                assert!(
                    glob.is_match($value) == $is_match,
                    "expected that {} {} {} with options {:?}",
                    $pat,
                    if $is_match { "matches" } else { "does not match" },
                    $value,
                    &options,
                );
            }}
        }

        test_glob!("debug.trace", "debug.*", true, {});
        test_glob!("debug.trace.sub", "debug.*", true, {});
        test_glob!("debug.trace.sub", "debug.*", false, {segment_wildcards: true});
        test_glob!("debug.trace.sub", "debug.**", true, {segment_wildcards: true});
        test_glob!("debug.trace", "debug.*", true, {segment_wildcards: true});
        test_glob!("cluster.foo.upstream_rq", "cluster.*.upstream_rq", true, {segment_wildcards: true});
        test_glob!("cluster.foo.bar.upstream_rq", "cluster.*.upstream_rq", false, {segment_wildcards: true});
        test_glob!("DEBUG.trace", "debug.*", false, {});
        test_glob!("DEBUG.trace", "debug.*", true, {case_insensitive: true});
        test_glob!("http.ingress.rq_2xx", "http.*.rq_[0-9]xx", true, {});
        test_glob!("http.ingress.rq_5xx", "http.{ingress,egress}.rq_5xx", true, {});
        test_glob!("http.admin.rq_5xx", "http.{ingress,egress}.rq_5xx", false, {});
        test_glob!("requests.total", "requests.tota?", true, {});
        test_glob!("requests.total", "requests", false, {});
    }

    #[test]
    fn test_invalid_glob() {
        assert!(matches!(Glob::new("a[b"), Err(GlobError::Syntax(_))));
    }

    #[test]
    fn test_pattern_roundtrip() {
        let glob = Glob::new("a.*.c").unwrap();
        assert_eq!(glob.pattern(), "a.*.c");
        assert_eq!(format!("{glob:?}"), "Glob(\"a.*.c\")");
    }
}
