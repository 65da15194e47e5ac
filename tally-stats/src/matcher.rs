use regex::Regex;
use tally_common::Glob;

use crate::config::{ConfigError, StatsMatcherConfig, StringMatcher};

/// A compiled [`StringMatcher`].
#[derive(Debug)]
enum Pattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
    Glob(Glob),
    Regex(Regex),
}

impl Pattern {
    fn compile(matcher: &StringMatcher) -> Result<Self, ConfigError> {
        let pattern = matcher.pattern();
        if pattern.is_empty() {
            return Err(ConfigError::EmptyPattern(matcher.kind()));
        }

        Ok(match matcher {
            StringMatcher::Exact(p) => Self::Exact(p.clone()),
            StringMatcher::Prefix(p) => Self::Prefix(p.clone()),
            StringMatcher::Suffix(p) => Self::Suffix(p.clone()),
            StringMatcher::Contains(p) => Self::Contains(p.clone()),
            StringMatcher::Glob(p) => {
                Self::Glob(Glob::new(p).map_err(|source| ConfigError::InvalidGlob {
                    pattern: p.clone(),
                    source,
                })?)
            }
            StringMatcher::Regex(p) => {
                // Regexes must match the entire name.
                let anchored = format!("^(?:{p})$");
                Self::Regex(
                    Regex::new(&anchored).map_err(|source| ConfigError::InvalidRegex {
                        pattern: p.clone(),
                        source,
                    })?,
                )
            }
        })
    }

    fn is_match(&self, name: &str) -> bool {
        match self {
            Self::Exact(p) => name == p,
            Self::Prefix(p) => name.starts_with(p.as_str()),
            Self::Suffix(p) => name.ends_with(p.as_str()),
            Self::Contains(p) => name.contains(p.as_str()),
            Self::Glob(glob) => glob.is_match(name),
            Self::Regex(regex) => regex.is_match(name),
        }
    }
}

#[derive(Debug, Default)]
enum Mode {
    #[default]
    AcceptAll,
    RejectAll,
    Inclusion(Vec<Pattern>),
    Exclusion(Vec<Pattern>),
}

/// Decides whether a stat is tracked, based on its fully qualified name.
///
/// Rejected stats are replaced by null containers that ignore all updates. The matcher is
/// evaluated once when a stat is first looked up, the [`Store`](crate::Store) remembers the
/// outcome.
///
/// [`accepts_all`](Self::accepts_all) and [`rejects_all`](Self::rejects_all) allow callers to
/// skip matching entirely. They are consistent with [`rejects`](Self::rejects).
///
/// # Example
///
/// ```
/// use tally_stats::{StatsMatcher, StatsMatcherConfig, StringMatcher};
///
/// let matcher = StatsMatcher::new(&StatsMatcherConfig {
///     exclusion_list: Some(vec![StringMatcher::Glob("debug.*".to_owned())]),
///     ..Default::default()
/// })
/// .unwrap();
///
/// assert!(matcher.rejects("debug.trace"));
/// assert!(!matcher.rejects("requests.total"));
/// ```
#[derive(Debug, Default)]
pub struct StatsMatcher {
    mode: Mode,
}

impl StatsMatcher {
    /// Compiles a matcher from its configuration.
    pub fn new(config: &StatsMatcherConfig) -> Result<Self, ConfigError> {
        let mode = match (
            config.reject_all,
            &config.inclusion_list,
            &config.exclusion_list,
        ) {
            (false, None, None) => Mode::AcceptAll,
            (true, None, None) => Mode::RejectAll,
            (false, Some(list), None) => Mode::Inclusion(compile_list(list, "inclusion")?),
            (false, None, Some(list)) => Mode::Exclusion(compile_list(list, "exclusion")?),
            _ => return Err(ConfigError::ConflictingModes),
        };

        Ok(Self { mode })
    }

    /// Creates a matcher that accepts every stat.
    pub fn accept_all() -> Self {
        Self {
            mode: Mode::AcceptAll,
        }
    }

    /// Creates a matcher that rejects every stat.
    pub fn reject_all() -> Self {
        Self {
            mode: Mode::RejectAll,
        }
    }

    /// Returns `true` if no name is ever rejected.
    pub fn accepts_all(&self) -> bool {
        matches!(self.mode, Mode::AcceptAll)
    }

    /// Returns `true` if every name is rejected.
    pub fn rejects_all(&self) -> bool {
        matches!(self.mode, Mode::RejectAll)
    }

    /// Returns `true` if the stat with the given name should not be tracked.
    pub fn rejects(&self, name: &str) -> bool {
        match &self.mode {
            Mode::AcceptAll => false,
            Mode::RejectAll => true,
            Mode::Inclusion(patterns) => !patterns.iter().any(|p| p.is_match(name)),
            Mode::Exclusion(patterns) => patterns.iter().any(|p| p.is_match(name)),
        }
    }
}

fn compile_list(list: &[StringMatcher], kind: &'static str) -> Result<Vec<Pattern>, ConfigError> {
    if list.is_empty() {
        return Err(ConfigError::EmptyList(kind));
    }

    list.iter().map(Pattern::compile).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(json: &str) -> StatsMatcher {
        let config: StatsMatcherConfig = serde_json::from_str(json).unwrap();
        StatsMatcher::new(&config).unwrap()
    }

    fn error(json: &str) -> String {
        let config: StatsMatcherConfig = serde_json::from_str(json).unwrap();
        StatsMatcher::new(&config).unwrap_err().to_string()
    }

    #[test]
    fn test_accept_all() {
        let matcher = matcher("{}");
        assert!(matcher.accepts_all());
        assert!(!matcher.rejects_all());

        for name in ["", "requests.total", "debug.trace", "a.b.c.d.e"] {
            assert!(!matcher.rejects(name));
        }
    }

    #[test]
    fn test_reject_all() {
        let matcher = matcher(r#"{"reject_all": true}"#);
        assert!(!matcher.accepts_all());
        assert!(matcher.rejects_all());
        assert!(matcher.rejects("requests.total"));
    }

    #[test]
    fn test_exclusion_list() {
        let matcher = matcher(
            r#"{"exclusion_list": [
                {"glob": "debug.*"},
                {"exact": "server.uptime"},
                {"suffix": "_bytes"}
            ]}"#,
        );

        assert!(!matcher.accepts_all());
        assert!(!matcher.rejects_all());
        assert!(matcher.rejects("debug.trace"));
        assert!(matcher.rejects("debug.trace.deep"));
        assert!(matcher.rejects("server.uptime"));
        assert!(matcher.rejects("cluster.a.upstream_cx_rx_bytes"));
        assert!(!matcher.rejects("requests.total"));
        assert!(!matcher.rejects("server.uptime_total"));
        assert!(!matcher.rejects("mydebug.trace"));
    }

    #[test]
    fn test_inclusion_list() {
        let matcher = matcher(
            r#"{"inclusion_list": [
                {"prefix": "cluster."},
                {"contains": "rq_5"},
                {"regex": "http\\.[a-z]+\\.rq_total"}
            ]}"#,
        );

        assert!(!matcher.rejects("cluster.backend.upstream_rq"));
        assert!(!matcher.rejects("listener.downstream_rq_503"));
        assert!(!matcher.rejects("http.ingress.rq_total"));
        assert!(matcher.rejects("http.ingress.rq_total_ms"), "regex is anchored");
        assert!(matcher.rejects("xhttp.ingress.rq_total"), "regex is anchored");
        assert!(matcher.rejects("requests.total"));
    }

    #[test]
    fn test_validation_errors() {
        insta::assert_snapshot!(
            error(r#"{"reject_all": true, "exclusion_list": [{"exact": "a"}]}"#),
            @"stats matcher must configure at most one of reject_all, inclusion_list and exclusion_list"
        );
        insta::assert_snapshot!(
            error(r#"{"inclusion_list": [{"exact": "a"}], "exclusion_list": [{"exact": "b"}]}"#),
            @"stats matcher must configure at most one of reject_all, inclusion_list and exclusion_list"
        );
        insta::assert_snapshot!(
            error(r#"{"inclusion_list": []}"#),
            @"stats matcher inclusion list must not be empty"
        );
        insta::assert_snapshot!(
            error(r#"{"exclusion_list": [{"prefix": ""}]}"#),
            @"prefix matcher must not be empty"
        );
        insta::assert_snapshot!(
            error(r#"{"exclusion_list": [{"regex": "(unclosed"}]}"#),
            @r###"invalid regex "(unclosed""###
        );
        insta::assert_snapshot!(
            error(r#"{"exclusion_list": [{"glob": "a[b"}]}"#),
            @r###"invalid glob "a[b""###
        );
    }

    #[test]
    fn test_constructors_are_consistent() {
        let accept = StatsMatcher::accept_all();
        assert!(accept.accepts_all() && !accept.rejects("x"));

        let reject = StatsMatcher::reject_all();
        assert!(reject.rejects_all() && reject.rejects("x"));

        assert!(StatsMatcher::default().accepts_all());
    }
}
