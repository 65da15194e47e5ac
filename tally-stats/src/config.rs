//! Configuration of the stats store.
//!
//! All types deserialize from the host's configuration format. Missing fields fall back to their
//! defaults, so an empty object is a valid configuration that accepts every stat and extracts the
//! default tags.

use serde::{Deserialize, Serialize};
use tally_common::GlobError;

/// An error raised when the stats configuration is invalid.
///
/// Configuration errors are detected when the [`Store`](crate::Store) or
/// [`StatsMatcher`](crate::StatsMatcher) is constructed, never when stats are looked up.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A regular expression failed to compile.
    #[error("invalid regex {pattern:?}")]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// The compilation error.
        #[source]
        source: regex::Error,
    },
    /// A glob pattern failed to compile.
    #[error("invalid glob {pattern:?}")]
    InvalidGlob {
        /// The offending pattern.
        pattern: String,
        /// The compilation error.
        #[source]
        source: GlobError,
    },
    /// A string matcher has no pattern text.
    #[error("{0} matcher must not be empty")]
    EmptyPattern(&'static str),
    /// An inclusion or exclusion list has no entries.
    #[error("stats matcher {0} list must not be empty")]
    EmptyList(&'static str),
    /// More than one matcher mode is configured.
    #[error("stats matcher must configure at most one of reject_all, inclusion_list and exclusion_list")]
    ConflictingModes,
    /// A tag regex has no capture group to remove from the name.
    #[error("tag regex {0:?} must contain at least one capture group")]
    MissingCaptureGroup(String),
    /// A tag name is configured more than once.
    #[error("tag {0:?} is specified more than once")]
    DuplicateTag(String),
    /// A tag specifier without regex and value refers to an unknown default tag.
    #[error("tag {0:?} is not a default tag and needs a regex or a fixed value")]
    UnknownDefaultTag(String),
    /// A tag specifier has both a regex and a fixed value.
    #[error("tag {0:?} cannot have both a regex and a fixed value")]
    AmbiguousTag(String),
}

/// Limits applied to stat names and tags.
///
/// Names and tags exceeding these limits are truncated when the stat is created, and the stat is
/// tagged with `truncated=true`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsOptions {
    /// Maximum length of a fully qualified stat name in bytes.
    pub max_name_length: usize,
    /// Maximum length of a single tag value in bytes.
    pub max_tag_value_length: usize,
    /// Maximum number of tags per stat.
    pub max_tags: usize,
}

impl Default for StatsOptions {
    fn default() -> Self {
        Self {
            max_name_length: 187,
            max_tag_value_length: 60,
            max_tags: 16,
        }
    }
}

/// A pattern to match stat names against.
///
/// Serialized as an object with a single key naming the kind of match:
///
/// ```json
/// {"prefix": "cluster."}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatcher {
    /// The name equals the pattern.
    Exact(String),
    /// The name starts with the pattern.
    Prefix(String),
    /// The name ends with the pattern.
    Suffix(String),
    /// The name contains the pattern.
    Contains(String),
    /// The name matches a glob, where `*` also matches across `.` separators.
    Glob(String),
    /// The whole name matches a regular expression.
    Regex(String),
}

impl StringMatcher {
    /// Returns the kind of this matcher as written in the configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exact(_) => "exact",
            Self::Prefix(_) => "prefix",
            Self::Suffix(_) => "suffix",
            Self::Contains(_) => "contains",
            Self::Glob(_) => "glob",
            Self::Regex(_) => "regex",
        }
    }

    /// Returns the raw pattern text.
    pub fn pattern(&self) -> &str {
        match self {
            Self::Exact(p)
            | Self::Prefix(p)
            | Self::Suffix(p)
            | Self::Contains(p)
            | Self::Glob(p)
            | Self::Regex(p) => p,
        }
    }
}

/// Configures which stats are tracked.
///
/// At most one of the fields may be set. Without any of them, all stats are accepted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsMatcherConfig {
    /// Rejects every stat.
    pub reject_all: bool,
    /// Rejects every stat that matches none of the patterns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inclusion_list: Option<Vec<StringMatcher>>,
    /// Rejects every stat that matches any of the patterns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusion_list: Option<Vec<StringMatcher>>,
}

/// Configures a tag extracted from stat names, or a fixed tag added to all stats.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TagSpecifier {
    /// Name of the tag.
    pub tag_name: String,
    /// Regex extracting the tag value.
    ///
    /// The first capture group is removed from the name. The value is the second capture group
    /// if present, otherwise the first. If neither a regex nor a fixed value is given, the
    /// default extractor of the same name is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// A value added to every stat under this tag name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_value: Option<String>,
}

/// Top-level configuration of a stats [`Store`](crate::Store).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Limits on names and tags.
    pub options: StatsOptions,
    /// Selection of tracked stats.
    pub matcher: StatsMatcherConfig,
    /// Additional tag specifiers.
    pub tags: Vec<TagSpecifier>,
    /// Extracts all default tags in addition to the configured ones.
    pub use_all_default_tags: bool,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            options: StatsOptions::default(),
            matcher: StatsMatcherConfig::default(),
            tags: Vec::new(),
            use_all_default_tags: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_empty_config() {
        let config: StatsConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StatsConfig::default());
        assert!(config.use_all_default_tags);
        assert_eq!(config.options.max_name_length, 187);
    }

    #[test]
    fn test_matcher_config_json() {
        let json = r#"{
            "exclusion_list": [
                {"glob": "debug.*"},
                {"regex": "cluster\\..*\\.internal"},
                {"prefix": "admin."}
            ]
        }"#;

        let config: StatsMatcherConfig = serde_json::from_str(json).unwrap();
        assert!(!config.reject_all);
        assert!(config.inclusion_list.is_none());
        assert_eq!(
            config.exclusion_list,
            Some(vec![
                StringMatcher::Glob("debug.*".to_owned()),
                StringMatcher::Regex("cluster\\..*\\.internal".to_owned()),
                StringMatcher::Prefix("admin.".to_owned()),
            ])
        );
    }

    #[test]
    fn test_stats_config_yaml() {
        let yaml = r#"
options:
  max_tags: 4
matcher:
  inclusion_list:
    - exact: requests.total
tags:
  - tag_name: region
    fixed_value: us-east-1
  - tag_name: cluster_name
use_all_default_tags: false
"#;

        let config: StatsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.options,
            StatsOptions {
                max_tags: 4,
                ..Default::default()
            }
        );
        assert_eq!(config.tags.len(), 2);
        assert_eq!(config.tags[0].fixed_value.as_deref(), Some("us-east-1"));
        assert_eq!(config.tags[1].regex, None);
        assert!(!config.use_all_default_tags);
    }

    #[test]
    fn test_matcher_serialization() {
        let config = StatsMatcherConfig {
            inclusion_list: Some(vec![StringMatcher::Suffix("_rq".to_owned())]),
            ..Default::default()
        };

        insta::assert_json_snapshot!(config, @r###"
        {
          "reject_all": false,
          "inclusion_list": [
            {
              "suffix": "_rq"
            }
          ]
        }
        "###);
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::EmptyList("inclusion");
        assert_eq!(
            error.to_string(),
            "stats matcher inclusion list must not be empty"
        );
    }
}
