//! Tags and their extraction from stat names.
//!
//! Components often encode dimensions directly into stat names, for instance the upstream cluster
//! in `cluster.backend.upstream_rq_200`. The [`TagProducer`] turns such names into a
//! *tag-extracted name* (`cluster.upstream_rq`) plus tags (`cluster_name=backend`,
//! `response_code=200`), so that sinks can aggregate across tag values.

use std::fmt;
use std::ops::Range;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, TagSpecifier};

/// Name of the tag added to stats whose name or tags were truncated.
pub const TRUNCATED_TAG: &str = "truncated";

/// A key-value pair attached to a stat.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct Tag {
    /// The tag key.
    pub name: String,
    /// The tag value.
    pub value: String,
}

impl Tag {
    /// Creates a new tag.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Default tag extractors as `(tag name, regex)`.
const DEFAULT_TAGS: &[(&str, &str)] = &[
    ("cluster_name", r"^cluster\.((.+?)\.)"),
    ("http_conn_manager_prefix", r"^http\.((.*?)\.)"),
    (
        "listener_address",
        r"^listener\.(((?:[_.[:digit:]]*|[_\[\]aAbBcCdDeEfF[:digit:]]*))\.)",
    ),
    ("response_code", r"_rq(_(\d{3}))$"),
    ("response_code_class", r"_rq(_(\dxx))$"),
    ("virtual_host", r"^vhost\.((.*?)\.)"),
    ("virtual_cluster", r"^vhost\..*?\.vcluster\.((.*?)\.)\w+?$"),
    ("tcp_prefix", r"^tcp\.((.*?)\.)\w+?$"),
];

/// Extracts a single tag from stat names using a regular expression.
#[derive(Clone)]
pub struct TagExtractor {
    name: String,
    regex: Regex,
}

impl TagExtractor {
    /// Compiles an extractor for the given tag name.
    ///
    /// The first capture group of `regex` is removed from matching names. The tag value is the
    /// second capture group if there is one, otherwise the first.
    pub fn new(name: &str, regex: &str) -> Result<Self, ConfigError> {
        let compiled = Regex::new(regex).map_err(|source| ConfigError::InvalidRegex {
            pattern: regex.to_owned(),
            source,
        })?;

        if compiled.captures_len() < 2 {
            return Err(ConfigError::MissingCaptureGroup(regex.to_owned()));
        }

        Ok(Self {
            name: name.to_owned(),
            regex: compiled,
        })
    }

    /// Returns the name of the extracted tag.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extracts the tag from `stat_name`.
    ///
    /// Returns the tag and the byte range to remove from the name, or `None` if the name does not
    /// match.
    pub fn extract(&self, stat_name: &str) -> Option<(Tag, Range<usize>)> {
        let captures = self.regex.captures(stat_name)?;
        let remove = captures.get(1)?;
        let value = captures.get(2).unwrap_or(remove);

        Some((Tag::new(&self.name, value.as_str()), remove.range()))
    }
}

impl fmt::Debug for TagExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TagExtractor")
            .field("name", &self.name)
            .field("regex", &self.regex.as_str())
            .finish()
    }
}

/// Produces tags and tag-extracted names for stats.
///
/// # Example
///
/// ```
/// use tally_stats::{Tag, TagProducer};
///
/// let producer = TagProducer::with_default_tags();
/// let (name, tags) = producer.produce_tags("cluster.backend.upstream_rq_200");
///
/// assert_eq!(name, "cluster.upstream_rq");
/// assert_eq!(tags, vec![
///     Tag::new("cluster_name", "backend"),
///     Tag::new("response_code", "200"),
/// ]);
/// ```
#[derive(Clone, Debug, Default)]
pub struct TagProducer {
    extractors: Vec<TagExtractor>,
    fixed_tags: Vec<Tag>,
}

impl TagProducer {
    /// Creates a producer that extracts no tags.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a producer with all default tag extractors.
    pub fn with_default_tags() -> Self {
        let extractors = DEFAULT_TAGS
            .iter()
            .filter_map(|(name, regex)| TagExtractor::new(name, regex).ok())
            .collect();

        Self {
            extractors,
            fixed_tags: Vec::new(),
        }
    }

    /// Creates a producer from tag specifiers.
    ///
    /// Specifiers without regex and fixed value select the default extractor of the same name.
    /// With `use_all_default_tags`, all default extractors that are not overridden by a
    /// specifier are added as well.
    pub fn from_specifiers(
        specifiers: &[TagSpecifier],
        use_all_default_tags: bool,
    ) -> Result<Self, ConfigError> {
        let mut producer = Self::new();
        let mut names = Vec::with_capacity(specifiers.len());

        for specifier in specifiers {
            let name = specifier.tag_name.as_str();
            if names.contains(&name) {
                return Err(ConfigError::DuplicateTag(name.to_owned()));
            }
            names.push(name);

            match (&specifier.regex, &specifier.fixed_value) {
                (Some(_), Some(_)) => return Err(ConfigError::AmbiguousTag(name.to_owned())),
                (Some(regex), None) => producer.extractors.push(TagExtractor::new(name, regex)?),
                (None, Some(value)) => producer.fixed_tags.push(Tag::new(name, value)),
                (None, None) => {
                    let Some((_, regex)) = DEFAULT_TAGS.iter().find(|(n, _)| *n == name) else {
                        return Err(ConfigError::UnknownDefaultTag(name.to_owned()));
                    };
                    producer.extractors.push(TagExtractor::new(name, regex)?);
                }
            }
        }

        if use_all_default_tags {
            for (name, regex) in DEFAULT_TAGS {
                if !names.contains(name) {
                    producer.extractors.push(TagExtractor::new(name, regex)?);
                }
            }
        }

        Ok(producer)
    }

    /// Returns the number of regex extractors.
    pub fn num_extractors(&self) -> usize {
        self.extractors.len()
    }

    /// Returns the tags added to every stat.
    pub fn fixed_tags(&self) -> &[Tag] {
        &self.fixed_tags
    }

    /// Extracts tags from a fully qualified stat name.
    ///
    /// Every extractor is matched against the original name. The returned name has the removed
    /// parts of all matching extractors cut out. Fixed tags are appended after extracted tags.
    pub fn produce_tags(&self, stat_name: &str) -> (String, Vec<Tag>) {
        let mut tags = Vec::new();
        let mut removed = Vec::new();

        for extractor in &self.extractors {
            if let Some((tag, range)) = extractor.extract(stat_name) {
                tags.push(tag);
                removed.push(range);
            }
        }

        tags.extend(self.fixed_tags.iter().cloned());

        if removed.is_empty() {
            return (stat_name.to_owned(), tags);
        }

        removed.sort_by_key(|range| range.start);

        let mut extracted = String::with_capacity(stat_name.len());
        let mut position = 0;
        for range in removed {
            if range.start > position {
                extracted.push_str(&stat_name[position..range.start]);
            }
            position = position.max(range.end);
        }
        extracted.push_str(&stat_name[position..]);

        (extracted, tags)
    }
}
