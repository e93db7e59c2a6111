//! Label sets carried in the `x-data` header
//!
//! A label set is serialized as labels joined by [`DELIMITER`]. An empty set
//! is sent as [`NO_DATA`] so that the header never carries an empty value.

use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Separator between labels in a serialized label set
pub const DELIMITER: &str = ";";

/// Reserved value meaning "no labels present"
pub const NO_DATA: &str = "__NONE__";

/// A deduplicated set of labels
///
/// Never contains an empty label or [`NO_DATA`]. Iteration and serialization
/// follow lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelSet {
    labels: BTreeSet<String>,
    delimiter: String,
}

impl LabelSet {
    /// Create an empty label set using the given delimiter
    pub fn new(delimiter: impl Into<String>) -> Self {
        Self {
            labels: BTreeSet::new(),
            delimiter: delimiter.into(),
        }
    }

    /// Parse a delimited label string
    ///
    /// Empty tokens and [`NO_DATA`] are discarded, so `""`, `"__NONE__"` and
    /// `";;"` all parse to the empty set. A trailing delimiter is tolerated.
    pub fn parse(text: &str, delimiter: &str) -> Self {
        let mut set = Self::new(delimiter);
        if delimiter.is_empty() {
            set.add(text);
            return set;
        }
        for token in text.split(delimiter) {
            set.add(token);
        }
        set
    }

    /// Whether `member` is in the set
    pub fn contains(&self, member: &str) -> bool {
        self.labels.contains(member)
    }

    /// Insert a label. Empty labels and the sentinel are ignored.
    pub fn add(&mut self, member: &str) {
        if is_label(member) {
            self.labels.insert(member.to_string());
        }
    }

    /// Remove a label, returning whether it was present
    pub fn remove(&mut self, member: &str) -> bool {
        self.labels.remove(member)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, String> {
        self.labels.iter()
    }

    /// Delimiter used by [`LabelSet::serialize`]
    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Serialize to header form: labels joined by the delimiter, or
    /// [`NO_DATA`] when empty
    pub fn serialize(&self) -> String {
        if self.labels.is_empty() {
            return NO_DATA.to_string();
        }
        self.labels
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(&self.delimiter)
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self::new(DELIMITER)
    }
}

impl FromStr for LabelSet {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s, DELIMITER))
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = &'a String;
    type IntoIter = btree_set::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Whether `member` may be stored in a label set
pub fn is_label(member: &str) -> bool {
    !member.is_empty() && member != NO_DATA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let set = LabelSet::parse("pii;ok", DELIMITER);
        assert_eq!(set.len(), 2);
        assert!(set.contains("pii"));
        assert!(set.contains("ok"));
    }

    #[test]
    fn test_parse_tolerates_trailing_delimiter() {
        let with = LabelSet::parse("a;b;", DELIMITER);
        let without = LabelSet::parse("a;b", DELIMITER);
        assert_eq!(with, without);
        assert_eq!(with.len(), 2);
    }

    #[test]
    fn test_parse_empty_and_sentinel() {
        assert!(LabelSet::parse("", DELIMITER).is_empty());
        assert!(LabelSet::parse(NO_DATA, DELIMITER).is_empty());
        assert!(LabelSet::parse(";;", DELIMITER).is_empty());

        let mixed = LabelSet::parse("__NONE__;pii;__NONE__", DELIMITER);
        assert_eq!(mixed.len(), 1);
        assert!(!mixed.contains(NO_DATA));
    }

    #[test]
    fn test_serialize_empty_is_sentinel() {
        assert_eq!(LabelSet::default().serialize(), NO_DATA);
    }

    #[test]
    fn test_serialize_sorted_without_trailing_delimiter() {
        let set = LabelSet::parse("zeta;alpha;alpha;mid", DELIMITER);
        assert_eq!(set.serialize(), "alpha;mid;zeta");
        assert_eq!(set.to_string(), "alpha;mid;zeta");
    }

    #[test]
    fn test_normalization_is_idempotent() {
        for text in ["", "a", "b;a;b;", "__NONE__", ";x;;y;__NONE__;x"] {
            let once = LabelSet::parse(text, DELIMITER);
            let twice = LabelSet::parse(&once.serialize(), DELIMITER);
            assert_eq!(once, twice, "normalizing {:?}", text);
        }
    }

    #[test]
    fn test_add_and_remove() {
        let mut set = LabelSet::default();
        set.add("pii");
        set.add("pii");
        set.add("");
        set.add(NO_DATA);
        assert_eq!(set.len(), 1);

        assert!(set.remove("pii"));
        assert!(!set.remove("pii"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_custom_delimiter() {
        let set = LabelSet::parse("a,b,,c", ",");
        assert_eq!(set.len(), 3);
        assert_eq!(set.serialize(), "a,b,c");
    }

    #[test]
    fn test_from_str() {
        let set: LabelSet = "b;a".parse().unwrap();
        assert_eq!(set.iter().cloned().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
