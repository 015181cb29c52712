//! Partition addressing
//!
//! A partition is named by its logical table plus a suffix built from the
//! parameter case that produced it:
//!
//! ```text
//! SALES                      (query with no parameters)
//! SALES__clsYymm=202403      (one parameter)
//! SALES__a=1_b=2             (keys sorted, pairs joined with '_')
//! ```
//!
//! Decoding splits on the first `__`, so a logical table name must never
//! contain `__` itself.

use crate::params::ParameterCase;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Separator between the logical table and its suffix
pub const SUFFIX_SEPARATOR: &str = "__";

/// (logical table, suffix) identity of one partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    pub table: String,
    pub suffix: String,
}

impl PartitionKey {
    pub fn new(table: impl AsRef<str>, suffix: impl Into<String>) -> Self {
        Self {
            table: table.as_ref().to_uppercase(),
            suffix: suffix.into(),
        }
    }

    /// Key of the partition a query writes for one parameter case
    pub fn for_case(query_name: &str, case: &ParameterCase) -> Self {
        Self::new(query_name, encode_suffix(case))
    }

    /// Name of the physical table or file stem: table followed by suffix
    pub fn physical_name(&self) -> String {
        format!("{}{}", self.table, self.suffix)
    }

    pub fn file_name(&self, format: PartitionFormat) -> String {
        format!("{}.{}", self.physical_name(), format.extension())
    }

    /// Deterministic location of this partition under an output directory
    pub fn output_path(&self, dir: &Path, format: PartitionFormat) -> PathBuf {
        dir.join(self.file_name(format))
    }

    /// Whether every `k=v` pair appears in the suffix
    pub fn matches_filter<'a>(&self, filter: impl IntoIterator<Item = (&'a str, &'a str)>) -> bool {
        filter
            .into_iter()
            .all(|(k, v)| self.suffix.contains(&format!("{k}={v}")))
    }
}

/// Build the suffix for a parameter case; empty when the case is empty
pub fn encode_suffix(case: &ParameterCase) -> String {
    if case.is_empty() {
        return String::new();
    }

    let pairs: Vec<String> = case.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{SUFFIX_SEPARATOR}{}", pairs.join("_"))
}

/// Split a physical name into (TABLE, suffix) at the first `__`
pub fn decode(name: &str) -> PartitionKey {
    match name.find(SUFFIX_SEPARATOR) {
        Some(pos) => PartitionKey::new(&name[..pos], &name[pos..]),
        None => PartitionKey::new(name, ""),
    }
}

/// Decode a partition file name; `None` for files that are not partitions
/// of the given format (temporary files, other extensions, dot files)
pub fn decode_file_name(file_name: &str, format: PartitionFormat) -> Option<PartitionKey> {
    if file_name.starts_with('.') {
        return None;
    }

    let stem = file_name.strip_suffix(&format!(".{}", format.extension()))?;
    if stem.is_empty() {
        return None;
    }

    Some(decode(stem))
}

/// Row file encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Csv,
}

/// Whole-file compression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// File format plus compression of partition files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionFormat {
    pub format: FileFormat,
    pub compression: Compression,
}

impl PartitionFormat {
    pub fn new(format: FileFormat, compression: Compression) -> Self {
        Self {
            format,
            compression,
        }
    }

    pub fn extension(&self) -> &'static str {
        match (self.format, self.compression) {
            (FileFormat::Csv, Compression::None) => "csv",
            (FileFormat::Csv, Compression::Gzip) => "csv.gz",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_is_sorted_and_order_independent() {
        let forward = ParameterCase::from_pairs([("b", "2"), ("a", "1")]);
        let backward = ParameterCase::from_pairs([("a", "1"), ("b", "2")]);
        assert_eq!(encode_suffix(&forward), "__a=1_b=2");
        assert_eq!(encode_suffix(&forward), encode_suffix(&backward));
    }

    #[test]
    fn test_encode_empty_case() {
        assert_eq!(encode_suffix(&ParameterCase::empty()), "");
    }

    #[test]
    fn test_decode() {
        assert_eq!(
            decode("sales__clsYymm=202403"),
            PartitionKey::new("SALES", "__clsYymm=202403")
        );
        assert_eq!(decode("rate"), PartitionKey::new("RATE", ""));
        // first separator wins; a value containing "__" stays in the suffix
        assert_eq!(decode("T__a=x__y"), PartitionKey::new("T", "__a=x__y"));
    }

    #[test]
    fn test_file_names() {
        let key = PartitionKey::for_case("sales", &ParameterCase::from_pairs([("m", "202401")]));
        let gz = PartitionFormat::new(FileFormat::Csv, Compression::Gzip);

        assert_eq!(key.file_name(gz), "SALES__m=202401.csv.gz");
        assert_eq!(
            key.output_path(Path::new("/out/job"), PartitionFormat::default()),
            PathBuf::from("/out/job/SALES__m=202401.csv")
        );
        assert_eq!(decode_file_name("SALES__m=202401.csv.gz", gz), Some(key));
        assert_eq!(decode_file_name("SALES__m=202401.csv", gz), None);
        assert_eq!(decode_file_name(".SALES.csv.gz.tmp", gz), None);
    }

    #[test]
    fn test_matches_filter() {
        let key = PartitionKey::new("T", "__a=1_b=2");
        assert!(key.matches_filter([("a", "1")]));
        assert!(key.matches_filter([("a", "1"), ("b", "2")]));
        assert!(!key.matches_filter([("a", "2")]));
        assert!(key.matches_filter(std::iter::empty()));
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(
            table in "[A-Z][A-Z0-9]{0,8}(_[A-Z0-9]{1,4})?",
            params in proptest::collection::btree_map("[a-z][a-zA-Z0-9]{0,6}", "[A-Za-z0-9]{1,8}", 1..4),
        ) {
            let case = ParameterCase::from_pairs(params);
            let suffix = encode_suffix(&case);
            let decoded = decode(&format!("{table}{suffix}"));
            prop_assert_eq!(decoded, PartitionKey::new(&table, suffix));
        }
    }
}
