//! Parameter expansion
//!
//! A job declares parameters as raw strings. Each raw value expands to an
//! ordered list of concrete values:
//!
//! - `202403`                -> `["202403"]`
//! - `A, B,C`                -> `["A", "B", "C"]`
//! - `202401:202412~Q`       -> `["202403", "202406", "202409", "202412"]`
//!
//! A query only expands the parameters it actually references; the cartesian
//! product of those expansions, taken in sorted key order, is the list of
//! [`ParameterCase`]s the query runs under.

use crate::error::{EngineError, Result};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Resolved job parameters: name -> raw value
pub type ParameterSpec = BTreeMap<String, String>;

/// One concrete assignment of every parameter a query references
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterCase(BTreeMap<String, String>);

impl ParameterCase {
    /// The case of a query that references no parameters
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pairs in sorted key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Ledger form: `k1=v1,k2=v2`, or `-` for the empty case
    pub fn description(&self) -> String {
        if self.0.is_empty() {
            return "-".to_string();
        }
        self.iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for ParameterCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Calendar-alignment filter on a month range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alignment {
    Quarter,
    Half,
    Year,
}

impl Alignment {
    fn parse(tag: &str) -> Option<Self> {
        match tag.to_ascii_uppercase().as_str() {
            "Q" => Some(Self::Quarter),
            "H" => Some(Self::Half),
            "Y" => Some(Self::Year),
            _ => None,
        }
    }

    fn keeps(self, month: u32) -> bool {
        match self {
            Self::Quarter => month % 3 == 0,
            Self::Half => month % 6 == 0,
            Self::Year => month == 12,
        }
    }
}

/// Expand one raw parameter value into its concrete values
pub fn expand(raw: &str) -> Result<Vec<String>> {
    let value = raw.trim();

    if value.contains(',') {
        return Ok(value
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect());
    }

    if value.contains(':') {
        return expand_month_range(value);
    }

    Ok(vec![value.to_string()])
}

fn expand_month_range(raw: &str) -> Result<Vec<String>> {
    let (range, alignment) = match raw.split_once('~') {
        Some((range, tag)) => {
            let alignment = Alignment::parse(tag.trim()).ok_or_else(|| {
                EngineError::invalid_range(raw, format!("unknown alignment '~{tag}'"))
            })?;
            (range, Some(alignment))
        }
        None => (raw, None),
    };

    let (start, end) = range
        .split_once(':')
        .ok_or_else(|| EngineError::invalid_range(raw, "expected START:END"))?;
    let start = month_index(raw, start.trim())?;
    let end = month_index(raw, end.trim())?;

    if start > end {
        return Err(EngineError::invalid_range(raw, "start is after end"));
    }

    Ok((start..=end)
        .map(|idx| (idx / 12, idx % 12 + 1))
        .filter(|&(_, month)| alignment.is_none_or(|a| a.keeps(month)))
        .map(|(year, month)| format!("{year:04}{month:02}"))
        .collect())
}

/// `YYYYMM` -> months since year 0
fn month_index(raw: &str, part: &str) -> Result<u32> {
    if part.len() != 6 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EngineError::invalid_range(
            raw,
            format!("'{part}' is not YYYYMM"),
        ));
    }

    let year: u32 = part[..4]
        .parse()
        .map_err(|_| EngineError::invalid_range(raw, format!("bad year in '{part}'")))?;
    let month: u32 = part[4..]
        .parse()
        .map_err(|_| EngineError::invalid_range(raw, format!("bad month in '{part}'")))?;

    if !(1..=12).contains(&month) {
        return Err(EngineError::invalid_range(
            raw,
            format!("month {month:02} out of range in '{part}'"),
        ));
    }

    Ok(year * 12 + month - 1)
}

/// Placeholder names found in a query text
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Placeholders {
    /// `${name}` and `{#name}`: always parameters
    pub explicit: BTreeSet<String>,
    /// `:name` (not `::name`): parameters only when defined
    pub colon: BTreeSet<String>,
}

/// Find every placeholder in a query text
pub fn scan_placeholders(sql: &str) -> Result<Placeholders> {
    let dollar = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;
    let hash = Regex::new(r"\{#([A-Za-z_][A-Za-z0-9_]*)\}")?;
    let colon = Regex::new(r"(?:^|[^:]):([A-Za-z_][A-Za-z0-9_]*)")?;

    let mut found = Placeholders::default();
    for re in [&dollar, &hash] {
        found
            .explicit
            .extend(re.captures_iter(sql).map(|c| c[1].to_string()));
    }
    found
        .colon
        .extend(colon.captures_iter(sql).map(|c| c[1].to_string()));

    Ok(found)
}

/// Sorted names of the parameters a query references
pub fn referenced_keys(query: &str, sql: &str, params: &ParameterSpec) -> Result<Vec<String>> {
    let found = scan_placeholders(sql)?;

    if let Some(missing) = found.explicit.iter().find(|k| !params.contains_key(*k)) {
        return Err(EngineError::MissingParameter {
            query: query.to_string(),
            name: missing.clone(),
        });
    }

    let mut keys: BTreeSet<String> = found.explicit;
    for name in found.colon {
        if params.contains_key(&name) {
            keys.insert(name);
        } else {
            tracing::debug!(query, placeholder = %name, "ignoring undefined :placeholder");
        }
    }

    Ok(keys.into_iter().collect())
}

/// Every execution case for one query, in deterministic order
pub fn build_cases(query: &str, sql: &str, params: &ParameterSpec) -> Result<Vec<ParameterCase>> {
    let keys = referenced_keys(query, sql, params)?;

    let mut cases = vec![BTreeMap::new()];
    for key in &keys {
        let values = expand(&params[key])?;
        cases = cases
            .into_iter()
            .flat_map(|case| {
                values.iter().map(move |value| {
                    let mut next = case.clone();
                    next.insert(key.clone(), value.clone());
                    next
                })
            })
            .collect();
    }

    Ok(cases.into_iter().map(ParameterCase).collect())
}

/// Substitute a case's values into a query text
///
/// Longest names go first so `:base` never clobbers part of `:baseYymm`.
pub fn render(sql: &str, case: &ParameterCase) -> Result<String> {
    let mut pairs: Vec<(&str, &str)> = case.iter().collect();
    pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

    let mut out = sql.to_string();
    for (name, value) in pairs {
        out = out
            .replace(&format!("${{{name}}}"), value)
            .replace(&format!("{{#{name}}}"), value);

        let colon = Regex::new(&format!(r"(^|[^:]):{}\b", regex::escape(name)))?;
        out = colon
            .replace_all(&out, |caps: &Captures| format!("{}{}", &caps[1], value))
            .into_owned();
    }

    Ok(out)
}

/// Drop one trailing statement terminator (`;` or a lone `/` line)
pub fn strip_terminator(sql: &str) -> String {
    let trimmed = sql.trim();

    if let Some(body) = trimmed.strip_suffix(';') {
        return body.trim_end().to_string();
    }

    if let Some((body, last)) = trimmed.rsplit_once('\n') {
        if last.trim() == "/" {
            return body.trim_end().to_string();
        }
    }

    trimmed.to_string()
}
