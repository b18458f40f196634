use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::Document,
    error::{Error, Result},
};

/// A collation configuration. See the official MongoDB
/// [documentation](https://docs.mongodb.com/manual/reference/collation/) for more information on
/// each of the fields.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[builder(field_defaults(default, setter(into)))]
pub struct Collation {
    /// The ICU locale.
    #[builder(!default)]
    pub locale: String,

    /// The level of comparison to perform. Corresponds to [ICU Comparison Levels](http://userguide.icu-project.org/collation/concepts#TOC-Comparison-Levels).
    pub strength: Option<i32>,

    /// Whether to include case comparison when `strength` is level 1 or 2.
    pub case_level: Option<bool>,

    /// The sort order of case differences during tertiary level comparisons.
    pub case_first: Option<String>,

    /// Whether to compare numeric strings as numbers or strings.
    pub numeric_ordering: Option<bool>,

    /// Whether collation should consider whitespace and punctuation as base characters for
    /// purposes of comparison.
    pub alternate: Option<String>,

    /// Up to which characters are considered ignorable when `alternate` is "shifted". Has no
    /// effect if `alternate` is set to "non-ignorable".
    pub max_variable: Option<String>,

    /// Whether to check if text require normalization and to perform it.
    pub normalization: Option<bool>,

    /// Whether strings with diacritics sort from the back of the string.
    pub backwards: Option<bool>,
}

impl Collation {
    /// Parses a collation out of a command option document. The `locale` field is required.
    pub(crate) fn from_document(doc: &Document) -> Result<Self> {
        let collation: Collation = crate::bson::from_document(doc.clone())
            .map_err(|e| Error::bad_value(format!("invalid collation document: {}", e)))?;
        if collation.locale.is_empty() {
            return Err(Error::bad_value("collation requires a non-empty locale"));
        }
        Ok(collation)
    }

    /// Whether comparisons at this collation's strength fold case. Strengths 1 and 2 compare
    /// base characters only; the default (3) is case sensitive.
    fn folds_case(&self) -> bool {
        matches!(self.strength, Some(1) | Some(2))
    }

    /// Locale-aware string comparison. Collation is strictly scoped to string values; non-string
    /// types always use the canonical language-neutral ordering.
    pub(crate) fn compare_str(&self, a: &str, b: &str) -> Ordering {
        if self.numeric_ordering == Some(true) {
            return compare_numeric_runs(self, a, b);
        }
        if self.folds_case() {
            let folded = a
                .chars()
                .flat_map(char::to_lowercase)
                .cmp(b.chars().flat_map(char::to_lowercase));
            if folded != Ordering::Equal || self.case_level != Some(true) {
                return folded;
            }
        }
        a.cmp(b)
    }
}

// Splits both strings into alternating digit and non-digit runs; digit runs compare as unsigned
// integers, other runs compare per the collation's case rules.
fn compare_numeric_runs(collation: &Collation, a: &str, b: &str) -> Ordering {
    let runs_a = split_runs(a);
    let runs_b = split_runs(b);
    for (run_a, run_b) in runs_a.iter().zip(runs_b.iter()) {
        let ord = match (parse_digits(run_a), parse_digits(run_b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                if collation.folds_case() {
                    run_a.to_lowercase().cmp(&run_b.to_lowercase())
                } else {
                    run_a.cmp(run_b)
                }
            }
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    runs_a.len().cmp(&runs_b.len())
}

fn split_runs(s: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut in_digits: Option<bool> = None;
    for (i, c) in s.char_indices() {
        let digit = c.is_ascii_digit();
        match in_digits {
            Some(prev) if prev == digit => {}
            Some(_) => {
                runs.push(&s[start..i]);
                start = i;
                in_digits = Some(digit);
            }
            None => in_digits = Some(digit),
        }
    }
    if start < s.len() {
        runs.push(&s[start..]);
    }
    runs
}

fn parse_digits(s: &str) -> Option<u128> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}
