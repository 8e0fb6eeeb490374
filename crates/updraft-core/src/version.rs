//! Version ordering through textual analysis.
//!
//! Version strings are split into runs by character type: maximal runs of
//! ASCII digits compare as unbounded integers, everything else compares
//! case-insensitively as text. Periods, hyphens, and whitespace delimit runs
//! without becoming runs themselves, so `"2.0 Beta 1"` tokenizes to
//! `[2, 0, "beta", 1]`.
//!
//! The rule for unequal run counts is fixed (and covered by the test table
//! below) rather than guessed: when one run list is a strict prefix of the
//! other, the type of the longer side's first extra run decides. A numeric
//! run means the longer side is greater (`1.2.0 > 1.2`), a textual run means
//! the longer side is lesser (`2.0 Beta 1 < 2.0`). At the same index a
//! numeric run outranks a textual run (`1.0 > 1.0b1` after the prefix).

use std::cmp::Ordering;
use std::fmt;

/// Strategy for ordering two version strings.
///
/// Implementations must be pure and callable from any thread; the session
/// machine shares one comparator across selection and downgrade checks.
/// Hosts may supply their own ordering for selection, but the downgrade
/// guard always consults [`StandardComparator`] regardless.
pub trait VersionComparator: Send + Sync {
    /// Returns the ordering of `a` relative to `b`.
    fn compare(&self, a: &str, b: &str) -> Ordering;
}

impl fmt::Debug for dyn VersionComparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VersionComparator")
    }
}

/// The default tokenizing comparator.
///
/// Provides a total order over arbitrary ASCII input, including empty
/// strings and pure-numeric or pure-alphabetic strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardComparator;

impl VersionComparator for StandardComparator {
    fn compare(&self, a: &str, b: &str) -> Ordering {
        let runs_a = tokenize(a);
        let runs_b = tokenize(b);
        let common = runs_a.len().min(runs_b.len());

        for i in 0..common {
            let ord = match (&runs_a[i], &runs_b[i]) {
                (Run::Number(x), Run::Number(y)) => compare_numeric(x, y),
                (Run::Text(x), Run::Text(y)) => x.cmp(y),
                // A numeric run outranks a textual run at the same position:
                // "1.0.1" is newer than "1.0b".
                (Run::Number(_), Run::Text(_)) => Ordering::Greater,
                (Run::Text(_), Run::Number(_)) => Ordering::Less,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }

        match runs_a.len().cmp(&runs_b.len()) {
            Ordering::Equal => Ordering::Equal,
            // One side is a strict prefix of the other: the first extra run
            // decides. Numeric extends the release ("1.2.0" > "1.2"),
            // textual marks a pre-release ("2.0 Beta 1" < "2.0").
            Ordering::Greater => match &runs_a[common] {
                Run::Number(_) => Ordering::Greater,
                Run::Text(_) => Ordering::Less,
            },
            Ordering::Less => match &runs_b[common] {
                Run::Number(_) => Ordering::Less,
                Run::Text(_) => Ordering::Greater,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Run {
    /// A maximal run of ASCII digits, leading zeros intact.
    Number(String),
    /// Any other maximal run, lowercased.
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Digit,
    Separator,
    Other,
}

fn classify(ch: char) -> CharClass {
    if ch.is_ascii_digit() {
        CharClass::Digit
    } else if ch == '.' || ch == '-' || ch.is_whitespace() {
        CharClass::Separator
    } else {
        CharClass::Other
    }
}

fn tokenize(version: &str) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut current = String::new();
    let mut current_class = CharClass::Separator;

    for ch in version.chars() {
        let class = classify(ch);
        if class != current_class && !current.is_empty() {
            runs.push(finish_run(&current, current_class));
            current.clear();
        }
        current_class = class;
        if class != CharClass::Separator {
            current.push(ch);
        }
    }
    if !current.is_empty() {
        runs.push(finish_run(&current, current_class));
    }
    runs
}

fn finish_run(text: &str, class: CharClass) -> Run {
    match class {
        CharClass::Digit => Run::Number(text.to_string()),
        _ => Run::Text(text.to_ascii_lowercase()),
    }
}

/// Compare two digit runs as unbounded-magnitude integers.
///
/// Leading zeros are ignored; after that, a longer digit string is a larger
/// number and equal lengths compare lexicographically.
fn compare_numeric(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(a: &str, b: &str) -> Ordering {
        StandardComparator.compare(a, b)
    }

    #[test]
    fn test_fixed_table() {
        // (a, b, expected ordering of a vs b)
        let table = [
            ("1.0", "1.0", Ordering::Equal),
            ("1.2.0", "1.10.0", Ordering::Less),
            ("1.2", "1.2.0", Ordering::Less),
            ("2.0 Beta 1", "2.0", Ordering::Less),
            ("2.0 Beta 1", "2.0 Beta 2", Ordering::Less),
            ("2.0b1", "2.0", Ordering::Less),
            ("1.0", "1.0b1", Ordering::Greater),
            ("1.0.1", "1.0b", Ordering::Greater),
            ("0.9", "1.0", Ordering::Less),
            ("10.4.11", "10.5", Ordering::Less),
            ("1.05", "1.5", Ordering::Equal),
            ("1.0009", "1.9", Ordering::Equal),
            ("2.0-rc1", "2.0", Ordering::Less),
            ("2.0.1", "2.0-rc1", Ordering::Greater),
            ("", "", Ordering::Equal),
            ("", "1", Ordering::Less),
            ("abc", "abd", Ordering::Less),
            ("ABC", "abc", Ordering::Equal),
            ("1234567890123456789012", "1234567890123456789013", Ordering::Less),
        ];

        for (a, b, expected) in table {
            assert_eq!(cmp(a, b), expected, "compare({a:?}, {b:?})");
        }
    }

    #[test]
    fn test_reflexive() {
        for v in ["1.0", "2.0 Beta 1", "", "abc", "10.04.2", "3-1"] {
            assert_eq!(cmp(v, v), Ordering::Equal, "compare({v:?}, {v:?})");
        }
    }

    #[test]
    fn test_antisymmetric() {
        let versions = ["1.0", "1.0.1", "1.1", "2.0 Beta 1", "2.0", "2.0b", "10.0", ""];
        for a in versions {
            for b in versions {
                assert_eq!(
                    cmp(a, b),
                    cmp(b, a).reverse(),
                    "compare({a:?}, {b:?}) must invert compare({b:?}, {a:?})"
                );
            }
        }
    }

    #[test]
    fn test_transitive_chain() {
        // A sorted chain must compare ascending pairwise in every direction.
        let chain = ["0.9", "1.0b1", "1.0b2", "1.0", "1.0.1", "1.2", "1.2.0", "1.10", "2.0 Beta 1", "2.0"];
        for i in 0..chain.len() {
            for j in (i + 1)..chain.len() {
                assert_eq!(cmp(chain[i], chain[j]), Ordering::Less, "{} < {}", chain[i], chain[j]);
            }
        }
    }

    #[test]
    fn test_separators_do_not_compare() {
        assert_eq!(cmp("1-2", "1.2"), Ordering::Equal);
        assert_eq!(cmp("1 2", "1.2"), Ordering::Equal);
    }
}
