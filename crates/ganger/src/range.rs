//! Numeric acceptance ranges for status counters.
//!
//! Textual form: `[@]MIN:MAX` where either bound may be empty or `~` for
//! unbounded, `@` inverts the check, and a bare number is an upper bound
//! with an implicit lower bound of 0.

use std::fmt;
use std::str::FromStr;

use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Range {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub inverted: bool,
}

impl Range {
    pub fn new(min: Option<f64>, max: Option<f64>, inverted: bool) -> Self {
        Self { min, max, inverted }
    }

    /// Whether `value` falls outside the configured bounds, XORed with the
    /// inversion flag.
    pub fn contains(&self, value: f64) -> bool {
        let outside = self.min.is_some_and(|min| value < min)
            || self.max.is_some_and(|max| value > max);
        outside != self.inverted
    }
}

fn parse_bound(text: &str) -> Result<Option<f64>, WorkerError> {
    match text {
        "" | "~" => Ok(None),
        _ => text
            .parse::<f64>()
            .map(Some)
            .map_err(|_| WorkerError::Config(format!("invalid range bound: {text:?}"))),
    }
}

impl FromStr for Range {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (inverted, rest) = match s.strip_prefix('@') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        match rest.split_once(':') {
            Some((min, max)) => Ok(Range {
                min: parse_bound(min)?,
                max: parse_bound(max)?,
                inverted,
            }),
            None => Ok(Range {
                min: Some(0.0),
                max: parse_bound(rest)?,
                inverted,
            }),
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.inverted {
            write!(f, "@")?;
        }
        // A lower bound of exactly 0 is the implicit default and is omitted,
        // producing the bare-number form when an upper bound is present.
        match self.min {
            Some(min) if min == 0.0 => {}
            Some(min) => write!(f, "{min}:")?,
            None => write!(f, "~:")?,
        }
        if let Some(max) = self.max {
            write!(f, "{max}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Range {
        s.parse().expect("range")
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(parse("5:10"), Range::new(Some(5.0), Some(10.0), false));
        assert_eq!(parse("@5:10"), Range::new(Some(5.0), Some(10.0), true));
        assert_eq!(parse("~:10"), Range::new(None, Some(10.0), false));
        assert_eq!(parse("5:"), Range::new(Some(5.0), None, false));
        assert_eq!(parse("10"), Range::new(Some(0.0), Some(10.0), false));
    }

    #[test]
    fn test_roundtrip() {
        for text in ["5:10", "@5:10", "~:10", "5:", "10"] {
            assert_eq!(parse(text).to_string(), text);
        }
    }

    #[test]
    fn test_contains_is_outside_xor_inverted() {
        let range = parse("5:10");
        assert!(!range.contains(7.0));
        assert!(range.contains(4.0));
        assert!(range.contains(11.0));

        let inverted = parse("@5:10");
        assert!(inverted.contains(7.0));
        assert!(!inverted.contains(4.0));

        let unbounded = parse("~:");
        assert!(!unbounded.contains(f64::MAX));
        assert!(!unbounded.contains(f64::MIN));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let range = parse("5:10");
        assert!(!range.contains(5.0));
        assert!(!range.contains(10.0));
    }

    #[test]
    fn test_invalid_bound_is_rejected() {
        assert!("abc:10".parse::<Range>().is_err());
        assert!("5:xyz".parse::<Range>().is_err());
    }
}
