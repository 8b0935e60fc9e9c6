//! Version vectors.
//!
//! A version maps each writer (`source`) to the latest `date` seen from it.
//! Serialized as `"source1 date1|source2 date2"`, sorted by source.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::op::Operation;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionVector {
    heads: BTreeMap<String, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a set of operations into a `source → max date` map.
    pub fn from_ops<'a>(ops: impl IntoIterator<Item = &'a Operation>) -> Self {
        let mut version = Self::new();
        for op in ops {
            version.insert(&op.source, op.date);
        }
        version
    }

    /// Record `date` for `source`, keeping the maximum.
    pub fn insert(&mut self, source: &str, date: u64) {
        self.heads
            .entry(source.to_string())
            .and_modify(|d| *d = (*d).max(date))
            .or_insert(date);
    }

    pub fn get(&self, source: &str) -> Option<u64> {
        self.heads.get(source).copied()
    }

    /// `true` when this version already covers `op`.
    pub fn covers(&self, op: &Operation) -> bool {
        self.get(&op.source).is_some_and(|d| op.date <= d)
    }

    /// Point-wise maximum.
    pub fn merge(&mut self, other: &Self) {
        for (source, date) in other.iter() {
            self.insert(source, *date);
        }
    }

    /// Can this version offer newer operations to `other`?
    pub fn has_news_for(&self, other: &Self) -> bool {
        self.heads
            .iter()
            .any(|(s, d)| other.get(s).map_or(true, |od| *d > od))
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, String, u64> {
        self.heads.iter()
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (source, date)) in self.heads.iter().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{source} {date}")?;
        }
        Ok(())
    }
}

/// Malformed version string.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionParseError(pub String);

impl fmt::Display for VersionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid version entry: {:?}", self.0)
    }
}

impl std::error::Error for VersionParseError {}

impl FromStr for VersionVector {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut version = Self::new();
        for entry in s.split('|').filter(|e| !e.is_empty()) {
            let (source, date) = entry
                .rsplit_once(' ')
                .ok_or_else(|| VersionParseError(entry.to_string()))?;
            let date = date
                .parse::<u64>()
                .map_err(|_| VersionParseError(entry.to_string()))?;
            if source.is_empty() {
                return Err(VersionParseError(entry.to_string()));
            }
            version.insert(source, date);
        }
        Ok(version)
    }
}

impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::OpKind;

    #[test]
    fn test_serialize_sorted() {
        let mut v = VersionVector::new();
        v.insert("b", 7);
        v.insert("a", 3);
        v.insert("a", 2);
        assert_eq!(v.to_string(), "a 3|b 7");
    }

    #[test]
    fn test_parse() {
        let v: VersionVector = "s1 10|s2 20".parse().unwrap();
        assert_eq!(v.get("s1"), Some(10));
        assert_eq!(v.get("s2"), Some(20));
        assert!("".parse::<VersionVector>().unwrap().is_empty());
        assert!("s1".parse::<VersionVector>().is_err());
        assert!("s1 x".parse::<VersionVector>().is_err());
    }

    #[test]
    fn test_from_ops_takes_max() {
        let ops = vec![
            Operation::new(OpKind::Set, "a", 5, "c", "1"),
            Operation::new(OpKind::Set, "a", 9, "c", "1"),
            Operation::new(OpKind::Set, "b", 1, "c", "1"),
        ];
        let v = VersionVector::from_ops(&ops);
        assert_eq!(v.to_string(), "a 9|b 1");
        assert!(v.covers(&ops[0]));
    }

    #[test]
    fn test_has_news_for() {
        let a: VersionVector = "x 5|y 1".parse().unwrap();
        let b: VersionVector = "x 5".parse().unwrap();
        assert!(a.has_news_for(&b));
        assert!(!b.has_news_for(&a));
    }

    #[test]
    fn test_serde_as_string() {
        let v: VersionVector = "x 5".parse().unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"x 5\"");
        let back: VersionVector = serde_json::from_str("\"x 5\"").unwrap();
        assert_eq!(back, v);
    }
}
