use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use thiserror::Error;

/// Identity of a node: an unordered set of audience measure ids.
///
/// Measures are kept sorted and de-duplicated so that equality, hashing and
/// ordering do not depend on insertion order. The string form joins the
/// sorted ids with `:` (e.g. `"1:5:9"`) and is what serde uses, which keeps
/// the type usable as a JSON map key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeasureSet(Vec<i64>);

#[derive(Debug, Error)]
#[error("invalid measure id `{value}`: {source}")]
pub struct MeasureSetParseError {
    value: String,
    #[source]
    source: ParseIntError,
}

impl MeasureSet {
    pub fn new<I>(measures: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        let mut measures: Vec<i64> = measures.into_iter().collect();
        measures.sort_unstable();
        measures.dedup();
        Self(measures)
    }

    pub fn measures(&self) -> &[i64] {
        &self.0
    }

    pub fn contains(&self, measure: i64) -> bool {
        self.0.binary_search(&measure).is_ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<i64> for MeasureSet {
    fn from_iter<I: IntoIterator<Item = i64>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for MeasureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, measure) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(":")?;
            }
            write!(f, "{measure}")?;
        }
        Ok(())
    }
}

impl FromStr for MeasureSet {
    type Err = MeasureSetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }

        trimmed
            .split(':')
            .map(|part| {
                let part = part.trim();
                part.parse::<i64>().map_err(|source| MeasureSetParseError {
                    value: part.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }
}

impl Serialize for MeasureSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MeasureSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_measure_set_ignores_insertion_order() {
        let a = MeasureSet::new([9, 1, 5]);
        let b = MeasureSet::new([5, 9, 1, 1]);

        assert_eq!(a, b);
        assert_eq!(a.measures(), &[1, 5, 9]);

        let mut map = HashMap::new();
        map.insert(a, "node");
        assert_eq!(map.get(&b), Some(&"node"));
    }

    #[test]
    fn test_measure_set_string_form() {
        let set: MeasureSet = "5:1:9".parse().unwrap();
        assert_eq!(set.to_string(), "1:5:9");
        assert!(set.contains(5));
        assert!(!set.contains(2));

        assert!("".parse::<MeasureSet>().unwrap().is_empty());
        assert!("1:x".parse::<MeasureSet>().is_err());
    }

    #[test]
    fn test_measure_set_as_json_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(MeasureSet::new([3, 2]), 7);

        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"2:3":7}"#);

        let back: std::collections::BTreeMap<MeasureSet, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
