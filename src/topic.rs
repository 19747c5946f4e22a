//! Topic names and filters, split into levels.
//!
//! A filter level is either a literal, the single-level wildcard `+`, or the
//! multi-level wildcard `#`. `#` may only appear as the last level and also
//! matches the parent itself: `sport/#` matches `sport`. Wildcards in the
//! first level never match topics whose first level starts with `$`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::MqttError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    /// First level starting with `$`, e.g. `$SYS`.
    Metadata(String),
    /// Zero-length level, as in `sport//tennis`.
    Blank,
    /// `+`
    SingleWildcard,
    /// `#`
    MultiWildcard,
}

impl Level {
    pub fn parse<T: AsRef<str>>(s: T) -> Result<Level, MqttError> {
        let s = s.as_ref();
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                if s.contains(['+', '#']) {
                    Err(MqttError::Protocol(
                        format!("invalid topic level: {s}").into(),
                    ))
                } else if s.starts_with('$') {
                    Ok(Level::Metadata(String::from(s)))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        matches!(self, Level::Metadata(_))
    }

    #[inline]
    pub fn value(&self) -> Option<&str> {
        match self {
            Level::Normal(s) | Level::Metadata(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Normal(s) | Level::Metadata(s) => f.write_str(s),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_str("+"),
            Level::MultiWildcard => f.write_str("#"),
        }
    }
}

/// A parsed topic name or topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Topic(pub Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `$`-metadata may only open the topic, `#` may only close it.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && !self.0[1..].iter().any(Level::is_metadata)
            && !self.0[..self.0.len() - 1]
                .iter()
                .any(|l| matches!(l, Level::MultiWildcard))
    }

    /// True when self, read as a filter, matches the concrete `topic`.
    pub fn matches_str<T: AsRef<str>>(&self, topic: T) -> bool {
        let mut filter = self.0.iter();
        let mut levels = topic.as_ref().split('/');
        let mut first = true;
        loop {
            match (filter.next(), levels.next()) {
                (Some(Level::MultiWildcard), level) => {
                    // `#` matches the parent and every descendant, but a
                    // leading wildcard never matches a `$` topic.
                    return !(first && matches!(level, Some(l) if l.starts_with('$')));
                }
                (Some(Level::SingleWildcard), Some(level)) => {
                    if first && level.starts_with('$') {
                        return false;
                    }
                }
                (Some(Level::Normal(l)), Some(level)) | (Some(Level::Metadata(l)), Some(level)) => {
                    if l != level {
                        return false;
                    }
                }
                (Some(Level::Blank), Some(level)) => {
                    if !level.is_empty() {
                        return false;
                    }
                }
                (None, None) => return true,
                _ => return false,
            }
            first = false;
        }
    }
}

impl FromStr for Topic {
    type Err = MqttError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let levels = s.split('/').map(Level::parse).collect::<Result<Vec<_>, _>>()?;
        let topic = Topic(levels);
        if topic.is_valid() {
            Ok(topic)
        } else {
            Err(MqttError::Protocol(format!("invalid topic: {s}").into()))
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for level in &self.0 {
            if !first {
                f.write_str("/")?;
            }
            level.fmt(f)?;
            first = false;
        }
        Ok(())
    }
}

/// True when the string contains `+` or `#` and is therefore a filter,
/// not a publishable topic name.
#[inline]
pub fn has_wildcards(topic: &str) -> bool {
    topic.contains(['+', '#'])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> Topic {
        Topic::from_str(s).unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            t("sport/tennis/player1").levels(),
            &[
                Level::Normal("sport".into()),
                Level::Normal("tennis".into()),
                Level::Normal("player1".into())
            ]
        );
        assert_eq!(t("sport//tennis").levels()[1], Level::Blank);
        assert_eq!(t("$SYS/uptime").levels()[0], Level::Metadata("$SYS".into()));
        assert_eq!(t("+/tennis/#").len(), 3);

        assert!(Topic::from_str("sport/tennis#").is_err());
        assert!(Topic::from_str("sport/ten+nis").is_err());
        assert!(Topic::from_str("sport/#/ranking").is_err());
        assert!(Topic::from_str("sport/$SYS/x").is_err());
    }

    #[test]
    fn test_display() {
        for s in ["a/b/c", "a/+/c", "a/#", "sport//tennis", "$SYS/broker"] {
            assert_eq!(t(s).to_string(), s);
        }
    }

    #[test]
    fn test_single_wildcard() {
        let filter = t("a/+/c");
        assert!(filter.matches_str("a/b/c"));
        assert!(filter.matches_str("a/x/c"));
        assert!(!filter.matches_str("a/b/x/c"));
        assert!(!filter.matches_str("a/c"));

        assert!(t("sport/+").matches_str("sport/"));
        assert!(t("+/+").matches_str("/finance"));
        assert!(!t("+").matches_str("/finance"));
    }

    #[test]
    fn test_multi_wildcard() {
        let filter = t("a/#");
        assert!(filter.matches_str("a"));
        assert!(filter.matches_str("a/b"));
        assert!(filter.matches_str("a/b/c"));
        assert!(!filter.matches_str("b/c"));

        assert!(t("#").matches_str("a/b/c"));
        assert!(t("sport/tennis/#").matches_str("sport/tennis"));
    }

    #[test]
    fn test_metadata_exclusion() {
        assert!(!t("#").matches_str("$SYS/broker/uptime"));
        assert!(!t("+/broker").matches_str("$SYS/broker"));
        assert!(t("$SYS/#").matches_str("$SYS/broker/uptime"));
        assert!(t("$SYS/+").matches_str("$SYS/broker"));
    }

    #[test]
    fn test_exact() {
        assert!(t("a/b/c").matches_str("a/b/c"));
        assert!(!t("a/b/c").matches_str("a/b"));
        assert!(!t("a/b").matches_str("a/b/c"));
        assert!(t("sport//tennis").matches_str("sport//tennis"));
        assert!(!t("sport//tennis").matches_str("sport/x/tennis"));
    }
}
