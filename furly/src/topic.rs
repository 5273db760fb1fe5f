//! MQTT topic filters
//!
//! A filter is a `/` separated list of levels where `+` matches exactly one
//! level and `#`, allowed only as the last level, matches zero or more trailing
//! levels. Literal topic content that contains reserved characters must go
//! through [`escape`] before it is used as a level.

use std::borrow::Cow;
use std::fmt::{self, Write};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
    #[error("InvalidEscape({0})")]
    InvalidEscape(String),
}

/// One `/` separated level of a filter.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub enum Level {
    Normal(String),
    Blank,
    /// `+`
    SingleWildcard,
    /// `#`
    MultiWildcard,
}

impl Level {
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Level::SingleWildcard | Level::MultiWildcard)
    }

    #[inline]
    fn accepts(&self, name: &str) -> bool {
        match self {
            Level::Normal(s) => s == name,
            Level::Blank => name.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => true,
        }
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            s if s.contains(['+', '#']) => {
                Err(TopicError::InvalidLevel(format!("invalid level `{}` contains +|#", s)))
            }
            s => Ok(Level::Normal(s.to_owned())),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Normal(s) => f.write_str(s),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

/// A parsed and validated topic filter.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    /// True if the filter contains no wildcard level.
    #[inline]
    pub fn is_literal(&self) -> bool {
        !self.0.iter().any(Level::is_wildcard)
    }

    /// Matches a concrete topic name against this filter without allocating.
    pub fn matches_str<S: AsRef<str> + ?Sized>(&self, topic: &S) -> bool {
        let mut names = topic.as_ref().split('/');
        for level in &self.0 {
            if *level == Level::MultiWildcard {
                return true;
            }
            match names.next() {
                Some(name) if level.accepts(name) => {}
                _ => return false,
            }
        }
        names.next().is_none()
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, TopicError> {
        let levels = s.split('/').map(Level::from_str).collect::<Result<Vec<_>, TopicError>>()?;
        match levels.iter().position(|l| *l == Level::MultiWildcard) {
            Some(pos) if pos + 1 != levels.len() => {
                Err(TopicError::InvalidTopic(format!("invalid topic `{}`, # must be the last level", s)))
            }
            _ => Ok(Topic(levels)),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}

/// Validates a filter, `None` is never valid and the empty filter always is.
#[inline]
pub fn is_valid(filter: Option<&str>) -> bool {
    match filter {
        None => false,
        Some(filter) => {
            let mut levels = filter.split('/').peekable();
            while let Some(level) = levels.next() {
                match level {
                    "+" => {}
                    "#" if levels.peek().is_none() => {}
                    "#" => return false,
                    level if level.contains(['+', '#']) => return false,
                    _ => {}
                }
            }
            true
        }
    }
}

/// A topic name a message can be published to, non-empty and free of wildcards.
#[inline]
pub fn is_valid_name(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#'])
}

/// Matches a topic name against a filter string without allocating.
///
/// An invalid filter never matches.
#[inline]
pub fn matches(topic: &str, filter: &str) -> bool {
    let mut names = topic.split('/');
    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" => return levels.peek().is_none(),
            "+" => {
                if names.next().is_none() {
                    return false;
                }
            }
            level => {
                if level.contains(['+', '#']) {
                    return false;
                }
                match names.next() {
                    Some(name) if name == level => {}
                    _ => return false,
                }
            }
        }
    }
    names.next().is_none()
}

#[inline]
fn is_reserved(c: char) -> bool {
    matches!(c, '+' | '#' | '\\' | '/') || c.is_control()
}

/// Replaces reserved characters with a fixed width `\xHH` sequence so the
/// result can be used as one literal level.
#[inline]
pub fn escape(raw: &str) -> Cow<'_, str> {
    if !raw.chars().any(is_reserved) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 8);
    for c in raw.chars() {
        if is_reserved(c) {
            //reserved characters are all below U+0100
            let _ = write!(out, "\\x{:02X}", c as u32);
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Inverse of [`escape`].
#[inline]
pub fn unescape(escaped: &str) -> Result<Cow<'_, str>, TopicError> {
    if !escaped.contains('\\') {
        return Ok(Cow::Borrowed(escaped));
    }
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.char_indices();
    while let Some((pos, c)) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let code = escaped
            .get(pos + 1..pos + 4)
            .and_then(|seq| seq.strip_prefix('x'))
            .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .ok_or_else(|| TopicError::InvalidEscape(format!("invalid escape at {} in `{}`", pos, escaped)))?;
        out.push(char::from(code));
        chars.nth(2);
    }
    Ok(Cow::Owned(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic() {
        let t: Topic = "sport/+/#".parse().unwrap();
        assert_eq!(
            t.levels(),
            [Level::Normal("sport".into()), Level::SingleWildcard, Level::MultiWildcard]
        );
        assert_eq!("".parse::<Topic>().unwrap().levels(), [Level::Blank]);
        assert!("sport/tennis#".parse::<Topic>().is_err());
        assert!("sport/tennis/#/ranking".parse::<Topic>().is_err());
        assert!("sport+".parse::<Topic>().is_err());
        assert!("a/b".parse::<Topic>().unwrap().is_literal());
        assert!(!"a/+".parse::<Topic>().unwrap().is_literal());
        assert_eq!("+/tennis/#".parse::<Topic>().unwrap().to_string(), "+/tennis/#");
    }

    #[test]
    fn test_is_valid() {
        assert!(!is_valid(Some("a+/b")));
        assert!(!is_valid(Some("a/#/b")));
        assert!(!is_valid(Some("a/b#")));
        assert!(is_valid(Some("")));
        assert!(!is_valid(None));
        assert!(is_valid(Some("#")));
        assert!(is_valid(Some("+/+/#")));
        assert!(is_valid(Some("/a//b/")));

        assert!(is_valid_name("test/alpha"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("test/+"));
    }

    #[test]
    fn test_matches() {
        assert!(matches("a/b", "a/+"));
        assert!(matches("a/b/c", "a/#"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(matches("a/x/b", "a/+/b"));
        assert!(matches("a", "+"));
        assert!(!matches("a/b", "+"));
        assert!(matches("a", "a/#"));
        assert!(matches("", ""));
        assert!(!matches("a/b/c", "a/+"));
        assert!(matches("/finance", "+/+"));
        assert!(!matches("/finance", "+"));
        assert!(!matches("a/b", "a/b#"));
        assert!(!matches("a/b/c", "a/#/c"));
    }

    #[test]
    fn test_parsed_matches_agree() {
        let filters = ["a/+", "a/#", "a/b/c", "a/+/b", "+", "#", "+/+", "", "a//b", "/+/"];
        let topics = ["a", "a/b", "a/b/c", "a/x/b", "", "/x/", "a//b", "/finance"];
        for f in filters {
            let t: Topic = f.parse().unwrap();
            for name in topics {
                assert_eq!(t.matches_str(name), matches(name, f), "filter {f:?} topic {name:?}");
            }
        }
    }

    #[test]
    fn test_escape() {
        let escaped = escape("+#");
        assert!(!escaped.contains(['+', '#']));
        assert_eq!(escaped, "\\x2B\\x23");
        assert_eq!(escape("+#"), escaped);
        assert!(matches!(escape("plain"), Cow::Borrowed("plain")));
        assert_eq!(escape("a/b\\c\n"), "a\\x2Fb\\x5Cc\\x0A");
        assert!(is_valid(Some(escape("weird+name/#").as_ref())));
    }

    #[test]
    fn test_unescape() {
        for raw in ["+#", "a/b\\c\n", "plain", "méthode+1", "\u{7f}"] {
            assert_eq!(unescape(&escape(raw)).unwrap(), raw);
        }
        assert!(unescape("bad\\q").is_err());
        assert!(unescape("short\\x4").is_err());
        assert!(unescape("sign\\x+F").is_err());
        assert!(unescape("space\\x 1").is_err());
        assert_eq!(unescape("hex\\x2b").unwrap(), "hex+");
    }
}
