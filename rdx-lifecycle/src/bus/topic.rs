//! Topic patterns for channel subscriptions.
//!
//! Topics are dot-separated words (`token-factory.start.success`). A pattern
//! may use two wildcard segments:
//!
//! - `*` matches exactly one word,
//! - `#` matches zero or more words.
//!
//! So `#.success` matches every component's success report and
//! `*.init.error` matches every component's `init` failure.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Word(String),
    One,
    Many,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        let segments = pattern
            .split('.')
            .map(|word| match word {
                "*" => Segment::One,
                "#" => Segment::Many,
                word => Segment::Word(word.to_string()),
            })
            .collect();
        Self {
            raw: pattern.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `true` when the pattern contains no wildcard segment.
    pub fn is_exact(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Word(_)))
    }

    pub fn matches(&self, topic: &str) -> bool {
        if self.is_exact() {
            return self.raw == topic;
        }
        let words: Vec<&str> = topic.split('.').collect();
        match_segments(&self.segments, &words)
    }
}

fn match_segments(pattern: &[Segment], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((Segment::Many, rest)) => {
            (0..=words.len()).any(|skip| match_segments(rest, &words[skip..]))
        }
        Some((Segment::One, rest)) => !words.is_empty() && match_segments(rest, &words[1..]),
        Some((Segment::Word(expected), rest)) => match words.split_first() {
            Some((word, tail)) => *word == expected.as_str() && match_segments(rest, tail),
            None => false,
        },
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        TopicPattern::parse(pattern)
    }
}

impl From<String> for TopicPattern {
    fn from(pattern: String) -> Self {
        TopicPattern::parse(&pattern)
    }
}
