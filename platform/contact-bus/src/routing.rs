//! Routing keys, queue names and binding patterns

use crate::{BusError, BusResult, EventKind};
use std::fmt;

/// Prefix shared by every contact routing key
pub const ROUTING_KEY_PREFIX: &str = "contact";

/// Default routing key for an event kind: `contact.<kind-lowercased>`
pub fn derive_routing_key(kind: EventKind) -> String {
    format!("{}.{}", ROUTING_KEY_PREFIX, kind.as_str().to_lowercase())
}

/// Effective routing key: the override when non-empty, else the derived key
pub fn effective_routing_key(kind: EventKind, routing_key_override: Option<&str>) -> String {
    match routing_key_override {
        Some(key) if !key.trim().is_empty() => key.to_string(),
        _ => derive_routing_key(kind),
    }
}

/// Default queue name for an event type: `queue_<EventTypeName>`
pub fn derive_queue_name(event_type_name: &str) -> String {
    format!("queue_{}", event_type_name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Word {
    Literal(String),
    /// `*`: exactly one word
    One,
}

/// Pattern a queue is bound with
///
/// - `*` or `#` on its own receives every message
/// - otherwise dot-separated words, where `*` matches exactly one word and a
///   trailing `#` matches zero or more words
///
/// # Examples
/// - `contact.created` matches only `contact.created`
/// - `contact.*` matches `contact.created` and `contact.deleted`
/// - `contact.#` matches `contact`, `contact.created` and `contact.a.b`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingPattern {
    raw: String,
    words: Vec<Word>,
    /// Trailing `#`
    open_tail: bool,
    match_all: bool,
}

impl BindingPattern {
    /// Pattern that receives everything (`*`)
    pub fn all() -> Self {
        Self {
            raw: "*".to_string(),
            words: Vec::new(),
            open_tail: true,
            match_all: true,
        }
    }

    pub fn parse(pattern: &str) -> BusResult<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() || pattern == "*" || pattern == "#" {
            return Ok(Self {
                raw: if pattern.is_empty() { "*".to_string() } else { pattern.to_string() },
                ..Self::all()
            });
        }

        let tokens: Vec<&str> = pattern.split('.').collect();
        let mut words = Vec::with_capacity(tokens.len());
        let mut open_tail = false;

        for (idx, token) in tokens.iter().enumerate() {
            match *token {
                "" => {
                    return Err(BusError::InvalidPattern(format!(
                        "{}: empty word",
                        pattern
                    )))
                }
                "#" if idx == tokens.len() - 1 => open_tail = true,
                "#" => {
                    return Err(BusError::InvalidPattern(format!(
                        "{}: '#' is only supported as the last word",
                        pattern
                    )))
                }
                "*" => words.push(Word::One),
                literal if literal.contains(['*', '#', '>', ' ']) => {
                    return Err(BusError::InvalidPattern(format!(
                        "{}: invalid word '{}'",
                        pattern, literal
                    )))
                }
                literal => words.push(Word::Literal(literal.to_string())),
            }
        }

        Ok(Self {
            raw: pattern.to_string(),
            words,
            open_tail,
            match_all: false,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_match_all(&self) -> bool {
        self.match_all
    }

    /// Check if a routing key matches this pattern
    pub fn matches(&self, routing_key: &str) -> bool {
        if self.match_all {
            return true;
        }

        let keys: Vec<&str> = routing_key.split('.').collect();
        if keys.len() < self.words.len() {
            return false;
        }
        if !self.open_tail && keys.len() != self.words.len() {
            return false;
        }

        self.words.iter().zip(keys.iter()).all(|(word, key)| match word {
            Word::One => !key.is_empty(),
            Word::Literal(literal) => literal == key,
        })
    }

    /// NATS subject filters equivalent to this pattern under `prefix`
    ///
    /// A trailing `#` becomes two filters because NATS `>` requires at least
    /// one token.
    pub fn subject_filters(&self, prefix: &str) -> Vec<String> {
        if self.match_all {
            return vec![format!("{}.>", prefix)];
        }

        let mut base = String::from(prefix);
        for word in &self.words {
            base.push('.');
            match word {
                Word::One => base.push('*'),
                Word::Literal(literal) => base.push_str(literal),
            }
        }

        if self.open_tail {
            if self.words.is_empty() {
                vec![format!("{}.>", prefix)]
            } else {
                vec![format!("{}.>", base), base]
            }
        } else {
            vec![base]
        }
    }
}

impl Default for BindingPattern {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Display for BindingPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
