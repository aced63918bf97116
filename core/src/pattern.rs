//! Shell-style glob matching.
//!
//! Patterns are anchored and case-sensitive. `*` matches any run of characters
//! other than `/`, `?` matches a single character other than `/`, `[...]`
//! matches a character class (`[^...]` negates it, `a-z` is a range) and `\`
//! escapes the following character.

use std::fmt;

const SEPARATOR: char = '/';

/// A pattern could not be parsed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("syntax error in pattern {pattern:?}: {reason}")]
pub struct PatternError {
    pattern: String,
    reason: &'static str,
}

/// A parsed glob pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    tokens: Vec<Token>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Char(char),
    AnyChar,
    AnySeq,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

/// Matches `name` against `pattern`.
///
/// Returns an error if the pattern is malformed, regardless of whether the
/// name would have matched the well-formed prefix of the pattern.
pub fn matches(pattern: &str, name: &str) -> Result<bool, PatternError> {
    Ok(pattern.parse::<Pattern>()?.matches(name))
}

// === impl Pattern ===

impl Pattern {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, name: &str) -> bool {
        let name = name.chars().collect::<Vec<_>>();

        // Iterative matching with single-point backtracking on the most recent `*`.
        let (mut t, mut n) = (0, 0);
        let mut star: Option<(usize, usize)> = None;
        while n < name.len() {
            match self.tokens.get(t) {
                Some(Token::AnySeq) => {
                    star = Some((t, n));
                    t += 1;
                    continue;
                }
                Some(tok) if tok.matches(name[n]) => {
                    t += 1;
                    n += 1;
                    continue;
                }
                _ => {}
            }

            // Let the last `*` absorb one more character, unless that character is
            // a separator, which a `*` never spans.
            match star {
                Some((st, sn)) if name[sn] != SEPARATOR => {
                    star = Some((st, sn + 1));
                    t = st + 1;
                    n = sn + 1;
                }
                _ => return false,
            }
        }

        self.tokens[t..].iter().all(|tok| *tok == Token::AnySeq)
    }
}

impl std::str::FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, PatternError> {
        let err = |reason| PatternError {
            pattern: s.to_string(),
            reason,
        };

        let mut tokens = Vec::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            let tok = match c {
                '*' => {
                    // Consecutive stars are equivalent to a single one.
                    if tokens.last() == Some(&Token::AnySeq) {
                        continue;
                    }
                    Token::AnySeq
                }
                '?' => Token::AnyChar,
                '\\' => Token::Char(chars.next().ok_or_else(|| err("trailing escape"))?),
                '[' => {
                    let negated = chars.next_if_eq(&'^').is_some();
                    let mut ranges = Vec::new();
                    loop {
                        let lo = match chars.next() {
                            None => return Err(err("unterminated character class")),
                            Some(']') if !ranges.is_empty() => break,
                            Some(']') | Some('-') => return Err(err("empty character range")),
                            Some('\\') => chars.next().ok_or_else(|| err("trailing escape"))?,
                            Some(c) => c,
                        };
                        let hi = if chars.next_if_eq(&'-').is_some() {
                            match chars.next() {
                                None => return Err(err("unterminated character class")),
                                Some(']') | Some('-') => {
                                    return Err(err("incomplete character range"))
                                }
                                Some('\\') => {
                                    chars.next().ok_or_else(|| err("trailing escape"))?
                                }
                                Some(c) => c,
                            }
                        } else {
                            lo
                        };
                        ranges.push((lo, hi));
                    }
                    Token::Class { negated, ranges }
                }
                c => Token::Char(c),
            };
            tokens.push(tok);
        }

        Ok(Self {
            source: s.to_string(),
            tokens,
        })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.source.fmt(f)
    }
}

// === impl Token ===

impl Token {
    fn matches(&self, c: char) -> bool {
        match self {
            Self::Char(expected) => *expected == c,
            Self::AnyChar => c != SEPARATOR,
            Self::AnySeq => false,
            Self::Class { negated, ranges } => {
                let found = ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
                found != *negated
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchored() {
        assert!(matches("foo", "foo").unwrap());
        assert!(!matches("foo", "foobar").unwrap());
        assert!(!matches("foo", "xfoo").unwrap());
        assert!(!matches("Foo", "foo").unwrap());
    }

    #[test]
    fn star() {
        assert!(matches("bar-*", "bar-foo").unwrap());
        assert!(matches("bar-*", "bar-").unwrap());
        assert!(!matches("bar-*", "barfoo").unwrap());
        assert!(matches("*", "anything").unwrap());
        assert!(matches("*", "").unwrap());
        assert!(matches("a*b*c", "axxbyyc").unwrap());
        assert!(matches("a*b*c", "abcbc").unwrap());
        assert!(!matches("a*b*c", "axxbyy").unwrap());
        assert!(matches("**x", "abx").unwrap());
    }

    #[test]
    fn star_stops_at_separator() {
        assert!(!matches("*", "a/b").unwrap());
        assert!(matches("*/*", "a/b").unwrap());
        assert!(!matches("team-*", "team-a/b").unwrap());
    }

    #[test]
    fn single_char() {
        assert!(matches("ns-?", "ns-1").unwrap());
        assert!(!matches("ns-?", "ns-12").unwrap());
        assert!(!matches("ns-?", "ns-").unwrap());
        assert!(!matches("?", "/").unwrap());
    }

    #[test]
    fn classes() {
        assert!(matches("[abc]x", "bx").unwrap());
        assert!(!matches("[abc]x", "dx").unwrap());
        assert!(matches("[a-c]", "b").unwrap());
        assert!(matches("[^a-c]", "d").unwrap());
        assert!(!matches("[^a-c]", "b").unwrap());
        assert!(matches("[\\]]", "]").unwrap());
        assert!(matches("env-[0-9][0-9]", "env-42").unwrap());
    }

    #[test]
    fn escapes() {
        assert!(matches("a\\*", "a*").unwrap());
        assert!(!matches("a\\*", "ab").unwrap());
    }

    #[test]
    fn malformed() {
        for p in &["[", "[a", "[]", "[a-]", "[-a]", "a\\", "[^"] {
            assert!(matches(p, "a").is_err(), "{} must not parse", p);
        }
    }

    #[test]
    fn malformed_after_mismatch() {
        // The whole pattern is validated, even when the prefix already fails.
        assert!(matches("x[", "a").is_err());
    }
}
