use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("pattern is empty")]
    Empty,
    #[error("pattern `{0}` ends with a dangling escape")]
    DanglingEscape(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
}

/// Case-insensitive glob anchored to the whole name.
///
/// `*` matches any run of characters, `?` exactly one, and `\` makes the
/// next character literal. Matching is iterative with a single backtrack
/// point, so hostile patterns cost at most `O(pattern * name)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    tokens: Vec<Token>,
}

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut tokens = Vec::with_capacity(pattern.len());
        let mut chars = pattern.chars();
        while let Some(c) = chars.next() {
            match c {
                '*' => {
                    if tokens.last() != Some(&Token::AnyRun) {
                        tokens.push(Token::AnyRun);
                    }
                }
                '?' => tokens.push(Token::AnyChar),
                '\\' => {
                    let escaped = chars
                        .next()
                        .ok_or_else(|| PatternError::DanglingEscape(pattern.to_string()))?;
                    tokens.extend(escaped.to_lowercase().map(Token::Literal));
                }
                other => tokens.extend(other.to_lowercase().map(Token::Literal)),
            }
        }

        Ok(Self {
            source: pattern.to_string(),
            tokens,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, name: &str) -> bool {
        let name: Vec<char> = name.chars().flat_map(char::to_lowercase).collect();
        let tokens = &self.tokens;

        let (mut t, mut n) = (0usize, 0usize);
        // Position of the last `*` and the name offset it currently absorbs up to.
        let mut star: Option<(usize, usize)> = None;

        while n < name.len() {
            match tokens.get(t) {
                Some(Token::AnyRun) => {
                    star = Some((t, n));
                    t += 1;
                    continue;
                }
                Some(Token::AnyChar) => {
                    t += 1;
                    n += 1;
                    continue;
                }
                Some(Token::Literal(c)) if *c == name[n] => {
                    t += 1;
                    n += 1;
                    continue;
                }
                _ => {}
            }

            match star {
                Some((star_t, star_n)) => {
                    t = star_t + 1;
                    n = star_n + 1;
                    star = Some((star_t, star_n + 1));
                }
                None => return false,
            }
        }

        tokens[t..].iter().all(|token| *token == Token::AnyRun)
    }
}

/// Convenience form; an invalid pattern matches nothing.
pub fn matches(name: &str, pattern: &str) -> bool {
    Pattern::new(pattern)
        .map(|compiled| compiled.matches(name))
        .unwrap_or(false)
}
