//! Pattern algebra over slash-delimited key paths
//!
//! A pattern is a key path whose segments may contain glob syntax:
//!
//! | Syntax | Matches |
//! |---|---|
//! | `*` | any run of characters inside one segment |
//! | `?` | exactly one character |
//! | `[a-z]`, `[^0-9]`, `[!x]` | one character in (or not in) the class |
//! | `\c` | the literal character `c` |
//!
//! Segment boundaries are significant: a wildcard never matches across `/`.
//!
//! ## Totality
//!
//! Matching never fails with an error. A malformed pattern (unclosed class,
//! trailing escape, empty class) simply matches nothing.
//!
//! ## Prefixes
//!
//! [`prefix_for_pattern`] and [`common_prefix_for_patterns`] only ever return
//! literal text cut at a `/` boundary, so their results can be fetched or
//! watched directly.

/// Whether `c` starts glob syntax and therefore ends a literal prefix
fn is_meta(c: u8) -> bool {
    matches!(c, b'*' | b'?' | b'[' | b'\\')
}

/// One compiled element of a pattern segment
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    Star,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

impl Token {
    fn matches(&self, c: char) -> bool {
        match self {
            Token::Literal(l) => *l == c,
            Token::AnyChar => true,
            Token::Star => false,
            Token::Class { negated, ranges } => {
                let hit = ranges.iter().any(|&(lo, hi)| lo <= c && c <= hi);
                hit != *negated
            }
        }
    }
}

/// Compile one segment, returning `None` if it is malformed
fn compile_segment(segment: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = segment.chars().peekable();

    while let Some(c) = chars.next() {
        let token = match c {
            '*' => {
                if tokens.last() == Some(&Token::Star) {
                    continue;
                }
                Token::Star
            }
            '?' => Token::AnyChar,
            '\\' => Token::Literal(chars.next()?),
            '[' => {
                let negated = matches!(chars.peek(), Some('^') | Some('!'));
                if negated {
                    chars.next();
                }

                let mut ranges = Vec::new();
                loop {
                    let lo = match chars.next()? {
                        ']' if !ranges.is_empty() => break,
                        ']' | '-' => return None,
                        '\\' => chars.next()?,
                        other => other,
                    };
                    let hi = if chars.peek() == Some(&'-') {
                        chars.next();
                        match chars.next()? {
                            ']' | '-' => return None,
                            '\\' => chars.next()?,
                            other => other,
                        }
                    } else {
                        lo
                    };
                    ranges.push((lo, hi));
                }
                Token::Class { negated, ranges }
            }
            other => Token::Literal(other),
        };
        tokens.push(token);
    }

    Some(tokens)
}

/// Match a compiled segment against one path segment
fn match_tokens(tokens: &[Token], name: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    let (mut t, mut n) = (0, 0);
    // Position to resume from when the most recent star has to swallow one more char
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if let Some(token) = tokens.get(t) {
            if *token == Token::Star {
                backtrack = Some((t, n));
                t += 1;
                continue;
            }
            if token.matches(name[n]) {
                t += 1;
                n += 1;
                continue;
            }
        }
        match backtrack {
            Some((star_t, star_n)) => {
                backtrack = Some((star_t, star_n + 1));
                t = star_t + 1;
                n = star_n + 1;
            }
            None => return false,
        }
    }

    tokens[t..].iter().all(|token| *token == Token::Star)
}

/// Compile every segment of a pattern, `None` if any segment is malformed
fn compile(pattern: &str) -> Option<Vec<Vec<Token>>> {
    pattern.split('/').map(compile_segment).collect()
}

/// Exact, segment-count-sensitive glob match of `path` against `pattern`
///
/// `path` and `pattern` must have the same number of `/`-delimited segments
/// and every segment must match.
///
/// # Example
///
/// ```rust
/// use hostdns_core::pattern::match_path;
///
/// assert!(match_path("/services/www/1", "/services/www/*"));
/// assert!(!match_path("/services/www/1/extra", "/services/www/*"));
/// ```
pub fn match_path(path: &str, pattern: &str) -> bool {
    let Some(compiled) = compile(pattern) else {
        return false;
    };

    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() != compiled.len() {
        return false;
    }

    segments
        .iter()
        .zip(&compiled)
        .all(|(segment, tokens)| match_tokens(tokens, segment))
}

/// Directory-prefix match of `path` against `pattern`
///
/// Only the segments both sides have are compared. A `path` shorter than the
/// pattern matches as long as its segments do (it may be a directory that
/// contains matches); a longer `path` matches if its leading segments do
/// (it lies inside a matched subtree). This is deliberately more permissive
/// than [`match_path`].
///
/// # Example
///
/// ```rust
/// use hostdns_core::pattern::match_path_prefix;
///
/// assert!(match_path_prefix("/services/www", "/services/www/*"));
/// assert!(!match_path_prefix("/services/api", "/services/www/*"));
/// ```
pub fn match_path_prefix(path: &str, pattern: &str) -> bool {
    let Some(compiled) = compile(pattern) else {
        return false;
    };

    path.split('/')
        .zip(&compiled)
        .all(|(segment, tokens)| match_tokens(tokens, segment))
}

/// Longest literal leading path of `pattern`
///
/// Without glob syntax the pattern is returned unchanged. Otherwise the
/// result is cut after the last `/` preceding the first metacharacter.
///
/// # Example
///
/// ```rust
/// use hostdns_core::pattern::prefix_for_pattern;
///
/// assert_eq!(prefix_for_pattern("/services/www/*"), "/services/www/");
/// assert_eq!(prefix_for_pattern("/services/w*/ip"), "/services/");
/// assert_eq!(prefix_for_pattern("/services/www"), "/services/www");
/// ```
pub fn prefix_for_pattern(pattern: &str) -> &str {
    match pattern.bytes().position(is_meta) {
        None => pattern,
        Some(first_meta) => directory_prefix(pattern, first_meta),
    }
}

/// Longest literal path shared by two patterns, cut at a `/` boundary
///
/// Comparison stops at the first differing byte or at the first
/// metacharacter in either pattern, even where both patterns have the same
/// metacharacter. When one pattern is a strict prefix of the other, the
/// shorter one is returned only if it names an ancestor directory of the
/// longer one.
///
/// # Example
///
/// ```rust
/// use hostdns_core::pattern::common_prefix_for_patterns;
///
/// assert_eq!(
///     common_prefix_for_patterns("/hosts/zoneA/*", "/hosts/zoneB/www"),
///     "/hosts/"
/// );
/// ```
pub fn common_prefix_for_patterns(a: &str, b: &str) -> String {
    let (a_bytes, b_bytes) = (a.as_bytes(), b.as_bytes());
    let shared = a_bytes.len().min(b_bytes.len());

    for i in 0..shared {
        if a_bytes[i] != b_bytes[i] || is_meta(a_bytes[i]) || is_meta(b_bytes[i]) {
            return directory_prefix(a, i).to_string();
        }
    }

    if a_bytes.len() == b_bytes.len() {
        return a.to_string();
    }

    let (short, long) = if a_bytes.len() < b_bytes.len() { (a, b) } else { (b, a) };
    if long.as_bytes()[shared] == b'/' {
        short.to_string()
    } else {
        directory_prefix(short, short.len()).to_string()
    }
}

/// Whether `pattern` contains no glob syntax at all
pub fn is_literal(pattern: &str) -> bool {
    !pattern.bytes().any(is_meta)
}

/// `s[..end]` cut just after its last `/` (empty if there is none)
fn directory_prefix(s: &str, end: usize) -> &str {
    match s.as_bytes()[..end].iter().rposition(|&c| c == b'/') {
        Some(slash) => &s[..=slash],
        None => "",
    }
}
