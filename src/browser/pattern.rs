use std::fmt;

/// A glob pattern matched against full request URLs
///
/// Two wildcards are supported:
/// - `*` matches any run of characters, including `/` and the empty run
/// - `?` matches exactly one character
///
/// Every other character matches itself. The pattern must match the whole
/// URL, so a pattern meant to match anywhere should start and end with `*`.
///
/// # Examples
///
/// ```
/// use siphon::browser::UrlPattern;
///
/// let pattern = UrlPattern::new("*api/search*");
/// assert!(pattern.matches("https://example.com/api/search?page=2"));
/// assert!(!pattern.matches("https://example.com/static/app.js"));
///
/// let exact = UrlPattern::new("https://example.com/feed.json");
/// assert!(exact.matches("https://example.com/feed.json"));
/// assert!(!exact.matches("https://example.com/feed.json?x=1"));
/// ```
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UrlPattern {
    raw: String,
}

impl UrlPattern {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Checks whether `url` matches this pattern
    pub fn matches(&self, url: &str) -> bool {
        glob_match(self.raw.as_bytes(), url.as_bytes())
    }
}

impl From<&str> for UrlPattern {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for UrlPattern {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UrlPattern({:?})", self.raw)
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Iterative glob matcher with single-star backtracking
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Position of the last `*` seen and the text index it is currently absorbing up to
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p + 1;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}
