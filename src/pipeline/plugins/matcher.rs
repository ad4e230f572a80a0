//! Name pattern matching for rules files
//!
//! All file-driven modules share one pattern grammar, applied to
//! normalized (lowercased, no trailing dot) names:
//!
//! | Pattern | Meaning |
//! |---|---|
//! | `=example.com` | exactly `example.com` |
//! | `*.example.com` or `.example.com` | `example.com` and any subdomain |
//! | `ads.*` | any name starting with `ads.` |
//! | `*tracker*` | any name containing `tracker` |
//! | `example.com` | `example.com` and any subdomain |
//!
//! Rules files are plain text, one pattern per line; `#` starts a
//! comment. A pattern may be followed by whitespace and a value column
//! whose interpretation belongs to the module loading the file.

use std::fs;
use std::path::Path;

use crate::dnsutil::normalize_qname;
use crate::error::{ProxyError, ProxyResult};

/// How one pattern matches
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    Exact,
    Prefix,
    Suffix,
    Substring,
}

/// A compiled set of name patterns, each carrying a value
///
/// Exact patterns are matched first through a hash lookup, the scan
/// lists after; for the list sizes policy files reach in practice this
/// is fast enough and keeps reloads trivial.
#[derive(Debug, Default)]
pub struct NamePatterns<T> {
    exact: std::collections::HashMap<String, T>,
    prefixes: Vec<(String, T)>,
    suffixes: Vec<(String, T)>,
    substrings: Vec<(String, T)>,
}

impl<T> NamePatterns<T> {
    /// An empty set
    pub fn new() -> Self {
        Self {
            exact: std::collections::HashMap::new(),
            prefixes: Vec::new(),
            suffixes: Vec::new(),
            substrings: Vec::new(),
        }
    }

    /// Number of compiled patterns
    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len() + self.suffixes.len() + self.substrings.len()
    }

    /// Whether the set holds no patterns
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compile one pattern with its value
    pub fn add(&mut self, pattern: &str, value: T) -> ProxyResult<()> {
        let (kind, needle) = parse_pattern(pattern)?;
        match kind {
            PatternKind::Exact => {
                self.exact.insert(needle, value);
            }
            PatternKind::Prefix => self.prefixes.push((needle, value)),
            PatternKind::Suffix => self.suffixes.push((needle, value)),
            PatternKind::Substring => self.substrings.push((needle, value)),
        }
        Ok(())
    }

    /// Value of the first pattern matching `name`
    ///
    /// `name` must already be normalized; exact patterns win over scans.
    pub fn lookup(&self, name: &str) -> Option<&T> {
        if let Some(value) = self.exact.get(name) {
            return Some(value);
        }
        for (suffix, value) in &self.suffixes {
            if name == suffix || name.ends_with(&format!(".{suffix}")) {
                return Some(value);
            }
        }
        for (prefix, value) in &self.prefixes {
            if name.starts_with(prefix.as_str()) {
                return Some(value);
            }
        }
        for (needle, value) in &self.substrings {
            if name.contains(needle.as_str()) {
                return Some(value);
            }
        }
        None
    }
}

fn parse_pattern(pattern: &str) -> ProxyResult<(PatternKind, String)> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(ProxyError::config("empty name pattern"));
    }
    if let Some(rest) = pattern.strip_prefix('=') {
        return Ok((PatternKind::Exact, normalize_qname(rest)));
    }
    if pattern.starts_with('*') && pattern.ends_with('*') && pattern.len() > 2 {
        let inner = &pattern[1..pattern.len() - 1];
        return Ok((PatternKind::Substring, inner.to_lowercase()));
    }
    if let Some(rest) = pattern.strip_prefix("*.") {
        return Ok((PatternKind::Suffix, normalize_qname(rest)));
    }
    if let Some(rest) = pattern.strip_prefix('.') {
        return Ok((PatternKind::Suffix, normalize_qname(rest)));
    }
    if let Some(rest) = pattern.strip_suffix('*') {
        return Ok((PatternKind::Prefix, rest.to_lowercase()));
    }
    Ok((PatternKind::Suffix, normalize_qname(pattern)))
}

/// Iterate the meaningful lines of a rules file
///
/// Yields `(pattern, rest)` per line, where `rest` is the remainder
/// after the first whitespace run (empty when the line is bare).
pub fn read_rules_file(path: &Path) -> ProxyResult<Vec<(String, String)>> {
    let content = fs::read_to_string(path).map_err(|e| {
        ProxyError::config(format!("cannot read rules file {}: {e}", path.display()))
    })?;
    let mut rules = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(char::is_whitespace) {
            Some((pattern, rest)) => rules.push((pattern.to_string(), rest.trim().to_string())),
            None => rules.push((line.to_string(), String::new())),
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn set(patterns: &[&str]) -> NamePatterns<()> {
        let mut compiled = NamePatterns::new();
        for pattern in patterns {
            compiled.add(pattern, ()).unwrap();
        }
        compiled
    }

    #[test]
    fn test_exact_pattern() {
        let patterns = set(&["=ads.example.com"]);
        assert!(patterns.lookup("ads.example.com").is_some());
        assert!(patterns.lookup("sub.ads.example.com").is_none());
        assert!(patterns.lookup("example.com").is_none());
    }

    #[test]
    fn test_bare_pattern_matches_subdomains() {
        let patterns = set(&["example.com"]);
        assert!(patterns.lookup("example.com").is_some());
        assert!(patterns.lookup("www.example.com").is_some());
        assert!(patterns.lookup("deep.www.example.com").is_some());
        assert!(patterns.lookup("notexample.com").is_none());
    }

    #[test]
    fn test_wildcard_suffix_pattern() {
        let patterns = set(&["*.tracker.net"]);
        assert!(patterns.lookup("tracker.net").is_some());
        assert!(patterns.lookup("a.tracker.net").is_some());
        assert!(patterns.lookup("nottracker.net").is_none());
    }

    #[test]
    fn test_prefix_pattern() {
        let patterns = set(&["ads.*"]);
        assert!(patterns.lookup("ads.example.com").is_some());
        assert!(patterns.lookup("ads.other.net").is_some());
        assert!(patterns.lookup("www.ads.example.com").is_none());
    }

    #[test]
    fn test_substring_pattern() {
        let patterns = set(&["*metrics*"]);
        assert!(patterns.lookup("metrics.example.com").is_some());
        assert!(patterns.lookup("www.appmetrics.net").is_some());
        assert!(patterns.lookup("example.com").is_none());
    }

    #[test]
    fn test_lookup_is_case_normalized() {
        let patterns = set(&["=ADS.Example.COM"]);
        assert!(patterns.lookup("ads.example.com").is_some());
    }

    #[test]
    fn test_empty_pattern_is_rejected() {
        let mut patterns = NamePatterns::new();
        assert!(patterns.add("", ()).is_err());
        assert!(patterns.add("   ", ()).is_err());
    }

    #[test]
    fn test_len_and_is_empty() {
        let patterns = set(&["a.com", "=b.com", "c.*", "*d*"]);
        assert_eq!(patterns.len(), 4);
        assert!(!patterns.is_empty());
        assert!(NamePatterns::<()>::new().is_empty());
    }

    #[test]
    fn test_read_rules_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# blocklist").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "ads.example.com").unwrap();
        writeln!(file, "cloaked.example.com  10.0.0.1  # forged").unwrap();
        file.flush().unwrap();

        let rules = read_rules_file(file.path()).unwrap();
        assert_eq!(
            rules,
            vec![
                ("ads.example.com".to_string(), String::new()),
                ("cloaked.example.com".to_string(), "10.0.0.1".to_string()),
            ]
        );
    }

    #[test]
    fn test_read_rules_file_missing() {
        let err = read_rules_file(Path::new("/nonexistent/rules.txt")).unwrap_err();
        assert!(err.to_string().contains("rules file"));
    }
}
