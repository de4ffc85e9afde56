//! `-only` / `-except` job filtering.
//!
//! Patterns use shell-style globs: `*` and `?` wildcards, `[...]` and
//! `[!...]` character classes, `{a,b}` alternation and `\` escapes. A
//! pattern must match the whole job name.

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::errors::GlobError;
use regex::Regex;
use std::fmt;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    /// Compiles `pattern`.
    pub fn compile(pattern: &str) -> Result<Self, GlobError> {
        let mut re = String::with_capacity(pattern.len() * 2 + 2);
        re.push('^');
        let mut alternations = 0usize;
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                '\\' => {
                    let escaped = chars.next().ok_or(GlobError::TrailingEscape)?;
                    re.push_str(&regex::escape(escaped.encode_utf8(&mut [0; 4])));
                }
                '[' => {
                    re.push('[');
                    let mut first = true;
                    let mut closed = false;
                    while let Some(c) = chars.next() {
                        match c {
                            ']' => {
                                closed = true;
                                break;
                            }
                            '!' if first => re.push('^'),
                            '\\' => {
                                let escaped = chars.next().ok_or(GlobError::TrailingEscape)?;
                                re.push('\\');
                                re.push(escaped);
                            }
                            '[' | '^' | '&' | '~' => {
                                re.push('\\');
                                re.push(c);
                            }
                            _ => re.push(c),
                        }
                        first = false;
                    }
                    if !closed {
                        return Err(GlobError::Unclosed { open: '[' });
                    }
                    re.push(']');
                }
                '{' => {
                    alternations += 1;
                    re.push_str("(?:");
                }
                '}' if alternations > 0 => {
                    alternations -= 1;
                    re.push(')');
                }
                ',' if alternations > 0 => re.push('|'),
                other => re.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }

        if alternations > 0 {
            return Err(GlobError::Unclosed { open: '{' });
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| GlobError::Regex(e.to_string()))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// Returns true if `name` matches the whole pattern.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Display for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// Compiled `-only` and `-except` patterns plus match counters.
///
/// `only` is an allow-list and `except` a deny-list; they are not meant to be
/// combined. The counters feed the warnings emitted once every job name has
/// been seen.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    only: Vec<Glob>,
    except: Vec<Glob>,
    only_matches: usize,
    except_matches: usize,
}

fn compile_all(flag: &str, patterns: &[String], diags: &mut Diagnostics) -> Vec<Glob> {
    patterns
        .iter()
        .filter_map(|p| match Glob::compile(p) {
            Ok(glob) => Some(glob),
            Err(e) => {
                diags.push(Diagnostic::error(format!("Invalid -{flag} pattern {p}: {e}")));
                None
            }
        })
        .collect()
}

impl JobFilter {
    /// Compiles both pattern lists, reporting every invalid pattern.
    pub fn new(only: &[String], except: &[String]) -> Result<Self, Diagnostics> {
        let mut diags = Diagnostics::new();
        let only = compile_all("only", only, &mut diags);
        let except = compile_all("except", except, &mut diags);
        if diags.has_errors() {
            return Err(diags);
        }
        Ok(Self {
            only,
            except,
            only_matches: 0,
            except_matches: 0,
        })
    }

    /// Returns true if the job `name` should be built, counting matches.
    pub fn admit(&mut self, name: &str) -> bool {
        if !self.only.is_empty() {
            if self.only.iter().any(|g| g.matches(name)) {
                self.only_matches += 1;
                return true;
            }
            return false;
        }
        if self.except.iter().any(|g| g.matches(name)) {
            self.except_matches += 1;
            return false;
        }
        true
    }

    /// Returns true if a post-processor called `name` is excluded by an
    /// `-except` pattern, counting the match.
    pub fn excludes_post_processor(&mut self, name: &str) -> bool {
        if self.except.iter().any(|g| g.matches(name)) {
            self.except_matches += 1;
            return true;
        }
        false
    }

    /// Number of names admitted by `-only`.
    #[must_use]
    pub fn only_matches(&self) -> usize {
        self.only_matches
    }

    /// Number of names rejected by `-except`.
    #[must_use]
    pub fn except_matches(&self) -> usize {
        self.except_matches
    }

    /// Warnings for patterns that matched fewer names than expected.
    #[must_use]
    pub fn unmatched_warnings(&self, possible_names: &[String]) -> Diagnostics {
        let mut diags = Diagnostics::new();
        let detail = || {
            let hint = possible_names
                .first()
                .and_then(|n| n.split('.').next())
                .unwrap_or("source");
            format!(
                "Possible build names: [{}].\nThese could also be matched with a glob pattern like: '{hint}.*'",
                possible_names.join(" ")
            )
        };
        if self.only.len() > self.only_matches {
            diags.push(
                Diagnostic::warning(
                    "an 'only' option was passed, but not all matches were found for the given build.",
                )
                .with_detail(detail()),
            );
        }
        if self.except.len() > self.except_matches {
            diags.push(
                Diagnostic::warning("an 'except' option was passed, but did not match any build.")
                    .with_detail(detail()),
            );
        }
        diags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn names() -> Vec<String> {
        vec!["a1".into(), "a2".into(), "b1".into()]
    }

    #[test]
    fn test_glob_syntax() {
        let glob = Glob::compile("docker.*").unwrap();
        assert!(glob.matches("docker.ubuntu"));
        assert!(!glob.matches("web.docker.ubuntu"));

        assert!(Glob::compile("a?").unwrap().matches("a1"));
        assert!(!Glob::compile("a?").unwrap().matches("a12"));
        assert!(Glob::compile("[ab]1").unwrap().matches("b1"));
        assert!(!Glob::compile("[!ab]1").unwrap().matches("b1"));
        assert!(Glob::compile("{web,db}.*").unwrap().matches("db.docker.x"));
        assert!(Glob::compile(r"a\*").unwrap().matches("a*"));
        assert!(!Glob::compile(r"a\*").unwrap().matches("ab"));
        assert!(Glob::compile("a.b").unwrap().matches("a.b"));
        assert!(!Glob::compile("a.b").unwrap().matches("axb"));
    }

    #[test]
    fn test_glob_errors() {
        assert_eq!(
            Glob::compile("[ab").unwrap_err(),
            GlobError::Unclosed { open: '[' }
        );
        assert_eq!(
            Glob::compile("{a,b").unwrap_err(),
            GlobError::Unclosed { open: '{' }
        );
        assert_eq!(Glob::compile("a\\").unwrap_err(), GlobError::TrailingEscape);
    }

    #[test]
    fn test_only_admits_matching() {
        let mut filter = JobFilter::new(&["a*".into()], &[]).unwrap();
        let admitted: Vec<String> = names().into_iter().filter(|n| filter.admit(n)).collect();
        assert_eq!(admitted, vec!["a1".to_string(), "a2".to_string()]);
        assert_eq!(filter.only_matches(), 2);
        assert!(filter.unmatched_warnings(&names()).is_empty());
    }

    #[test]
    fn test_except_rejects_matching() {
        let mut filter = JobFilter::new(&[], &["a*".into()]).unwrap();
        let admitted: Vec<String> = names().into_iter().filter(|n| filter.admit(n)).collect();
        assert_eq!(admitted, vec!["b1".to_string()]);
        assert_eq!(filter.except_matches(), 2);
    }

    #[test]
    fn test_unmatched_patterns_warn() {
        let mut filter = JobFilter::new(&["a1".into(), "zz".into()], &[]).unwrap();
        for n in names() {
            filter.admit(&n);
        }
        let warnings = filter.unmatched_warnings(&names());
        assert_eq!(warnings.len(), 1);
        let warning = warnings.iter().next().unwrap();
        assert!(!warning.is_error());
        assert!(warning.detail.as_deref().unwrap().contains("[a1 a2 b1]"));

        let filter = JobFilter::new(&[], &["nothing".into()]).unwrap();
        let warnings = filter.unmatched_warnings(&names());
        assert_eq!(
            warnings.iter().next().unwrap().summary,
            "an 'except' option was passed, but did not match any build."
        );
    }

    #[test]
    fn test_invalid_patterns_become_diagnostics() {
        let diags = JobFilter::new(&["[a".into()], &["{b".into()]).unwrap_err();
        assert_eq!(diags.len(), 2);
        assert!(diags.iter().next().unwrap().summary.starts_with("Invalid -only pattern [a"));
    }
}
