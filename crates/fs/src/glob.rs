use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GlobError {
    #[error("invalid glob pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },

    #[error("IO error while walking {path}: {source}")]
    Walk {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A file matched by a glob list, with its path relative to the package
/// directory (`..`-prefixed for ancestor lockfiles).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedFile {
    pub absolute: PathBuf,
    pub relative: String,
}

enum Entry {
    Matcher { matcher: GlobMatcher, negated: bool },
    Literal { relative: String, negated: bool },
}

/// An ordered glob list: `!pattern` excludes, and the last matching pattern
/// decides. Literal patterns (no glob metacharacters) may reach above the
/// package directory with `../` segments; wildcard patterns match only
/// within it.
pub struct PatternMatcher {
    entries: Vec<Entry>,
}

fn is_literal(pattern: &str) -> bool {
    !pattern
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '{' | '}'))
}

impl PatternMatcher {
    pub fn new(patterns: &[String]) -> Result<Self, GlobError> {
        let mut entries = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let (pattern, negated) = match raw.strip_prefix('!') {
                Some(rest) => (rest, true),
                None => (raw.as_str(), false),
            };
            if is_literal(pattern) {
                entries.push(Entry::Literal {
                    relative: pattern.to_string(),
                    negated,
                });
            } else {
                let matcher = GlobBuilder::new(pattern)
                    .literal_separator(true)
                    .build()
                    .map_err(|source| GlobError::InvalidPattern {
                        pattern: raw.clone(),
                        source,
                    })?
                    .compile_matcher();
                entries.push(Entry::Matcher { matcher, negated });
            }
        }
        Ok(Self { entries })
    }

    /// Whether `relative` is included, taking declaration order into account.
    pub fn decide(&self, relative: &str) -> bool {
        let mut included = false;
        for entry in &self.entries {
            match entry {
                Entry::Matcher { matcher, negated } => {
                    if matcher.is_match(relative) {
                        included = !negated;
                    }
                }
                Entry::Literal {
                    relative: pattern,
                    negated,
                } => {
                    if pattern == relative {
                        included = !negated;
                    }
                }
            }
        }
        included
    }

    fn literal_candidates(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Literal {
                relative,
                negated: false,
            } => Some(relative.as_str()),
            _ => None,
        })
    }

    fn has_wildcards(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| matches!(entry, Entry::Matcher { negated: false, .. }))
    }
}

/// Expand a glob list against a package directory.
///
/// Returns matched regular files sorted by relative path. Symlinks are not
/// followed. The walk ignores nothing: freshness must see every file the
/// patterns name, whether or not it is tracked by git.
pub fn expand_globs(package_dir: &Path, patterns: &[String]) -> Result<Vec<MatchedFile>, GlobError> {
    let matcher = PatternMatcher::new(patterns)?;
    let mut matched: BTreeMap<String, PathBuf> = BTreeMap::new();

    for relative in matcher.literal_candidates() {
        let absolute = package_dir.join(relative);
        if absolute.is_file() && matcher.decide(relative) {
            matched.insert(relative.to_string(), absolute);
        }
    }

    if matcher.has_wildcards() {
        let walker = WalkBuilder::new(package_dir)
            .standard_filters(false)
            .hidden(false)
            .follow_links(false)
            .build();
        for entry in walker {
            let entry = entry.map_err(|source| GlobError::Walk {
                path: package_dir.to_path_buf(),
                source: std::io::Error::other(source),
            })?;
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(package_dir) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if matcher.decide(&relative) {
                matched.insert(relative, entry.path().to_path_buf());
            }
        }
    }

    Ok(matched
        .into_iter()
        .map(|(relative, absolute)| MatchedFile { absolute, relative })
        .collect())
}
