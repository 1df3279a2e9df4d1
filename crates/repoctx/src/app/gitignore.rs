//! Gitignore-style exclusion patterns compiled to path predicates.
//!
//! Matching is additive: a path is excluded when any pattern matches it. Negated patterns
//! (`!foo`) are compiled literally and never re-include a path.

use regex::Regex;

/// One compiled pattern line.
#[derive(Debug, Clone)]
pub struct GitignorePattern {
    raw: String,
    matcher: Option<Regex>,
    is_directory_pattern: bool,
}

impl GitignorePattern {
    /// Compile a single pattern line. Blank lines, comments and unparseable patterns yield a
    /// pattern that never matches.
    pub fn compile(raw: &str) -> Self {
        let never = |is_directory_pattern| Self {
            raw: raw.to_owned(),
            matcher: None,
            is_directory_pattern,
        };

        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            return never(false);
        }

        let is_directory_pattern = line.ends_with('/');
        let body = line.trim_end_matches('/');
        let anchored = body.starts_with('/');
        let body = body.trim_start_matches('/');
        if body.is_empty() {
            return never(is_directory_pattern);
        }
        if body.starts_with('!') {
            tracing::debug!(pattern = raw, "negated gitignore pattern treated as exclusion");
        }

        let glob = regex::escape(body).replace(r"\*", ".*").replace(r"\?", ".");
        let prefix = if anchored { "^" } else { "(?:^|/)" };
        let source = format!("{prefix}{glob}(?P<nested>/.*)?$");

        match Regex::new(&source) {
            Ok(regex) => Self {
                raw: raw.to_owned(),
                matcher: Some(regex),
                is_directory_pattern,
            },
            Err(err) => {
                tracing::debug!(pattern = raw, error = %err, "ignoring unparseable gitignore pattern");
                never(is_directory_pattern)
            }
        }
    }

    /// The pattern line as written.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_directory_pattern(&self) -> bool {
        self.is_directory_pattern
    }

    /// Match a path whose kind is unknown; directory patterns match the path itself or anything
    /// nested below it.
    pub fn matches(&self, path: &str) -> bool {
        self.matcher.as_ref().is_some_and(|re| re.is_match(path))
    }

    /// Match a path with a known kind: a directory pattern matches a file only when one of its
    /// ancestor directories matches.
    pub fn matches_entry(&self, path: &str, is_dir: bool) -> bool {
        let Some(re) = self.matcher.as_ref() else {
            return false;
        };
        if !self.is_directory_pattern || is_dir {
            return re.is_match(path);
        }
        path.match_indices('/')
            .any(|(index, _)| re.is_match(&path[..index]))
    }
}

/// Compiled set of gitignore patterns.
#[derive(Debug, Clone, Default)]
pub struct GitignoreMatcher {
    patterns: Vec<GitignorePattern>,
}

impl GitignoreMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(|raw| GitignorePattern::compile(raw.as_ref()))
                .collect(),
        }
    }

    /// Parse the contents of a `.gitignore` file, one pattern per line.
    pub fn from_file_contents(contents: &str) -> Self {
        Self::new(contents.lines())
    }

    pub fn patterns(&self) -> &[GitignorePattern] {
        &self.patterns
    }

    /// True when no pattern can match anything.
    pub fn is_empty(&self) -> bool {
        self.patterns.iter().all(|pattern| pattern.matcher.is_none())
    }

    pub fn excludes(&self, path: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.matches(path))
    }

    pub fn excludes_entry(&self, path: &str, is_dir: bool) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches_entry(path, is_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_glob_matches_anywhere() {
        let matcher = GitignoreMatcher::new(["*.md"]);
        assert!(matcher.excludes("README.md"));
        assert!(matcher.excludes("docs/guide.md"));
        assert!(!matcher.excludes("src/App.tsx"));
    }

    #[test]
    fn directory_pattern_matches_descendants() {
        let matcher = GitignoreMatcher::new(["tests/"]);
        assert!(matcher.excludes("tests/App.test.ts"));
        assert!(matcher.excludes("pkg/tests/unit/a.rs"));
        assert!(!matcher.excludes("contests/a.rs"));
        assert!(matcher.excludes_entry("tests", true));
        assert!(!matcher.excludes_entry("tests", false));
    }

    #[test]
    fn leading_slash_anchors_to_root() {
        let matcher = GitignoreMatcher::new(["/build"]);
        assert!(matcher.excludes("build"));
        assert!(matcher.excludes("build/out.js"));
        assert!(!matcher.excludes("web/build/out.js"));
    }

    #[test]
    fn question_mark_matches_one_character() {
        let matcher = GitignoreMatcher::new(["file?.txt"]);
        assert!(matcher.excludes("file1.txt"));
        assert!(!matcher.excludes("file10.txt"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let matcher = GitignoreMatcher::new(["a+b(1).txt"]);
        assert!(matcher.excludes("a+b(1).txt"));
        assert!(!matcher.excludes("aab1.txt"));
    }

    #[test]
    fn comments_and_blank_lines_never_match() {
        let matcher = GitignoreMatcher::from_file_contents("# comment\n\n   \n");
        assert!(matcher.is_empty());
        assert!(!matcher.excludes("# comment"));
        assert!(!matcher.excludes("anything"));
    }

    #[test]
    fn glob_directory_pattern_matches_files_beneath_it() {
        let matcher = GitignoreMatcher::new(["src*/"]);
        assert!(matcher.excludes_entry("srcgen/lib.rs", false));
        assert!(matcher.excludes_entry("crates/src_old/deep/mod.rs", false));
        assert!(matcher.excludes_entry("srcgen", true));
        assert!(!matcher.excludes_entry("srcgen.rs", false));
        assert!(!matcher.excludes_entry("lib/main.rs", false));
    }

    #[test]
    fn negation_does_not_reinclude() {
        let matcher = GitignoreMatcher::new(["*.log", "!keep.log"]);
        assert!(matcher.excludes("keep.log"));
    }
}
