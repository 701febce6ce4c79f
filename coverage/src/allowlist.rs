// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::Path;

use anyhow::Result;
use regex::{Regex, RegexSet, RegexSetBuilder};

/// Source document filter built from glob rules.
///
/// A document is allowed if it matches some allow rule and no deny rule.
/// Windows paths match case-insensitively, whatever the host.
#[derive(Clone, Debug)]
pub struct AllowList {
    allow: Rules,
    deny: Rules,
}

#[derive(Clone, Debug)]
struct Rules {
    exact: RegexSet,
    ignore_case: RegexSet,
}

impl Rules {
    fn new(exact: RegexSet) -> Result<Self> {
        let ignore_case = RegexSetBuilder::new(exact.patterns())
            .case_insensitive(true)
            .build()?;

        Ok(Self { exact, ignore_case })
    }

    fn is_match(&self, path: &str, ignore_case: bool) -> bool {
        if ignore_case {
            self.ignore_case.is_match(path)
        } else {
            self.exact.is_match(path)
        }
    }
}

impl AllowList {
    pub fn new(allow: RegexSet, deny: RegexSet) -> Result<Self> {
        Ok(Self {
            allow: Rules::new(allow)?,
            deny: Rules::new(deny)?,
        })
    }

    /// Build from include and exclude globs. No include globs allows everything.
    pub fn from_globs(include: &[String], exclude: &[String]) -> Result<Self> {
        let allow = if include.is_empty() {
            vec![glob_to_regex("**")?]
        } else {
            include
                .iter()
                .map(|glob| glob_to_regex(glob))
                .collect::<Result<Vec<_>>>()?
        };

        let deny = exclude
            .iter()
            .map(|glob| glob_to_regex(glob))
            .collect::<Result<Vec<_>>>()?;

        Self::from_rules(&allow, &deny)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse one rule per line: `<glob>` allows, `! <glob>` denies, `# ...` is a comment.
    pub fn parse(text: &str) -> Result<Self> {
        let mut allow = vec![];
        let mut deny = vec![];

        for (index, line) in text.lines().enumerate() {
            match AllowListLine::parse(line) {
                Ok(AllowListLine::Blank | AllowListLine::Comment) => {}
                Ok(AllowListLine::Allow(re)) => allow.push(re),
                Ok(AllowListLine::Deny(re)) => deny.push(re),
                Err(err) => {
                    warn!("ignoring invalid source rule at line {}: {}", index + 1, err);
                }
            }
        }

        Self::from_rules(&allow, &deny)
    }

    fn from_rules(allow: &[Regex], deny: &[Regex]) -> Result<Self> {
        let allow = RegexSet::new(allow.iter().map(|re| re.as_str()))?;
        let deny = RegexSet::new(deny.iter().map(|re| re.as_str()))?;

        Self::new(allow, deny)
    }

    /// Whether `path` is allowed, comparing case-insensitively if it is a Windows path.
    pub fn is_allowed(&self, path: impl AsRef<str>) -> bool {
        let path = path.as_ref();
        self.matches(path, is_windows_path(path))
    }

    /// Whether `path` is allowed, with the case rule chosen by the caller.
    ///
    /// Use this when `path` was derived from a document whose style decides
    /// the case rule, such as a path made relative to a source root.
    pub fn matches(&self, path: impl AsRef<str>, ignore_case: bool) -> bool {
        let path = normalize(path.as_ref());
        self.allow.is_match(&path, ignore_case) && !self.deny.is_match(&path, ignore_case)
    }
}

impl Default for AllowList {
    fn default() -> Self {
        // Unwrap-safe due to valid constant expr.
        let allow = RegexSet::new([".*"]).unwrap();

        AllowList {
            allow: Rules {
                ignore_case: allow.clone(),
                exact: allow,
            },
            deny: Rules {
                exact: RegexSet::empty(),
                ignore_case: RegexSet::empty(),
            },
        }
    }
}

/// Drive-letter, UNC, and backslash-separated paths are Windows paths.
pub fn is_windows_path(path: &str) -> bool {
    let drive = matches!(path.as_bytes(), [letter, b':', ..] if letter.is_ascii_alphabetic());
    drive || path.contains('\\')
}

pub enum AllowListLine {
    Blank,
    Comment,
    Allow(Regex),
    Deny(Regex),
}

impl AllowListLine {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();

        if line.is_empty() {
            return Ok(Self::Blank);
        }

        if line.starts_with('#') {
            return Ok(Self::Comment);
        }

        if let Some(expr) = line.strip_prefix("! ") {
            return Ok(Self::Deny(glob_to_regex(expr.trim())?));
        }

        Ok(Self::Allow(glob_to_regex(line)?))
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// `**` matches across directories, `*` and `?` within one path segment.
fn glob_to_regex(glob: &str) -> Result<Regex> {
    let glob = normalize(glob);
    let mut expr = String::from("^");
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();

                // `**/` also matches no directories at all.
                if chars.peek() == Some(&'/') {
                    chars.next();
                    expr.push_str("(?:.*/)?");
                } else {
                    expr.push_str(".*");
                }
            }
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }

    expr.push('$');

    Ok(Regex::new(&expr)?)
}
