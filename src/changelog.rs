// src/changelog.rs

//! Changelog reader
//!
//! Only the first entry drives generation; the rest of the file is still
//! parsed so a malformed changelog fails the run instead of being
//! silently truncated.

use crate::error::{Error, Result};
use crate::version::Version;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Deref;
use std::path::Path;

static TOP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
^
(?P<source>
    \w[-+0-9a-z.]+
)
\x20
\(
(?P<version>
    [^()\ \t]+
)
\)
\s+
(?P<distribution>
    [-+0-9a-zA-Z.]+
)
;\s+urgency=
(?P<urgency>
    \w+
)
(?:,|$)
",
    )
    .unwrap()
});

static BOTTOM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
^
\x20--\x20
(?P<maintainer>
    \S(?:\x20?\S)*
)
\x20\x20
(?P<date>
    .*
)
$
",
    )
    .unwrap()
});

static IGNORE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:  |\s*$)").unwrap());

/// One changelog entry
#[derive(Debug, Clone)]
pub struct ChangelogEntry {
    pub source: String,
    pub version: Version,
    pub distribution: String,
    pub urgency: String,
    pub maintainer: String,
    pub date: String,
}

/// The parsed changelog, newest entry first
#[derive(Debug, Clone)]
pub struct Changelog(Vec<ChangelogEntry>);

impl Changelog {
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = Vec::new();
        let mut top: Option<(String, Version, String, String)> = None;

        for (line_no, line) in text.lines().enumerate() {
            let line_no = line_no + 1;

            if IGNORE_RE.is_match(line) {
                continue;
            }
            match top.take() {
                None => {
                    let caps = TOP_RE.captures(line).ok_or_else(|| {
                        Error::Parse(format!("invalid top line {line_no} in changelog"))
                    })?;
                    let version = Version::parse(&caps["version"])?;
                    top = Some((
                        caps["source"].to_string(),
                        version,
                        caps["distribution"].to_string(),
                        caps["urgency"].to_string(),
                    ));
                }
                Some((source, version, distribution, urgency)) => {
                    let caps = BOTTOM_RE.captures(line).ok_or_else(|| {
                        Error::Parse(format!("invalid bottom line {line_no} in changelog"))
                    })?;
                    entries.push(ChangelogEntry {
                        source,
                        version,
                        distribution,
                        urgency,
                        maintainer: caps["maintainer"].to_string(),
                        date: caps["date"].to_string(),
                    });
                }
            }
        }

        if entries.is_empty() {
            return Err(Error::Parse("changelog has no complete entry".to_string()));
        }
        Ok(Self(entries))
    }

    /// The newest entry
    pub fn head(&self) -> &ChangelogEntry {
        &self.0[0]
    }
}

impl Deref for Changelog {
    type Target = [ChangelogEntry];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANGELOG: &str = "\
linux (6.1.7-1) unstable; urgency=medium

  * New upstream stable update.

 -- A Maintainer <maint@example.org>  Mon, 23 Jan 2023 08:30:00 +0100

linux (6.1.6-1) unstable; urgency=medium

  * New upstream stable update.

 -- A Maintainer <maint@example.org>  Sat, 14 Jan 2023 13:12:18 +0100
";

    #[test]
    fn test_parse_two_entries() {
        let changelog = Changelog::parse(CHANGELOG).unwrap();
        assert_eq!(changelog.len(), 2);
        let head = changelog.head();
        assert_eq!(head.source, "linux");
        assert_eq!(head.version.complete(), "6.1.7-1");
        assert_eq!(head.distribution, "unstable");
        assert_eq!(head.urgency, "medium");
        assert_eq!(head.maintainer, "A Maintainer <maint@example.org>");
        assert_eq!(changelog[1].version.complete(), "6.1.6-1");
    }

    #[test]
    fn test_parse_binary_only_marker() {
        let text = "\
linux (6.1.7-1) unstable; urgency=medium, binary-only=yes

  * Rebuild.

 -- A Maintainer <maint@example.org>  Mon, 23 Jan 2023 08:30:00 +0100
";
        let changelog = Changelog::parse(text).unwrap();
        assert_eq!(changelog.head().urgency, "medium");
    }

    #[test]
    fn test_invalid_top_line() {
        let err = Changelog::parse("not a changelog\n").unwrap_err();
        assert!(err.to_string().contains("top line 1"));
    }

    #[test]
    fn test_invalid_bottom_line() {
        let text = "\
linux (6.1.7-1) unstable; urgency=medium

  * Entry.

 -- broken trailer line
";
        // A single space between maintainer and date is malformed
        assert!(Changelog::parse(text).is_err());
    }

    #[test]
    fn test_empty_changelog() {
        assert!(Changelog::parse("").is_err());
    }
}
