// src/version.rs

//! Debian version string parsing and classification
//!
//! A version splits into epoch, upstream and revision on the first `:` and
//! the last `-`. The kernel-specific [`KernelVersion`] further decomposes
//! the upstream and revision parts to derive the release flags that gate
//! upload policy.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static EPOCH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());
static UPSTREAM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9][A-Za-z0-9.+\-:~]*$").unwrap());
static REVISION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9+.~]+$").unwrap());

/// A Debian package version: `[epoch:]upstream[-revision]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub epoch: Option<u32>,
    pub upstream: String,
    pub revision: Option<String>,
}

impl Version {
    /// Parse a version string, splitting the epoch on the first `:` and
    /// the revision on the last `-`
    pub fn parse(v: &str) -> Result<Self> {
        let (epoch, rest) = match v.find(':') {
            Some(i) => (Some(&v[..i]), &v[i + 1..]),
            None => (None, v),
        };
        let (upstream, revision) = match rest.rfind('-') {
            Some(i) => (&rest[..i], Some(&rest[i + 1..])),
            None => (rest, None),
        };

        if epoch.is_some_and(|e| !EPOCH_RE.is_match(e))
            || !UPSTREAM_RE.is_match(upstream)
            || revision.is_some_and(|r| !REVISION_RE.is_match(r))
        {
            return Err(Error::InvalidVersion(v.to_string()));
        }

        let epoch = match epoch {
            Some(e) => Some(
                e.parse()
                    .map_err(|_| Error::InvalidVersion(v.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            epoch,
            upstream: upstream.to_string(),
            revision: revision.map(str::to_string),
        })
    }

    /// The full version including the epoch
    pub fn complete(&self) -> String {
        match self.epoch {
            Some(epoch) => format!("{}:{}", epoch, self.complete_noepoch()),
            None => self.complete_noepoch(),
        }
    }

    /// The version without the epoch
    pub fn complete_noepoch(&self) -> String {
        match &self.revision {
            Some(revision) => format!("{}-{}", self.upstream, revision),
            None => self.upstream.clone(),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.complete())
    }
}

static KERNEL_UPSTREAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
^
(?P<version>
    \d+\.\d+
)
(?P<update>
    (?:\.\d+)?
    (?:-[a-z]+\d+)?
)
(?:
    ~
    (?P<modifier>
        .+?
    )
)?
(?:
    \.dfsg\.
    (?P<dfsg>
        \d+
    )
)?
$
",
    )
    .unwrap()
});

static KERNEL_REVISION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
^
\d+
(\.\d+)?
(?:
    (?P<revision_experimental>
        ~exp\d+
    )
    |
    (?P<revision_security>
        (?:[~+]deb\d+u\d+)+
    )?
    (?P<revision_backports>
        ~bpo\d+\+\d+
    )?
    |
    (?P<revision_other>
        .+?
    )
)
(?:\+b\d+)?
$
",
    )
    .unwrap()
});

/// A kernel source package version
///
/// The upstream part decomposes into the kernel version, a stable update
/// suffix, an optional pre-release modifier (`~rc3`) and an optional dfsg
/// repack counter. The revision classifies the upload: experimental,
/// security, backports or other. Construction fails unless both grammars
/// fully match.
#[derive(Debug, Clone)]
pub struct KernelVersion {
    /// The underlying Debian version
    pub debian: Version,
    /// Major.minor kernel version, e.g. "6.1"
    pub version: String,
    /// Kernel version plus pre-release modifier, e.g. "6.1-rc3"
    pub upstream: String,
    /// Upstream plus the stable update suffix, e.g. "6.1.7"
    pub upstream_full: String,
    /// Pre-release modifier without the tilde, e.g. "rc3"
    pub modifier: Option<String>,
    /// dfsg repack counter
    pub dfsg: Option<String>,
    pub revision_experimental: bool,
    pub revision_security: bool,
    pub revision_backports: bool,
    pub revision_other: bool,
}

impl KernelVersion {
    pub fn parse(v: &str) -> Result<Self> {
        let debian = Version::parse(v)?;

        let revision = debian
            .revision
            .as_deref()
            .ok_or_else(|| Error::InvalidVersion(v.to_string()))?;
        let up_match = KERNEL_UPSTREAM_RE
            .captures(&debian.upstream)
            .ok_or_else(|| Error::InvalidVersion(v.to_string()))?;
        let rev_match = KERNEL_REVISION_RE
            .captures(revision)
            .ok_or_else(|| Error::InvalidVersion(v.to_string()))?;

        let version = up_match["version"].to_string();
        let update = &up_match["update"];
        let modifier = up_match.name("modifier").map(|m| m.as_str().to_string());

        // A pre-release modifier and a stable update are mutually exclusive
        let upstream = match &modifier {
            Some(modifier) => {
                if !update.is_empty() {
                    return Err(Error::InvalidVersion(v.to_string()));
                }
                format!("{version}-{modifier}")
            }
            None => version.clone(),
        };
        let upstream_full = format!("{upstream}{update}");

        Ok(Self {
            version,
            upstream,
            upstream_full,
            modifier,
            dfsg: up_match.name("dfsg").map(|m| m.as_str().to_string()),
            revision_experimental: rev_match.name("revision_experimental").is_some(),
            revision_security: rev_match.name("revision_security").is_some(),
            revision_backports: rev_match.name("revision_backports").is_some(),
            revision_other: rev_match.name("revision_other").is_some(),
            debian,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native() {
        let v = Version::parse("1.2+c~4").unwrap();
        assert_eq!(v.epoch, None);
        assert_eq!(v.upstream, "1.2+c~4");
        assert_eq!(v.revision, None);
        assert_eq!(v.complete(), "1.2+c~4");
        assert_eq!(v.complete_noepoch(), "1.2+c~4");
    }

    #[test]
    fn test_nonnative() {
        let v = Version::parse("1-2+d~3").unwrap();
        assert_eq!(v.epoch, None);
        assert_eq!(v.upstream, "1");
        assert_eq!(v.revision.as_deref(), Some("2+d~3"));
        assert_eq!(v.complete(), "1-2+d~3");
    }

    #[test]
    fn test_nonnative_epoch() {
        let v = Version::parse("5:1.2.3-4").unwrap();
        assert_eq!(v.epoch, Some(5));
        assert_eq!(v.upstream, "1.2.3");
        assert_eq!(v.revision.as_deref(), Some("4"));
        assert_eq!(v.complete(), "5:1.2.3-4");
        assert_eq!(v.complete_noepoch(), "1.2.3-4");
    }

    #[test]
    fn test_multi_hyphen() {
        // The last hyphen wins
        let v = Version::parse("1-2-3").unwrap();
        assert_eq!(v.upstream, "1-2");
        assert_eq!(v.revision.as_deref(), Some("3"));
        assert_eq!(v.complete(), "1-2-3");
    }

    #[test]
    fn test_multi_colon() {
        // The first colon wins; upstream may contain colons
        let v = Version::parse("1:2:3").unwrap();
        assert_eq!(v.epoch, Some(1));
        assert_eq!(v.upstream, "2:3");
        assert_eq!(v.revision, None);
    }

    #[test]
    fn test_round_trip() {
        for s in ["1.2+c~4", "5:1.2.3-4", "1-2-3", "1:2:3"] {
            let v = Version::parse(s).unwrap();
            assert_eq!(Version::parse(&v.complete()).unwrap(), v);
        }
    }

    #[test]
    fn test_invalid_epoch() {
        assert!(Version::parse("a:1").is_err());
        assert!(Version::parse("-1:1").is_err());
        assert!(Version::parse("1a:1").is_err());
    }

    #[test]
    fn test_invalid_upstream() {
        assert!(Version::parse("1_2").is_err());
        assert!(Version::parse("1/2").is_err());
        assert!(Version::parse("a1").is_err());
        assert!(Version::parse("1 2").is_err());
    }

    #[test]
    fn test_invalid_revision() {
        assert!(Version::parse("1-2_3").is_err());
        assert!(Version::parse("1-2/3").is_err());
        assert!(Version::parse("1-2:3").is_err());
    }

    #[test]
    fn test_kernel_stable() {
        let v = KernelVersion::parse("1.2.3-4").unwrap();
        assert_eq!(v.version, "1.2");
        assert_eq!(v.upstream, "1.2");
        assert_eq!(v.upstream_full, "1.2.3");
        assert_eq!(v.modifier, None);
        assert_eq!(v.dfsg, None);
        assert!(!v.revision_experimental);
        assert!(!v.revision_security);
        assert!(!v.revision_backports);
        assert!(!v.revision_other);
    }

    #[test]
    fn test_kernel_rc() {
        let v = KernelVersion::parse("1.2~rc3-4").unwrap();
        assert_eq!(v.version, "1.2");
        assert_eq!(v.upstream, "1.2-rc3");
        assert_eq!(v.upstream_full, "1.2-rc3");
        assert_eq!(v.modifier.as_deref(), Some("rc3"));
    }

    #[test]
    fn test_kernel_dfsg() {
        let v = KernelVersion::parse("1.2~rc3.dfsg.1-4").unwrap();
        assert_eq!(v.upstream_full, "1.2-rc3");
        assert_eq!(v.dfsg.as_deref(), Some("1"));
    }

    #[test]
    fn test_kernel_experimental() {
        let v = KernelVersion::parse("1.2~rc3-4~exp5").unwrap();
        assert!(v.revision_experimental);
        assert!(!v.revision_security);
        assert!(!v.revision_backports);
        assert!(!v.revision_other);
    }

    #[test]
    fn test_kernel_security() {
        let v = KernelVersion::parse("1.2.3-4+deb10u1").unwrap();
        assert!(!v.revision_experimental);
        assert!(v.revision_security);
        assert!(!v.revision_backports);
        assert!(!v.revision_other);
    }

    #[test]
    fn test_kernel_backports() {
        let v = KernelVersion::parse("1.2.3-4~bpo9+10").unwrap();
        assert!(!v.revision_security);
        assert!(v.revision_backports);
        assert!(!v.revision_other);
    }

    #[test]
    fn test_kernel_security_backports() {
        let v = KernelVersion::parse("1.2.3-4+deb10u1~bpo9+10").unwrap();
        assert!(v.revision_security);
        assert!(v.revision_backports);
        assert!(!v.revision_other);
    }

    #[test]
    fn test_kernel_lts_backports() {
        // A backport shipped through a -security suite carries only the
        // security marker, not the backports one
        let v = KernelVersion::parse("1.2.3-4~deb9u10").unwrap();
        assert!(v.revision_security);
        assert!(!v.revision_backports);
        assert!(!v.revision_other);
    }

    #[test]
    fn test_kernel_binnmu() {
        let v = KernelVersion::parse("1.2.3-4+b1").unwrap();
        assert!(!v.revision_experimental);
        assert!(!v.revision_security);
        assert!(!v.revision_backports);
        assert!(!v.revision_other);
    }

    #[test]
    fn test_kernel_other_revision() {
        let v = KernelVersion::parse("4.16.5-1+revert+crng+ready").unwrap();
        assert!(v.revision_other);

        let v = KernelVersion::parse("4.16.5-1+revert+crng+ready+b1").unwrap();
        assert!(v.revision_other);
    }

    #[test]
    fn test_kernel_requires_revision() {
        assert!(KernelVersion::parse("1.2.3").is_err());
    }
}
