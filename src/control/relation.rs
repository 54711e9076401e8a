// src/control/relation.rs

//! Package relation expressions
//!
//! A relation is a comma-separated conjunction of groups; a group is a
//! pipe-separated list of alternatives; an alternative names a package
//! with an optional version constraint, architecture list and build
//! restriction formula.

use super::ArchSet;
use super::restrict::RestrictFormula;
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::ops::{Deref, DerefMut, Neg};

static ENTRY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<name>\S+)(?: \((?P<operator><<|<=|=|!=|>=|>>)\s*(?P<version>[^)]+)\))?(?: \[(?P<arches>[^\]]+)\])?(?P<restrictions>(?: <[^>]+>)*)$",
    )
    .unwrap()
});

/// Version comparison operator in a relation entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOperator {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl VersionOperator {
    pub fn parse(v: &str) -> Result<Self> {
        match v {
            "<<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            "=" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            ">=" => Ok(Self::Ge),
            ">>" => Ok(Self::Gt),
            _ => Err(Error::Parse(format!("invalid version operator \"{v}\""))),
        }
    }
}

impl Neg for VersionOperator {
    type Output = Self;

    /// The strict complement: `<<` ↔ `>=`, `<=` ↔ `>>`, `=` ↔ `!=`
    fn neg(self) -> Self {
        match self {
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Ge => Self::Lt,
            Self::Gt => Self::Le,
        }
    }
}

impl fmt::Display for VersionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lt => "<<",
            Self::Le => "<=",
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Ge => ">=",
            Self::Gt => ">>",
        })
    }
}

/// One alternative inside a relation group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationEntry {
    pub name: String,
    pub operator: Option<VersionOperator>,
    pub version: Option<String>,
    pub arches: ArchSet,
    pub restrictions: RestrictFormula,
}

impl RelationEntry {
    pub fn parse(v: &str) -> Result<Self> {
        let caps = ENTRY_RE
            .captures(v)
            .ok_or_else(|| Error::Parse(format!("unable to parse dependency \"{v}\"")))?;

        let operator = match caps.name("operator") {
            Some(op) => Some(VersionOperator::parse(op.as_str())?),
            None => None,
        };

        Ok(Self {
            name: caps["name"].to_string(),
            operator,
            version: caps.name("version").map(|m| m.as_str().to_string()),
            arches: caps
                .name("arches")
                .map(|m| ArchSet::parse(m.as_str()))
                .unwrap_or_default(),
            restrictions: RestrictFormula::parse(
                caps.name("restrictions").map_or("", |m| m.as_str()),
            )?,
        })
    }

    /// A bare entry with just a package name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            operator: None,
            version: None,
            arches: ArchSet::new(),
            restrictions: RestrictFormula::new(),
        }
    }

    /// Equality on everything except the architecture set, used to decide
    /// whether two groups can merge
    fn merge_eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.operator == other.operator
            && self.version == other.version
            && self.restrictions == other.restrictions
    }
}

impl fmt::Display for RelationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let (Some(operator), Some(version)) = (&self.operator, &self.version) {
            write!(f, " ({operator} {version})")?;
        }
        if !self.arches.is_empty() {
            write!(f, " [{}]", self.arches)?;
        }
        if !self.restrictions.is_empty() {
            write!(f, " {}", self.restrictions)?;
        }
        Ok(())
    }
}

/// Alternatives joined by `|`: the first satisfiable one applies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationGroup(Vec<RelationEntry>);

impl RelationGroup {
    pub fn parse(v: &str) -> Result<Self> {
        Self::parse_with_arches(v, None)
    }

    /// Parse, forcing the given architecture set onto every entry
    pub fn parse_with_arches(v: &str, arches: Option<&ArchSet>) -> Result<Self> {
        let mut entries = Vec::new();
        for part in v.trim().split('|') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut entry = RelationEntry::parse(part)?;
            if let Some(arches) = arches {
                entry.arches = arches.clone();
            }
            entries.push(entry);
        }
        Ok(Self(entries))
    }

    fn merge_eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.merge_eq(b))
    }
}

impl FromIterator<RelationEntry> for RelationGroup {
    fn from_iter<I: IntoIterator<Item = RelationEntry>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Deref for RelationGroup {
    type Target = Vec<RelationEntry>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RelationGroup {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for RelationGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{entry}")?;
            first = false;
        }
        Ok(())
    }
}

/// Groups joined by `,`: all must hold
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relation(Vec<RelationGroup>);

impl Relation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(v: &str) -> Result<Self> {
        Self::parse_with_arches(v, None)
    }

    pub fn parse_with_arches(v: &str, arches: Option<&ArchSet>) -> Result<Self> {
        let mut groups = Vec::new();
        for part in v.trim().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            groups.push(RelationGroup::parse_with_arches(part, arches)?);
        }
        Ok(Self(groups))
    }

    /// Merge a group: if an existing group matches entry-for-entry on
    /// everything but arches, union the architecture sets; otherwise
    /// append the group as a new conjunct.
    pub fn merge(&mut self, group: RelationGroup) {
        for existing in &mut self.0 {
            if existing.merge_eq(&group) {
                for (entry, new) in existing.0.iter_mut().zip(group.0) {
                    entry.arches.extend(new.arches.iter().cloned());
                }
                return;
            }
        }
        self.0.push(group);
    }
}

impl FromIterator<RelationGroup> for Relation {
    fn from_iter<I: IntoIterator<Item = RelationGroup>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Deref for Relation {
    type Target = Vec<RelationGroup>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Relation {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for group in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{group}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_parse_full() {
        let e = RelationEntry::parse("package (>=version) [arch2 arch1] <profile1 >").unwrap();
        assert_eq!(e.name, "package");
        assert_eq!(e.operator, Some(VersionOperator::Ge));
        assert_eq!(e.version.as_deref(), Some("version"));
        assert_eq!(e.arches.to_string(), "arch1 arch2");
        assert_eq!(
            e.to_string(),
            "package (>= version) [arch1 arch2] <profile1>"
        );
    }

    #[test]
    fn test_entry_parse_bare() {
        let e = RelationEntry::parse("libc6").unwrap();
        assert_eq!(e.name, "libc6");
        assert_eq!(e.operator, None);
        assert_eq!(e.version, None);
        assert!(e.arches.is_empty());
        assert!(e.restrictions.is_empty());
    }

    #[test]
    fn test_entry_parse_invalid() {
        assert!(RelationEntry::parse("").is_err());
        assert!(RelationEntry::parse("foo (>= 1.0").is_err());
        assert!(RelationEntry::parse("foo bar").is_err());
    }

    #[test]
    fn test_operator_double_negation() {
        use VersionOperator::*;
        for op in [Lt, Le, Eq, Ne, Ge, Gt] {
            assert_eq!(-(-op), op);
        }
        assert_eq!(-Lt, Ge);
        assert_eq!(-Le, Gt);
        assert_eq!(-Eq, Ne);
    }

    #[test]
    fn test_group_parse() {
        let g = RelationGroup::parse("foo | bar").unwrap();
        assert_eq!(g.len(), 2);
        assert_eq!(g[0].name, "foo");
        assert_eq!(g[1].name, "bar");
        assert_eq!(g.to_string(), "foo | bar");
    }

    #[test]
    fn test_group_str_normalizes() {
        let g = RelationGroup::parse("foo|  bar").unwrap();
        assert_eq!(g.to_string(), "foo | bar");
    }

    #[test]
    fn test_relation_parse() {
        let r = Relation::parse("foo1 | foo2, bar").unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].len(), 2);
        assert_eq!(r[0][0].name, "foo1");
        assert_eq!(r[0][1].name, "foo2");
        assert_eq!(r[1].len(), 1);
        assert_eq!(r[1][0].name, "bar");
        assert_eq!(r.to_string(), "foo1 | foo2, bar");
    }

    #[test]
    fn test_merge_unions_arches() {
        let mut r = Relation::parse("gcc-12 [amd64]").unwrap();
        let g = RelationGroup::parse("gcc-12 [arm64]").unwrap();
        r.merge(g);
        assert_eq!(r.len(), 1);
        assert_eq!(r.to_string(), "gcc-12 [amd64 arm64]");
    }

    #[test]
    fn test_merge_appends_on_mismatch() {
        let mut r = Relation::parse("gcc-12 [amd64]").unwrap();
        r.merge(RelationGroup::parse("gcc-12 (>= 12.1) [arm64]").unwrap());
        assert_eq!(r.len(), 2);

        // Differing restrictions also prevent merging
        r.merge(RelationGroup::parse("gcc-12 [i386] <cross>").unwrap());
        assert_eq!(r.len(), 3);
    }

    #[test]
    fn test_merge_respects_group_length() {
        let mut r = Relation::parse("foo [amd64] | bar [amd64]").unwrap();
        r.merge(RelationGroup::parse("foo [arm64]").unwrap());
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_parse_with_arches_overrides() {
        let arches = ArchSet::parse("amd64");
        let g = RelationGroup::parse_with_arches("foo [i386]", Some(&arches)).unwrap();
        assert_eq!(g[0].arches.to_string(), "amd64");
    }

    #[test]
    fn test_round_trip() {
        for s in [
            "foo",
            "foo (>= 1.0)",
            "foo (<< 2:1.0-1) [amd64] <!cross>",
            "foo | bar, baz (= 1.2)",
        ] {
            let r = Relation::parse(s).unwrap();
            assert_eq!(Relation::parse(&r.to_string()).unwrap(), r);
        }
    }
}
