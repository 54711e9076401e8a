// src/control/restrict.rs

//! Build restriction formulas
//!
//! A formula is a set of restriction lists; it is satisfied when at least
//! one list has every term satisfied (OR across lists, AND within a list).
//! A term names a build profile, optionally negated.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::{Deref, DerefMut};

static TERM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(!?)([^()\[\]<>,!\s]+)$").unwrap());
static LIST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^()\[\]<>,]+$").unwrap());
static FORMULA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r" *<([^>]+)>(?: +|$)").unwrap());

/// A single build profile term, e.g. `cross` or `!nodoc`
///
/// Terms order by profile name, with the non-negated form first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RestrictTerm {
    pub profile: String,
    pub negated: bool,
}

impl RestrictTerm {
    pub fn parse(v: &str) -> Result<Self> {
        let caps = TERM_RE
            .captures(v)
            .ok_or_else(|| Error::Parse(format!("invalid restriction term \"{v}\"")))?;
        Ok(Self {
            negated: !caps[1].is_empty(),
            profile: caps[2].to_string(),
        })
    }

    pub fn new(profile: &str, negated: bool) -> Self {
        Self {
            profile: profile.to_string(),
            negated,
        }
    }
}

impl fmt::Display for RestrictTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("!")?;
        }
        f.write_str(&self.profile)
    }
}

/// A conjunction of terms, rendered space-separated inside one `<...>`
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RestrictList(BTreeSet<RestrictTerm>);

impl RestrictList {
    pub fn parse(v: &str) -> Result<Self> {
        if !LIST_RE.is_match(v) {
            return Err(Error::Parse(format!("invalid restriction list \"{v}\"")));
        }
        let terms = v
            .split_whitespace()
            .map(RestrictTerm::parse)
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Self(terms))
    }

    /// All terms satisfied by the profile set
    pub fn satisfied_by(&self, profiles: &BTreeSet<String>) -> bool {
        self.0
            .iter()
            .all(|term| profiles.contains(&term.profile) != term.negated)
    }
}

impl FromIterator<RestrictTerm> for RestrictList {
    fn from_iter<I: IntoIterator<Item = RestrictTerm>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Deref for RestrictList {
    type Target = BTreeSet<RestrictTerm>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RestrictList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for RestrictList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for term in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{term}")?;
            first = false;
        }
        Ok(())
    }
}

/// A set of restriction lists, rendered `<a b> <c>`
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RestrictFormula(BTreeSet<RestrictList>);

impl RestrictFormula {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a formula; angle-bracket groups must cover the whole input,
    /// separated only by whitespace
    pub fn parse(v: &str) -> Result<Self> {
        let mut formula = Self::default();
        if v.is_empty() {
            return Ok(formula);
        }

        let mut pos = 0;
        for caps in FORMULA_RE.captures_iter(v) {
            let whole = caps.get(0).expect("match always has a group 0");
            if whole.start() != pos {
                break;
            }
            pos = whole.end();
            formula.0.insert(RestrictList::parse(&caps[1])?);
        }
        if pos != v.len() {
            return Err(Error::Parse(format!("invalid restriction formula \"{v}\"")));
        }
        Ok(formula)
    }

    /// Satisfied when at least one list is fully satisfied. An empty
    /// formula is always satisfied.
    pub fn satisfied_by(&self, profiles: &BTreeSet<String>) -> bool {
        self.0.is_empty() || self.0.iter().any(|list| list.satisfied_by(profiles))
    }

    /// Narrow the formula by a further term, required in every list. On an
    /// empty formula the term becomes the sole restriction.
    pub fn with_term(&self, term: RestrictTerm) -> Self {
        if self.0.is_empty() {
            return Self(BTreeSet::from([RestrictList::from_iter([term])]));
        }
        Self(
            self.0
                .iter()
                .map(|list| {
                    let mut list = list.clone();
                    list.insert(term.clone());
                    list
                })
                .collect(),
        )
    }
}

impl Deref for RestrictFormula {
    type Target = BTreeSet<RestrictList>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RestrictFormula {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for RestrictFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for list in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "<{list}>")?;
            first = false;
        }
        Ok(())
    }
}

/// A conservative check that a profile is unconditionally required: true
/// iff the formula is non-empty and every list carries the unnegated term.
pub fn restriction_requires_profile(formula: &RestrictFormula, profile: &str) -> bool {
    if formula.is_empty() {
        return false;
    }
    let term = RestrictTerm::new(profile, false);
    formula.iter().all(|list| list.contains(&term))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profiles(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_term_parse() {
        let t = RestrictTerm::parse("cross").unwrap();
        assert_eq!(t.profile, "cross");
        assert!(!t.negated);

        let t = RestrictTerm::parse("!nodoc").unwrap();
        assert_eq!(t.profile, "nodoc");
        assert!(t.negated);
        assert_eq!(t.to_string(), "!nodoc");
    }

    #[test]
    fn test_term_invalid() {
        assert!(RestrictTerm::parse("").is_err());
        assert!(RestrictTerm::parse("a b").is_err());
        assert!(RestrictTerm::parse("<a>").is_err());
    }

    #[test]
    fn test_term_ordering() {
        // Non-negated sorts before negated for the same profile
        let plain = RestrictTerm::new("a", false);
        let negated = RestrictTerm::new("a", true);
        assert!(plain < negated);
        assert!(RestrictTerm::new("a", true) < RestrictTerm::new("b", false));
    }

    #[test]
    fn test_list_display_sorted() {
        let l = RestrictList::parse("b !a c").unwrap();
        assert_eq!(l.to_string(), "!a b c");
    }

    #[test]
    fn test_formula_parse() {
        let f = RestrictFormula::parse("<a b> <c>").unwrap();
        assert_eq!(f.len(), 2);
        assert_eq!(f.to_string(), "<a b> <c>");
    }

    #[test]
    fn test_formula_parse_partial_match_fails() {
        assert!(RestrictFormula::parse("<a b> junk <c>").is_err());
        assert!(RestrictFormula::parse("junk").is_err());
        assert!(RestrictFormula::parse("<a b>junk").is_err());
    }

    #[test]
    fn test_formula_parse_empty() {
        let f = RestrictFormula::parse("").unwrap();
        assert!(f.is_empty());
    }

    #[test]
    fn test_formula_satisfaction() {
        let f = RestrictFormula::parse("<a b> <c>").unwrap();
        assert!(f.satisfied_by(&profiles(&["a", "b"])));
        assert!(f.satisfied_by(&profiles(&["c"])));
        assert!(!f.satisfied_by(&profiles(&["a"])));
    }

    #[test]
    fn test_formula_negated_satisfaction() {
        let f = RestrictFormula::parse("<!nodoc>").unwrap();
        assert!(f.satisfied_by(&profiles(&[])));
        assert!(!f.satisfied_by(&profiles(&["nodoc"])));
    }

    #[test]
    fn test_requires_profile() {
        let f = RestrictFormula::parse("<a b> <a c>").unwrap();
        assert!(restriction_requires_profile(&f, "a"));
        assert!(!restriction_requires_profile(&f, "b"));

        let f = RestrictFormula::parse("<a> <c>").unwrap();
        assert!(!restriction_requires_profile(&f, "a"));

        // An empty formula requires nothing
        let f = RestrictFormula::new();
        assert!(!restriction_requires_profile(&f, "a"));

        // A negated term does not count as required
        let f = RestrictFormula::parse("<!a>").unwrap();
        assert!(!restriction_requires_profile(&f, "a"));
    }

    #[test]
    fn test_with_term() {
        let f = RestrictFormula::parse("<a> <b>").unwrap();
        let f = f.with_term(RestrictTerm::parse("!quick").unwrap());
        assert_eq!(f.to_string(), "<a !quick> <b !quick>");

        let f = RestrictFormula::new().with_term(RestrictTerm::parse("!quick").unwrap());
        assert_eq!(f.to_string(), "<!quick>");
    }
}
