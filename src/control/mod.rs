// src/control/mod.rs

//! Typed control records
//!
//! Control records come in a closed set of kinds (source, binary, tests),
//! each with a fixed set of typed fields. Unknown fields are kept in a
//! side table and logged, so a template with an unexpected key degrades
//! instead of failing the run. `Meta-*` fields on binary records feed the
//! rule-graph extraction and are never rendered.

pub mod relation;
pub mod restrict;

use crate::error::{Error, Result};
use crate::rules::MakeFlags;
use relation::Relation;
use restrict::RestrictFormula;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::ops::{Deref, DerefMut};
use tracing::warn;

/// A set of Debian architecture names, rendered sorted and space-joined
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchSet(BTreeSet<String>);

impl ArchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(v: &str) -> Self {
        Self(v.split_whitespace().map(str::to_string).collect())
    }

    pub fn add(&mut self, arch: &str) {
        self.0.insert(arch.to_string());
    }

    /// True for the arch-independent set, exactly `{all}`
    pub fn is_all(&self) -> bool {
        self.0.len() == 1 && self.0.contains("all")
    }
}

impl FromIterator<String> for ArchSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Deref for ArchSet {
    type Target = BTreeSet<String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ArchSet {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Display for ArchSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arch in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            f.write_str(arch)?;
            first = false;
        }
        Ok(())
    }
}

/// Greedy word wrap; continuation formatting is added by the caller
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    for word in text.split_whitespace() {
        if !line.is_empty() && line.len() + 1 + word.len() > width {
            lines.push(std::mem::take(&mut line));
        }
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(word);
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

/// A package description: comma-joined synopsis parts plus long paragraphs
///
/// Long paragraphs wrap at column 74 and are separated by a continuation
/// line holding a single `.`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub short: Vec<String>,
    pub long: Vec<String>,
}

impl Description {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(v: &str) -> Self {
        let mut desc = Self::default();
        match v.split_once('\n') {
            Some((short, long)) => {
                desc.append_short(short);
                desc.append(long);
            }
            None => desc.append_short(v),
        }
        desc
    }

    pub fn append(&mut self, long: &str) {
        let long = long.trim();
        if !long.is_empty() {
            self.long.extend(long.split("\n.\n").map(str::to_string));
        }
    }

    pub fn append_short(&mut self, short: &str) {
        for part in short.split(',') {
            let part = part.trim();
            if !part.is_empty() {
                self.short.push(part.to_string());
            }
        }
    }

    pub fn extend(&mut self, desc: &Description) {
        self.short.extend(desc.short.iter().cloned());
        self.long.extend(desc.long.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.short.is_empty() && self.long.is_empty()
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.short.join(", ");
        let long = self
            .long
            .iter()
            .map(|par| wrap(par, 74).join("\n "))
            .collect::<Vec<_>>()
            .join("\n .\n ");
        if long.is_empty() {
            f.write_str(&short)
        } else {
            write!(f, "{short}\n {long}")
        }
    }
}

/// Build-time annotations attached to a binary record, never rendered
///
/// `Meta-Rules-Target` from a template names the rules.real target of the
/// package; the walker fills in the per-rule make flags and the
/// accumulated architecture set.
#[derive(Debug, Clone)]
pub struct PackageMeta {
    pub rules_target: Option<String>,
    pub rules: BTreeMap<String, MakeFlags>,
    pub architectures: ArchSet,
    pub check_packages: bool,
    pub raw: BTreeMap<String, String>,
}

impl Default for PackageMeta {
    fn default() -> Self {
        Self {
            rules_target: None,
            rules: BTreeMap::new(),
            architectures: ArchSet::new(),
            check_packages: true,
            raw: BTreeMap::new(),
        }
    }
}

impl PackageMeta {
    fn set(&mut self, key: &str, value: &str) {
        match key {
            "rules-target" => self.rules_target = Some(value.to_string()),
            _ => {
                self.raw.insert(key.to_string(), value.to_string());
            }
        }
    }
}

/// Common interface for the closed set of control record kinds
pub trait ControlRecord: Default {
    /// Record kind name used in warnings
    const KIND: &'static str;

    /// Set a field from its rendered name and value. Typed fields parse
    /// their value; unknown fields are logged and kept in the side table.
    fn set_field(&mut self, name: &str, value: &str) -> Result<()>;

    /// Non-empty fields in rendering order, unknown fields last
    fn fields(&self) -> Vec<(String, String)>;
}

/// Parse a sequence of records from RFC-822 text: `Name: value` headers,
/// indented continuation lines, `#` comments stripped, blank-line
/// separated stanzas.
pub fn read_rfc822<T: ControlRecord>(text: &str) -> Result<Vec<T>> {
    let mut entries = Vec::new();
    let mut record = T::default();
    let mut seen = false;
    let mut last: Option<String> = None;
    let mut lines: Vec<String> = Vec::new();

    let flush = |record: &mut T,
                     last: &mut Option<String>,
                     lines: &mut Vec<String>,
                     seen: &mut bool|
     -> Result<()> {
        if let Some(name) = last.take() {
            record.set_field(&name, &lines.join("\n"))?;
            lines.clear();
            *seen = true;
        }
        Ok(())
    };

    for line in text.lines() {
        if line.starts_with('#') {
            continue;
        }
        if line.is_empty() {
            flush(&mut record, &mut last, &mut lines, &mut seen)?;
            if seen {
                entries.push(std::mem::take(&mut record));
                seen = false;
            }
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            if last.is_none() {
                return Err(Error::Parse(
                    "continuation line seen before first header".to_string(),
                ));
            }
            lines.push(line.trim_start().to_string());
            continue;
        }
        flush(&mut record, &mut last, &mut lines, &mut seen)?;
        let Some(i) = line.find(':') else {
            return Err(Error::Parse(format!(
                "not a header, not a continuation: \"{line}\""
            )));
        };
        last = Some(line[..i].to_string());
        lines.push(line[i + 1..].trim_start().to_string());
    }

    flush(&mut record, &mut last, &mut lines, &mut seen)?;
    if seen {
        entries.push(record);
    }
    Ok(entries)
}

/// Render one record followed by the blank stanza separator
pub fn write_record<W: Write>(out: &mut W, record: &impl ControlRecord) -> std::io::Result<()> {
    for (name, value) in record.fields() {
        writeln!(out, "{name}: {value}")?;
    }
    writeln!(out)
}

fn push_str(fields: &mut Vec<(String, String)>, name: &str, value: &str) {
    if !value.is_empty() {
        fields.push((name.to_string(), value.to_string()));
    }
}

fn push_display(fields: &mut Vec<(String, String)>, name: &str, value: &impl fmt::Display) {
    let rendered = value.to_string();
    if !rendered.is_empty() {
        fields.push((name.to_string(), rendered));
    }
}

fn push_unknown(fields: &mut Vec<(String, String)>, unknown: &BTreeMap<String, String>) {
    for (name, value) in unknown {
        fields.push((name.clone(), value.clone()));
    }
}

/// The source package record
#[derive(Debug, Clone, Default)]
pub struct SourcePackage {
    pub source: String,
    pub architecture: ArchSet,
    pub section: String,
    pub priority: String,
    pub maintainer: String,
    pub uploaders: String,
    pub standards_version: String,
    pub build_depends: Relation,
    pub build_depends_arch: Relation,
    pub build_depends_indep: Relation,
    pub rules_requires_root: String,
    pub homepage: String,
    pub vcs_browser: String,
    pub vcs_git: String,
    pub xs_autobuild: String,
    pub unknown: BTreeMap<String, String>,
}

impl ControlRecord for SourcePackage {
    const KIND: &'static str = "source";

    fn set_field(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "Source" => self.source = value.to_string(),
            "Architecture" => self.architecture = ArchSet::parse(value),
            "Section" => self.section = value.to_string(),
            "Priority" => self.priority = value.to_string(),
            "Maintainer" => self.maintainer = value.to_string(),
            "Uploaders" => self.uploaders = value.to_string(),
            "Standards-Version" => self.standards_version = value.to_string(),
            "Build-Depends" => self.build_depends = Relation::parse(value)?,
            "Build-Depends-Arch" => self.build_depends_arch = Relation::parse(value)?,
            "Build-Depends-Indep" => self.build_depends_indep = Relation::parse(value)?,
            "Rules-Requires-Root" => self.rules_requires_root = value.to_string(),
            "Homepage" => self.homepage = value.to_string(),
            "Vcs-Browser" => self.vcs_browser = value.to_string(),
            "Vcs-Git" => self.vcs_git = value.to_string(),
            "XS-Autobuild" => self.xs_autobuild = value.to_string(),
            _ => {
                warn!("setting unknown field {} in {} record", name, Self::KIND);
                self.unknown.insert(name.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        push_str(&mut fields, "Source", &self.source);
        push_display(&mut fields, "Architecture", &self.architecture);
        push_str(&mut fields, "Section", &self.section);
        push_str(&mut fields, "Priority", &self.priority);
        push_str(&mut fields, "Maintainer", &self.maintainer);
        push_str(&mut fields, "Uploaders", &self.uploaders);
        push_str(&mut fields, "Standards-Version", &self.standards_version);
        push_display(&mut fields, "Build-Depends", &self.build_depends);
        push_display(&mut fields, "Build-Depends-Arch", &self.build_depends_arch);
        push_display(&mut fields, "Build-Depends-Indep", &self.build_depends_indep);
        push_str(&mut fields, "Rules-Requires-Root", &self.rules_requires_root);
        push_str(&mut fields, "Homepage", &self.homepage);
        push_str(&mut fields, "Vcs-Browser", &self.vcs_browser);
        push_str(&mut fields, "Vcs-Git", &self.vcs_git);
        push_str(&mut fields, "XS-Autobuild", &self.xs_autobuild);
        push_unknown(&mut fields, &self.unknown);
        fields
    }
}

/// A binary package record
///
/// Build-Depends* fields are not allowed on binary packages in the real
/// control file; they are pseudo-fields that move to the source record
/// after the walk.
#[derive(Debug, Clone, Default)]
pub struct BinaryPackage {
    pub package: String,
    pub package_type: String,
    pub architecture: ArchSet,
    pub section: String,
    pub priority: String,
    pub build_depends: Relation,
    pub build_depends_arch: Relation,
    pub build_depends_indep: Relation,
    pub build_profiles: RestrictFormula,
    pub built_using: Relation,
    pub provides: Relation,
    pub pre_depends: Relation,
    pub depends: Relation,
    pub recommends: Relation,
    pub suggests: Relation,
    pub replaces: Relation,
    pub breaks: Relation,
    pub conflicts: Relation,
    pub multi_arch: String,
    pub kernel_version: String,
    pub description: Description,
    pub homepage: String,
    pub unknown: BTreeMap<String, String>,
    pub meta: PackageMeta,
}

impl ControlRecord for BinaryPackage {
    const KIND: &'static str = "binary";

    fn set_field(&mut self, name: &str, value: &str) -> Result<()> {
        let lower = name.to_lowercase();
        if let Some(key) = lower.strip_prefix("meta-") {
            self.meta.set(key, value);
            return Ok(());
        }
        match name {
            "Package" => self.package = value.to_string(),
            "Package-Type" => self.package_type = value.to_string(),
            "Architecture" => self.architecture = ArchSet::parse(value),
            "Section" => self.section = value.to_string(),
            "Priority" => self.priority = value.to_string(),
            "Build-Depends" => self.build_depends = Relation::parse(value)?,
            "Build-Depends-Arch" => self.build_depends_arch = Relation::parse(value)?,
            "Build-Depends-Indep" => self.build_depends_indep = Relation::parse(value)?,
            "Build-Profiles" => self.build_profiles = RestrictFormula::parse(value)?,
            "Built-Using" => self.built_using = Relation::parse(value)?,
            "Provides" => self.provides = Relation::parse(value)?,
            "Pre-Depends" => self.pre_depends = Relation::parse(value)?,
            "Depends" => self.depends = Relation::parse(value)?,
            "Recommends" => self.recommends = Relation::parse(value)?,
            "Suggests" => self.suggests = Relation::parse(value)?,
            "Replaces" => self.replaces = Relation::parse(value)?,
            "Breaks" => self.breaks = Relation::parse(value)?,
            "Conflicts" => self.conflicts = Relation::parse(value)?,
            "Multi-Arch" => self.multi_arch = value.to_string(),
            "Kernel-Version" => self.kernel_version = value.to_string(),
            "Description" => self.description = Description::parse(value),
            "Homepage" => self.homepage = value.to_string(),
            _ => {
                warn!("setting unknown field {} in {} record", name, Self::KIND);
                self.unknown.insert(name.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        push_str(&mut fields, "Package", &self.package);
        push_str(&mut fields, "Package-Type", &self.package_type);
        push_display(&mut fields, "Architecture", &self.architecture);
        push_str(&mut fields, "Section", &self.section);
        push_str(&mut fields, "Priority", &self.priority);
        push_display(&mut fields, "Build-Depends", &self.build_depends);
        push_display(&mut fields, "Build-Depends-Arch", &self.build_depends_arch);
        push_display(&mut fields, "Build-Depends-Indep", &self.build_depends_indep);
        push_display(&mut fields, "Build-Profiles", &self.build_profiles);
        push_display(&mut fields, "Built-Using", &self.built_using);
        push_display(&mut fields, "Provides", &self.provides);
        push_display(&mut fields, "Pre-Depends", &self.pre_depends);
        push_display(&mut fields, "Depends", &self.depends);
        push_display(&mut fields, "Recommends", &self.recommends);
        push_display(&mut fields, "Suggests", &self.suggests);
        push_display(&mut fields, "Replaces", &self.replaces);
        push_display(&mut fields, "Breaks", &self.breaks);
        push_display(&mut fields, "Conflicts", &self.conflicts);
        push_str(&mut fields, "Multi-Arch", &self.multi_arch);
        push_str(&mut fields, "Kernel-Version", &self.kernel_version);
        push_display(&mut fields, "Description", &self.description);
        push_str(&mut fields, "Homepage", &self.homepage);
        push_unknown(&mut fields, &self.unknown);
        fields
    }
}

/// An autopkgtest control record
#[derive(Debug, Clone, Default)]
pub struct TestsControl {
    pub tests: String,
    pub test_command: String,
    pub architecture: ArchSet,
    pub restrictions: String,
    pub features: String,
    pub depends: Relation,
    pub tests_directory: String,
    pub classes: String,
    pub unknown: BTreeMap<String, String>,
}

impl ControlRecord for TestsControl {
    const KIND: &'static str = "tests";

    fn set_field(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "Tests" => self.tests = value.to_string(),
            "Test-Command" => self.test_command = value.to_string(),
            "Architecture" => self.architecture = ArchSet::parse(value),
            "Restrictions" => self.restrictions = value.to_string(),
            "Features" => self.features = value.to_string(),
            "Depends" => self.depends = Relation::parse(value)?,
            "Tests-Directory" => self.tests_directory = value.to_string(),
            "Classes" => self.classes = value.to_string(),
            _ => {
                warn!("setting unknown field {} in {} record", name, Self::KIND);
                self.unknown.insert(name.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    fn fields(&self) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        push_str(&mut fields, "Tests", &self.tests);
        push_str(&mut fields, "Test-Command", &self.test_command);
        push_display(&mut fields, "Architecture", &self.architecture);
        push_str(&mut fields, "Restrictions", &self.restrictions);
        push_str(&mut fields, "Features", &self.features);
        push_display(&mut fields, "Depends", &self.depends);
        push_str(&mut fields, "Tests-Directory", &self.tests_directory);
        push_str(&mut fields, "Classes", &self.classes);
        push_unknown(&mut fields, &self.unknown);
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_set() {
        let a = ArchSet::parse(" foo  bar\tbaz ");
        assert_eq!(a.len(), 3);
        assert_eq!(a.to_string(), "bar baz foo");
        assert!(!a.is_all());
        assert!(ArchSet::parse("all").is_all());
        assert!(!ArchSet::parse("all amd64").is_all());
    }

    #[test]
    fn test_description_parse() {
        let d = Description::parse("Short\nLong1\n.\nLong2");
        assert_eq!(d.short, vec!["Short"]);
        assert_eq!(d.long, vec!["Long1", "Long2"]);
        assert_eq!(d.to_string(), "Short\n Long1\n .\n Long2");
    }

    #[test]
    fn test_description_short_only() {
        let d = Description::parse("Just a synopsis");
        assert_eq!(d.to_string(), "Just a synopsis");
    }

    #[test]
    fn test_description_wraps_long_paragraphs() {
        let mut d = Description::new();
        d.append_short("synopsis");
        d.append(&"word ".repeat(40));
        for line in d.to_string().lines().skip(1) {
            assert!(line.len() <= 75, "line too long: {line:?}");
        }
    }

    #[test]
    fn test_read_rfc822() {
        let text = "\
Package: linux-image-@abiname@@localversion@
Architecture: @arch@
Depends: kmod, linux-base (>= 4.3~)
Description: Linux kernel image
 This package contains the Linux kernel image.
 .
 Second paragraph.
# comment
Meta-Rules-Target: image

Package: linux-headers-@abiname@@localversion@
Architecture: @arch@
";
        let records: Vec<BinaryPackage> = read_rfc822(text).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].package, "linux-image-@abiname@@localversion@");
        assert_eq!(records[0].depends.len(), 2);
        assert_eq!(records[0].description.long.len(), 2);
        assert_eq!(records[0].meta.rules_target.as_deref(), Some("image"));
        assert_eq!(records[1].package, "linux-headers-@abiname@@localversion@");
    }

    #[test]
    fn test_read_rfc822_bad_continuation() {
        let result: Result<Vec<BinaryPackage>> = read_rfc822(" leading continuation\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_read_rfc822_not_a_header() {
        let result: Result<Vec<BinaryPackage>> = read_rfc822("no colon here\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_field_stored() {
        let mut p = BinaryPackage::default();
        p.set_field("X-Custom", "value").unwrap();
        assert_eq!(p.unknown.get("X-Custom").map(String::as_str), Some("value"));
        // Unknown fields render after the typed ones
        let fields = p.fields();
        assert_eq!(fields.last().map(|f| f.0.as_str()), Some("X-Custom"));
    }

    #[test]
    fn test_render_skips_empty_fields() {
        let mut p = BinaryPackage::default();
        p.set_field("Package", "linux-doc").unwrap();
        p.set_field("Architecture", "all").unwrap();
        let fields = p.fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0], ("Package".to_string(), "linux-doc".to_string()));
    }

    #[test]
    fn test_write_record() {
        let mut p = BinaryPackage::default();
        p.set_field("Package", "linux-doc").unwrap();
        p.set_field("Architecture", "all").unwrap();
        let mut out = Vec::new();
        write_record(&mut out, &p).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Package: linux-doc\nArchitecture: all\n\n"
        );
    }
}
