// src/rules.rs

//! Build-rule dependency graph
//!
//! Accumulates named rules with dependency sets and ordered command
//! blocks, then renders them as a generated Makefile. Dependencies are
//! auto-created as placeholder rules so no edge ever points at a missing
//! target, and everything renders sorted so repeated runs over the same
//! inputs are byte-identical.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;

/// Make variable assignments rendered sorted as `KEY='value'`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MakeFlags(BTreeMap<String, String>);

impl MakeFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

impl fmt::Display for MakeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{key}='{value}'")?;
            first = false;
        }
        Ok(())
    }
}

/// One command block of a rule
#[derive(Debug, Clone)]
enum RuleCmds {
    /// Verbatim command lines
    Simple(Vec<String>),
    /// A debian/rules.real invocation for a set of packages
    Real {
        target: String,
        makeflags: MakeFlags,
        packages: BTreeSet<String>,
    },
}

impl RuleCmds {
    /// Build a rules.real invocation, deriving the destination directory
    /// and debhelper options from the package sets
    fn real(
        target: &str,
        makeflags: &MakeFlags,
        packages: &BTreeSet<String>,
        packages_extra: &BTreeSet<String>,
    ) -> Self {
        let mut makeflags = makeflags.clone();
        let packages_all: BTreeSet<String> =
            packages.union(packages_extra).cloned().collect();

        if !packages_all.is_empty() {
            if packages_all.len() == 1 {
                let name = packages_all.iter().next().expect("set is non-empty");
                makeflags.set("PACKAGE_NAME", name);
                makeflags.set("DESTDIR", &format!("$(CURDIR)/debian/{name}"));
            } else {
                makeflags.set("DESTDIR", "$(CURDIR)/debian/tmp");
            }
            let options = packages_all
                .iter()
                .map(|name| format!("-p{name}"))
                .collect::<Vec<_>>()
                .join(" ");
            makeflags.set("DH_OPTIONS", &options);
        }

        Self::Real {
            target: target.to_string(),
            makeflags,
            packages: packages.clone(),
        }
    }

    fn write<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        match self {
            Self::Simple(cmds) => {
                for cmd in cmds {
                    writeln!(out, "\t{cmd}")?;
                }
                Ok(())
            }
            Self::Real {
                target,
                makeflags,
                packages,
            } => {
                let cmd = format!("$(MAKE) -f debian/rules.real {target} {makeflags}");
                if packages.is_empty() {
                    writeln!(out, "\t{cmd}")
                } else {
                    let names = packages.iter().cloned().collect::<Vec<_>>().join(" ");
                    writeln!(out, "\t$(call if_package, {names}, {cmd})")
                }
            }
        }
    }
}

/// A named rule: a deduplicated dependency set plus command blocks in
/// registration order
#[derive(Debug, Clone)]
pub struct Rule {
    name: String,
    deps: BTreeSet<String>,
    cmds: Vec<RuleCmds>,
}

impl Rule {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            deps: BTreeSet::new(),
            cmds: Vec::new(),
        }
    }

    pub fn deps(&self) -> &BTreeSet<String> {
        &self.deps
    }

    pub fn has_cmds(&self) -> bool {
        !self.cmds.is_empty()
    }

    fn write<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        let deps = self.deps.iter().cloned().collect::<Vec<_>>().join(" ");
        writeln!(out, "{}:{}", self.name, deps)?;
        for cmds in &self.cmds {
            cmds.write(out)?;
        }
        Ok(())
    }
}

/// The rule accumulator
#[derive(Debug, Clone, Default)]
pub struct Makefile {
    rules: BTreeMap<String, Rule>,
}

impl Makefile {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(&mut self, name: &str) -> &mut Rule {
        self.rules
            .entry(name.to_string())
            .or_insert_with(|| Rule::new(name))
    }

    /// Append a block of verbatim command lines to the named rule
    pub fn add_cmds(&mut self, name: &str, cmds: Vec<String>) {
        self.rule(name).cmds.push(RuleCmds::Simple(cmds));
    }

    /// Register prerequisites of a rule; every dependency gets at least a
    /// placeholder rule so edges never dangle
    pub fn add_deps(&mut self, name: &str, deps: &[String]) {
        self.rule(name).deps.extend(deps.iter().cloned());
        for dep in deps {
            self.rule(dep);
        }
    }

    /// Append a rules.real invocation to the named rule
    pub fn add_rules(
        &mut self,
        name: &str,
        target: &str,
        makeflags: &MakeFlags,
        packages: &BTreeSet<String>,
        packages_extra: &BTreeSet<String>,
    ) {
        let cmds = RuleCmds::real(target, makeflags, packages, packages_extra);
        self.rule(name).cmds.push(cmds);
    }

    pub fn rules(&self) -> &BTreeMap<String, Rule> {
        &self.rules
    }

    pub fn write<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(
            b".NOTPARALLEL:
.PHONY:
packages_enabled := $(shell dh_listpackages)
define if_package
$(if $(filter $(1),$(packages_enabled)),$(2))
endef
",
        )?;
        for rule in self.rules.values() {
            rule.write(out)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(makefile: &Makefile) -> String {
        let mut out = Vec::new();
        makefile.write(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_makeflags_sorted() {
        let mut flags = MakeFlags::new();
        flags.set("B", "2");
        flags.set("A", "1");
        assert_eq!(flags.to_string(), "A='1' B='2'");
    }

    #[test]
    fn test_deps_create_placeholders() {
        let mut makefile = Makefile::new();
        makefile.add_deps("build-arch", &["build-arch_amd64".to_string()]);
        assert!(makefile.rules().contains_key("build-arch_amd64"));
        let output = render(&makefile);
        assert!(output.contains("build-arch:build-arch_amd64\n"));
        assert!(output.contains("build-arch_amd64:\n"));
    }

    #[test]
    fn test_deps_deduplicated_and_sorted() {
        let mut makefile = Makefile::new();
        makefile.add_deps("all", &["b".to_string(), "a".to_string()]);
        makefile.add_deps("all", &["a".to_string()]);
        assert!(render(&makefile).contains("all:a b\n"));
    }

    #[test]
    fn test_single_package_rule() {
        let mut makefile = Makefile::new();
        let mut flags = MakeFlags::new();
        flags.set("ARCH", "amd64");
        let packages = BTreeSet::from(["linux-image-amd64".to_string()]);
        makefile.add_rules("binary-arch_amd64_image", "binary_image", &flags, &packages, &BTreeSet::new());

        let output = render(&makefile);
        assert!(output.contains(
            "\t$(call if_package, linux-image-amd64, $(MAKE) -f debian/rules.real binary_image \
             ARCH='amd64' DESTDIR='$(CURDIR)/debian/linux-image-amd64' \
             DH_OPTIONS='-plinux-image-amd64' PACKAGE_NAME='linux-image-amd64')"
        ));
    }

    #[test]
    fn test_multi_package_rule_uses_tmp_destdir() {
        let mut makefile = Makefile::new();
        let packages = BTreeSet::from(["pkg-a".to_string(), "pkg-b".to_string()]);
        makefile.add_rules("build", "build_image", &MakeFlags::new(), &packages, &BTreeSet::new());

        let output = render(&makefile);
        assert!(output.contains("DESTDIR='$(CURDIR)/debian/tmp'"));
        assert!(output.contains("DH_OPTIONS='-ppkg-a -ppkg-b'"));
    }

    #[test]
    fn test_extra_packages_skip_package_check() {
        let mut makefile = Makefile::new();
        let extra = BTreeSet::from(["pkg-test".to_string()]);
        makefile.add_rules("build", "build_udeb", &MakeFlags::new(), &BTreeSet::new(), &extra);

        let output = render(&makefile);
        // No if_package guard when the checked set is empty
        assert!(output.contains("\t$(MAKE) -f debian/rules.real build_udeb"));
        assert!(!output.contains("$(call if_package"));
    }

    #[test]
    fn test_byte_stable_output() {
        let build = |order: &[&str]| {
            let mut makefile = Makefile::new();
            for name in order {
                makefile.add_deps(name, &[format!("{name}_real")]);
            }
            makefile.add_cmds("setup", vec!["touch stamp".to_string()]);
            render(&makefile)
        };
        assert_eq!(build(&["b", "a", "c"]), build(&["c", "a", "b"]));
    }

    #[test]
    fn test_prologue_present() {
        let output = render(&Makefile::new());
        assert!(output.starts_with(".NOTPARALLEL:\n.PHONY:\n"));
        assert!(output.contains("define if_package"));
    }
}
