// src/gencontrol/mod.rs

//! The matrix walker
//!
//! Recursively descends the configuration dimensions — top level,
//! arch-independent feature-sets, architectures, per-arch feature-sets,
//! flavours — resolving effective settings at each level, producing one
//! package record per combination and registering the matching build
//! rules. Context (substitution variables and make flags) is cloned on
//! every descent, so sibling branches never observe each other's
//! additions. All outputs are written only after the walk completes.

use crate::changelog::Changelog;
use crate::config::schema::Value;
use crate::config::{ConfigKey, ConfigStore, Section};
use crate::control::relation::{RelationEntry, RelationGroup};
use crate::control::restrict::{RestrictFormula, RestrictTerm};
use crate::control::{
    ArchSet, BinaryPackage, Description, SourcePackage, TestsControl, read_rfc822, write_record,
};
use crate::error::{Error, Result};
use crate::rules::{MakeFlags, Makefile};
use crate::templates::Templates;
use crate::toolchain::Toolchain;
use crate::version::KernelVersion;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

static SUBST_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@([-_a-z0-9]+)@").unwrap());
static SOURCE_VERSION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-[\d.]+$").unwrap());

/// Substitution variables threaded through the walk
pub type Vars = HashMap<String, String>;

const MAKEFILE_TARGETS: [&str; 3] = ["binary-arch", "build-arch", "setup"];
const MAKEFILE_TARGETS_INDEP: [&str; 3] = ["binary-indep", "build-indep", "setup"];

const DEBHELPER_IDS: [&str; 7] = [
    "bug-presubj",
    "lintian-overrides",
    "maintscript",
    "postinst",
    "postrm",
    "preinst",
    "prerm",
];

/// Startup options, resolved by the binary
pub struct Options {
    pub config_dirs: Vec<PathBuf>,
    pub template_dirs: Vec<PathBuf>,
    pub changelog_path: PathBuf,
    pub output_dir: PathBuf,
    /// Requested via DEBIAN_KERNEL_DISABLE_INSTALLER
    pub disable_installer: bool,
    /// Requested via DEBIAN_KERNEL_DISABLE_SIGNED
    pub disable_signed: bool,
}

/// A debhelper config fragment, buffered until the walk has finished
struct AuxFile {
    path: PathBuf,
    text: String,
    mode: u32,
}

pub struct Gencontrol {
    config: ConfigStore,
    templates: Templates,
    toolchain: Box<dyn Toolchain>,
    changelog: Changelog,
    version: KernelVersion,
    abiname: String,
    vars: Vars,
    config_dirs: Vec<PathBuf>,
    output_dir: PathBuf,
    disable_installer: bool,
    disable_signed: bool,
    source: SourcePackage,
    packages: IndexMap<String, BinaryPackage>,
    makefile: Makefile,
    tests_control: Vec<TestsControl>,
    tests_control_image: Option<usize>,
    tests_control_headers: Option<usize>,
    aux_files: Vec<AuxFile>,
}

impl Gencontrol {
    pub fn new(options: Options, toolchain: Box<dyn Toolchain>) -> Result<Self> {
        let mut config = ConfigStore::load(&options.config_dirs)?;
        let templates = Templates::new(&options.template_dirs);
        let changelog = Changelog::read(&options.changelog_path)?;

        let head = changelog.head();
        let version = KernelVersion::parse(&head.version.complete())?;
        check_release_policy(&head.distribution, &version)?;
        let abiname = derive_abiname(&head.distribution, &version);

        let source_basename = SOURCE_VERSION_SUFFIX_RE
            .replace(&head.source, "")
            .into_owned();
        let source_suffix = head.source[source_basename.len()..].to_string();

        let mut vars = Vars::new();
        vars.insert("upstreamversion".to_string(), version.upstream.clone());
        vars.insert("version".to_string(), version.version.clone());
        vars.insert("version_complete".to_string(), version.debian.complete());
        vars.insert("source_basename".to_string(), source_basename);
        vars.insert("source_upstream".to_string(), version.debian.upstream.clone());
        vars.insert("source_package".to_string(), head.source.clone());
        vars.insert("source_suffix".to_string(), source_suffix);
        vars.insert("abiname".to_string(), abiname.clone());

        let version_section: Section = [
            ("source", version.debian.complete()),
            ("upstream", version.upstream.clone()),
            ("abiname_base", abiname.clone()),
            ("abiname", abiname.clone()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::Str(v)))
        .collect();
        config.set_section(ConfigKey::new("version", None, None, None), version_section);

        // Feature toggles may only take effect outside a release build
        let mut disabled = [false, false];
        for (i, (requested, what)) in [
            (options.disable_installer, "installer modules"),
            (options.disable_signed, "signed code"),
        ]
        .into_iter()
        .enumerate()
        {
            if requested {
                if head.distribution == "UNRELEASED" {
                    warn!("disabling {what} on request");
                    disabled[i] = true;
                } else {
                    return Err(Error::Policy(format!(
                        "unable to disable {what} in release build"
                    )));
                }
            }
        }

        Ok(Self {
            config,
            templates,
            toolchain,
            changelog,
            version,
            abiname,
            vars,
            config_dirs: options.config_dirs,
            output_dir: options.output_dir,
            disable_installer: disabled[0],
            disable_signed: disabled[1],
            source: SourcePackage::default(),
            packages: IndexMap::new(),
            makefile: Makefile::new(),
            tests_control: Vec::new(),
            tests_control_image: None,
            tests_control_headers: None,
            aux_files: Vec::new(),
        })
    }

    /// Build the full in-memory model and write every output file
    pub fn run(&mut self) -> Result<()> {
        self.build()?;
        self.write()
    }

    /// Build the package set and rule graph without writing anything
    pub fn build(&mut self) -> Result<()> {
        self.do_source()?;
        self.do_main()?;
        self.do_extra()?;
        self.merge_build_depends();
        self.extract_makefile();
        Ok(())
    }

    pub fn source(&self) -> &SourcePackage {
        &self.source
    }

    pub fn packages(&self) -> &IndexMap<String, BinaryPackage> {
        &self.packages
    }

    pub fn makefile(&self) -> &Makefile {
        &self.makefile
    }

    pub fn version(&self) -> &KernelVersion {
        &self.version
    }

    pub fn abiname(&self) -> &str {
        &self.abiname
    }

    fn do_source(&mut self) -> Result<()> {
        let records = self.templates.get_source_control("source.control")?;
        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| Error::Parse("source.control template is empty".to_string()))?;
        let mut source = process_source(&record, &self.vars)?;
        if source.source.is_empty() {
            source.source = self.changelog.head().source.clone();
        }
        self.source = source;
        Ok(())
    }

    fn do_main(&mut self) -> Result<()> {
        let vars = self.vars.clone();
        let mut makeflags = MakeFlags::new();

        self.do_main_setup(&vars, &mut makeflags)?;
        self.do_main_makefile(&makeflags)?;
        self.do_main_packages(&vars, &makeflags)?;
        self.do_main_recurse(&vars, &makeflags)
    }

    fn do_main_setup(&mut self, vars: &Vars, makeflags: &mut MakeFlags) -> Result<()> {
        makeflags.set("VERSION", &self.version.version);
        makeflags.set("UPSTREAMVERSION", &self.version.upstream);
        makeflags.set("ABINAME", &self.abiname);
        makeflags.set("SOURCEVERSION", &self.version.debian.complete());
        makeflags.set("SOURCE_BASENAME", &vars["source_basename"]);
        makeflags.set("SOURCE_SUFFIX", &vars["source_suffix"]);

        if let Some(text) = self.templates.get_opt("main.tests-control")? {
            let records: Vec<TestsControl> = read_rfc822(&text)?;
            self.tests_control = records
                .iter()
                .map(|record| process_tests_control(record, vars))
                .collect::<Result<_>>()?;
        }
        Ok(())
    }

    fn do_main_makefile(&mut self, makeflags: &MakeFlags) -> Result<()> {
        let empty = BTreeSet::new();
        let featuresets = iter_featuresets(&self.config)?;

        for featureset in &featuresets {
            let mut flags = makeflags.clone();
            flags.set("FEATURESET", featureset);
            self.makefile.add_rules(
                &format!("source_{featureset}"),
                "source",
                &flags,
                &empty,
                &empty,
            );
            self.makefile
                .add_deps("source", &[format!("source_{featureset}")]);
        }

        let mut flags = makeflags.clone();
        flags.set("ALL_FEATURESETS", &featuresets.join(" "));
        self.makefile
            .add_rules("build-indep", "build-indep", &flags, &empty, &empty);
        self.makefile
            .add_rules("binary-indep", "binary-indep", &flags, &empty, &empty);

        // Top-level package clusters register under the _real targets
        self.makefile
            .add_deps("build-arch", &["build-arch_real".to_string()]);
        self.makefile
            .add_deps("binary-arch", &["binary-arch_real".to_string()]);
        Ok(())
    }

    fn do_main_packages(&mut self, vars: &Vars, makeflags: &MakeFlags) -> Result<()> {
        self.add_package_group("main", &[], makeflags, vars, None)?;

        let packages_config = self.config.merge("packages", None, None, None);
        let enabled = |key: &str| {
            packages_config
                .get(key)
                .and_then(Value::as_bool)
                .unwrap_or(true)
        };

        // Only build the metapackages if their names won't exactly match
        // the packages they depend on
        let do_meta =
            enabled("meta") && vars["source_suffix"] != format!("-{}", vars["version"]);

        if enabled("docs") {
            self.add_package_group("docs", &[], makeflags, vars, None)?;
            if do_meta {
                self.add_package_group("docs.meta", &[], makeflags, vars, None)?;
            }
        }
        if enabled("source") {
            self.add_package_group("sourcebin", &[], makeflags, vars, None)?;
            if do_meta {
                self.add_package_group("sourcebin.meta", &[], makeflags, vars, None)?;
            }
        }

        if enabled("libc-dev") {
            let mut kernel_arches = BTreeSet::new();
            let mut multiarches = BTreeSet::new();
            for arch in iter_arches(&self.config)? {
                let kernel_arch = self.section_str(
                    &ConfigKey::new("base", Some(&arch), None, None),
                    "kernel-arch",
                )?;
                let multiarch = self
                    .toolchain
                    .dpkg_architecture(&arch, "DEB_HOST_MULTIARCH")?;
                multiarches.insert(format!("{multiarch}:{kernel_arch}"));
                kernel_arches.insert(kernel_arch);
            }

            let mut flags = makeflags.clone();
            flags.set(
                "ALL_LIBCDEV_KERNELARCHES",
                &kernel_arches.into_iter().collect::<Vec<_>>().join(" "),
            );
            flags.set(
                "ALL_LIBCDEV_MULTIARCHES",
                &multiarches.into_iter().collect::<Vec<_>>().join(" "),
            );
            self.add_package_group("libc-dev", &[], &flags, vars, None)?;
        }
        Ok(())
    }

    fn do_main_recurse(&mut self, vars: &Vars, makeflags: &MakeFlags) -> Result<()> {
        for featureset in iter_featuresets(&self.config)? {
            self.do_indep_featureset(&featureset, vars.clone(), makeflags.clone())?;
        }
        for arch in iter_arches(&self.config)? {
            self.do_arch(&arch, vars.clone(), makeflags.clone())?;
        }
        Ok(())
    }

    fn do_extra(&mut self) -> Result<()> {
        let Some(text) = self.templates.get_opt("extra.control")? else {
            return Ok(());
        };
        let records: Vec<BinaryPackage> = read_rfc822(&text)?;
        let vars = self.vars.clone();

        let mut extra_arches: std::collections::BTreeMap<String, Vec<String>> =
            std::collections::BTreeMap::new();
        for record in &records {
            let package = process_binary(record, &vars)?;
            let name = package.package.clone();
            for arch in package.architecture.iter() {
                extra_arches
                    .entry(arch.clone())
                    .or_default()
                    .push(name.clone());
            }
            self.packages.insert(name, package);
        }

        for (arch, names) in extra_arches {
            let cmds = names
                .iter()
                .map(|name| {
                    format!(
                        "$(MAKE) -f debian/rules.real install-dummy ARCH='{arch}' \
                         DH_OPTIONS='-p{name}'"
                    )
                })
                .collect();
            self.makefile.add_deps(
                &format!("binary-arch_{arch}"),
                &[format!("binary-arch_{arch}_extra")],
            );
            self.makefile
                .add_cmds(&format!("binary-arch_{arch}_extra"), cmds);
        }
        Ok(())
    }

    fn do_indep_featureset(
        &mut self,
        featureset: &str,
        mut vars: Vars,
        mut makeflags: MakeFlags,
    ) -> Result<()> {
        vars.insert("localversion".to_string(), localversion(featureset));

        self.do_indep_featureset_setup(&mut vars, &mut makeflags, featureset)?;
        self.do_indep_featureset_makefile(featureset, &mut makeflags)?;
        self.add_package_group("headers.featureset", &[featureset], &makeflags, &vars, None)?;
        Ok(())
    }

    fn do_indep_featureset_setup(
        &mut self,
        vars: &mut Vars,
        makeflags: &mut MakeFlags,
        featureset: &str,
    ) -> Result<()> {
        makeflags.set("LOCALVERSION", &vars["localversion"]);

        let mut kernel_arches = BTreeSet::new();
        for arch in iter_arches(&self.config)? {
            let has_flavours = self
                .config
                .get_merge("base", Some(&arch), Some(featureset), None, "flavours")
                .and_then(|v| v.as_list().map(|l| !l.is_empty()))
                .unwrap_or(false);
            if has_flavours {
                kernel_arches.insert(self.section_str(
                    &ConfigKey::new("base", Some(&arch), None, None),
                    "kernel-arch",
                )?);
            }
        }
        makeflags.set(
            "ALL_KERNEL_ARCHES",
            &kernel_arches.into_iter().collect::<Vec<_>>().join(" "),
        );

        vars.insert("featureset_desc".to_string(), String::new());
        if featureset != "none" {
            let key = ConfigKey::new("description", None, Some(featureset), None);
            let parts = self
                .section_value(&key, "parts")?
                .as_list()
                .map(<[String]>::to_vec)
                .unwrap_or_default();
            let first = parts.first().ok_or_else(|| {
                Error::NotFound(format!("config key parts in {key}"))
            })?;
            let short = self.section_str(&key, &format!("part-short-{first}"))?;
            vars.insert(
                "featureset_desc".to_string(),
                format!(" with the {short} featureset"),
            );
        }
        Ok(())
    }

    fn do_indep_featureset_makefile(
        &mut self,
        featureset: &str,
        makeflags: &mut MakeFlags,
    ) -> Result<()> {
        makeflags.set("FEATURESET", featureset);

        for target in MAKEFILE_TARGETS_INDEP {
            let target2 = format!("{target}_{featureset}");
            let target3 = format!("{target2}_real");
            let target4 = format!("{target}_real");
            self.makefile.add_deps(target, &[target2.clone()]);
            self.makefile.add_deps(&target2, &[target3]);
            self.makefile.add_deps(target, &[target4]);
        }
        Ok(())
    }

    fn do_arch(&mut self, arch: &str, mut vars: Vars, mut makeflags: MakeFlags) -> Result<()> {
        vars.insert("arch".to_string(), arch.to_string());

        self.do_arch_setup(&mut vars, &mut makeflags, arch)?;
        self.do_arch_makefile(arch, &mut makeflags);
        self.do_arch_packages(arch, &vars, &makeflags)?;

        for featureset in iter_arch_featuresets(&self.config, arch)? {
            self.do_featureset(arch, &featureset, vars.clone(), makeflags.clone())?;
        }
        Ok(())
    }

    fn do_arch_setup(
        &mut self,
        vars: &mut Vars,
        makeflags: &mut MakeFlags,
        arch: &str,
    ) -> Result<()> {
        let config_base = self.config.merge("base", Some(arch), None, None);
        setup_makeflags(
            &[("kernel-arch", "KERNEL_ARCH", false)],
            makeflags,
            &config_base,
            &ConfigKey::new("base", Some(arch), None, None),
        )?;

        // Best effort; newer ports may not be known to the host toolchain
        match self.toolchain.dpkg_architecture(arch, "DEB_HOST_GNU_TYPE") {
            Ok(gnu_type) => {
                vars.insert("gnu-type-package".to_string(), gnu_type.replace('_', "-"));
            }
            Err(e) => warn!("unable to get GNU type for {arch}: {e}"),
        }
        Ok(())
    }

    fn do_arch_makefile(&mut self, arch: &str, makeflags: &mut MakeFlags) {
        makeflags.set("ARCH", arch);

        for target in MAKEFILE_TARGETS {
            let target2 = format!("{target}_{arch}");
            let target3 = format!("{target2}_real");
            self.makefile.add_deps(target, &[target2.clone()]);
            self.makefile.add_deps(&target2, &[target3]);
        }
    }

    fn do_arch_packages(&mut self, arch: &str, vars: &Vars, makeflags: &MakeFlags) -> Result<()> {
        let build_signed = !self.disable_signed
            && self
                .config
                .merge("build", Some(arch), None, None)
                .get("signed-code")
                .and_then(Value::as_bool)
                .unwrap_or(false);

        if build_signed {
            // Keep the version markers unexpanded for the signing pipeline
            let mut vars = vars.clone();
            vars.insert(
                "signedtemplate_binaryversion".to_string(),
                "@signedtemplate_binaryversion@".to_string(),
            );
            vars.insert(
                "signedtemplate_sourceversion".to_string(),
                "@signedtemplate_sourceversion@".to_string(),
            );
            self.add_package_group("signed-template", &[arch], makeflags, &vars, Some(arch))?;
        }

        let packages_config = self.config.merge("packages", None, None, None);
        let enabled = |key: &str| {
            packages_config
                .get(key)
                .and_then(Value::as_bool)
                .unwrap_or(true)
        };

        let has_featuresets = self
            .config
            .section(&ConfigKey::new("base", Some(arch), None, None))
            .and_then(|section| section.get("featuresets"))
            .and_then(Value::as_list)
            .is_some_and(|list| !list.is_empty());
        if has_featuresets && enabled("source") {
            self.add_package_group("config", &[arch], makeflags, vars, None)?;
        }
        if enabled("tools-unversioned") {
            self.add_package_group("tools-unversioned", &[arch], makeflags, vars, None)?;
        }
        if enabled("tools-versioned") {
            self.add_package_group("tools-versioned", &[arch], makeflags, vars, None)?;
        }
        Ok(())
    }

    fn do_featureset(
        &mut self,
        arch: &str,
        featureset: &str,
        mut vars: Vars,
        mut makeflags: MakeFlags,
    ) -> Result<()> {
        vars.insert("localversion".to_string(), localversion(featureset));
        vars.insert(
            "localversion_headers".to_string(),
            vars["localversion"].clone(),
        );
        makeflags.set("LOCALVERSION_HEADERS", &vars["localversion_headers"]);

        let merged = self.config.merge("base", Some(arch), Some(featureset), None);
        let flavours = iter_flavours(&self.config, arch, featureset)?;

        let default_flavour = merged
            .get("default-flavour")
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(default) = &default_flavour {
            if featureset != "none" {
                return Err(Error::Schema(format!(
                    "default-flavour set for {arch} {featureset}, but must only be set for \
                     featureset none"
                )));
            }
            if !flavours.contains(default) {
                return Err(Error::Schema(format!(
                    "default-flavour {default} for {arch} {featureset} does not exist"
                )));
            }
        }
        let quick_flavour = merged
            .get("quick-flavour")
            .and_then(Value::as_str)
            .map(str::to_string);

        makeflags.set("FEATURESET", featureset);
        for target in MAKEFILE_TARGETS {
            let target1 = format!("{target}_{arch}");
            let target2 = format!("{target1}_{featureset}");
            let target3 = format!("{target2}_real");
            self.makefile.add_deps(&target1, &[target2.clone()]);
            self.makefile.add_deps(&target2, &[target3]);
        }

        for flavour in flavours {
            self.do_flavour(
                arch,
                featureset,
                &flavour,
                default_flavour.as_deref(),
                quick_flavour.as_deref(),
                vars.clone(),
                makeflags.clone(),
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn do_flavour(
        &mut self,
        arch: &str,
        featureset: &str,
        flavour: &str,
        default_flavour: Option<&str>,
        quick_flavour: Option<&str>,
        mut vars: Vars,
        mut makeflags: MakeFlags,
    ) -> Result<()> {
        let local = format!("{}-{flavour}", vars["localversion"]);
        vars.insert("localversion".to_string(), local);

        self.do_flavour_setup(&mut vars, &mut makeflags, arch, featureset, flavour)?;

        makeflags.set("FLAVOUR", flavour);
        for target in MAKEFILE_TARGETS {
            let target1 = format!("{target}_{arch}_{featureset}");
            let target2 = format!("{target1}_{flavour}");
            let target3 = format!("{target2}_real");
            self.makefile.add_deps(&target1, &[target2.clone()]);
            self.makefile.add_deps(&target2, &[target3]);
        }

        self.do_flavour_packages(
            arch,
            featureset,
            flavour,
            default_flavour,
            quick_flavour,
            &vars,
            makeflags,
        )
    }

    fn do_flavour_setup(
        &mut self,
        vars: &mut Vars,
        makeflags: &mut MakeFlags,
        arch: &str,
        featureset: &str,
        flavour: &str,
    ) -> Result<()> {
        let base_key = ConfigKey::new("base", Some(arch), Some(featureset), Some(flavour));
        let config_base = self
            .config
            .merge("base", Some(arch), Some(featureset), Some(flavour));
        let config_build = self
            .config
            .merge("build", Some(arch), Some(featureset), Some(flavour));
        let config_description =
            self.config
                .merge("description", Some(arch), Some(featureset), Some(flavour));
        let config_image = self
            .config
            .merge("image", Some(arch), Some(featureset), Some(flavour));

        vars.insert("flavour".to_string(), vars["localversion"][1..].to_string());
        let class = config_description
            .get("hardware")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "config key hardware in {}",
                    ConfigKey::new("description", Some(arch), Some(featureset), Some(flavour))
                ))
            })?;
        vars.insert("class".to_string(), class.to_string());
        vars.insert(
            "longclass".to_string(),
            config_description
                .get("hardware-long")
                .and_then(Value::as_str)
                .unwrap_or(class)
                .to_string(),
        );

        vars.insert(
            "localversion-image".to_string(),
            vars["localversion"].clone(),
        );
        if let Some(override_localversion) = config_image
            .get("override-localversion")
            .and_then(Value::as_str)
        {
            vars.insert(
                "localversion-image".to_string(),
                format!("{}-{override_localversion}", vars["localversion_headers"]),
            );
        }
        vars.insert(
            "image-stem".to_string(),
            config_image
                .get("install-stem")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        );

        setup_makeflags(
            &[
                ("compiler", "COMPILER", false),
                ("compiler-filename", "COMPILER", true),
                ("kernel-arch", "KERNEL_ARCH", false),
                ("cflags", "KCFLAGS", true),
                ("kernel-deb-arch", "KERNEL_DEB_ARCH", true),
                ("kernel-gnu-type", "KERNEL_GNU_TYPE", true),
                ("compat-deb-arch", "COMPAT_DEB_ARCH", true),
                ("compat-gnu-type", "COMPAT_GNU_TYPE", true),
            ],
            makeflags,
            &config_base,
            &base_key,
        )?;
        setup_makeflags(
            &[("image-file", "IMAGE_FILE", true)],
            makeflags,
            &config_build,
            &base_key,
        )?;
        setup_makeflags(
            &[("install-stem", "IMAGE_INSTALL_STEM", true)],
            makeflags,
            &config_image,
            &base_key,
        )?;
        setup_makeflags_vars(
            &[
                ("localversion", "LOCALVERSION", false),
                ("localversion-image", "LOCALVERSION_IMAGE", true),
            ],
            makeflags,
            vars,
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn do_flavour_packages(
        &mut self,
        arch: &str,
        featureset: &str,
        flavour: &str,
        default_flavour: Option<&str>,
        quick_flavour: Option<&str>,
        vars: &Vars,
        mut makeflags: MakeFlags,
    ) -> Result<()> {
        let ruleid = [arch, featureset, flavour];
        let arch_set = ArchSet::from_iter([arch.to_string()]);

        let packages_headers =
            self.add_package_group("headers", &ruleid, &makeflags, vars, Some(arch))?;
        let [header_name] = packages_headers.as_slice() else {
            return Err(Error::Schema(
                "headers template must produce exactly one package".to_string(),
            ));
        };
        let header_name = header_name.clone();

        let config_base = self
            .config
            .merge("base", Some(arch), Some(featureset), Some(flavour));
        let config_build = self
            .config
            .merge("build", Some(arch), Some(featureset), Some(flavour));
        let config_description =
            self.config
                .merge("description", Some(arch), Some(featureset), Some(flavour));
        let config_packages =
            self.config
                .merge("packages", Some(arch), Some(featureset), Some(flavour));

        let do_meta = config_packages
            .get("meta")
            .and_then(Value::as_bool)
            .unwrap_or(true)
            && vars["source_suffix"] != format!("-{}", vars["version"]);

        let compiler = config_base
            .get("compiler")
            .and_then(Value::as_str)
            .unwrap_or("gcc")
            .to_string();

        // Compiler build-depends merge into the source record, one entry
        // per (name, restriction) across all arches
        let compiler_entry = |name: String, restrictions: &str| -> Result<RelationEntry> {
            Ok(RelationEntry {
                name,
                operator: None,
                version: None,
                arches: arch_set.clone(),
                restrictions: RestrictFormula::parse(restrictions)?,
            })
        };
        self.source.build_depends_arch.merge(RelationGroup::from_iter([
            compiler_entry(compiler.clone(), "<!cross !pkg.linux.nokernel>")?,
        ]));
        if let Some(gnu_type) = vars.get("gnu-type-package") {
            self.source.build_depends_arch.merge(RelationGroup::from_iter([
                compiler_entry(format!("{compiler}-{gnu_type}"), "<cross !pkg.linux.nokernel>")?,
            ]));
        }
        if let Some(gnu_type) = config_base.get("kernel-gnu-type").and_then(Value::as_str) {
            self.source.build_depends_arch.merge(RelationGroup::from_iter([
                compiler_entry(format!("{compiler}-{gnu_type}"), "<!pkg.linux.nokernel>")?,
            ]));
        }
        if let Some(gnu_type) = config_base.get("compat-gnu-type").and_then(Value::as_str) {
            self.source.build_depends_arch.merge(RelationGroup::from_iter([
                compiler_entry(format!("gcc-{gnu_type}"), "<!pkg.linux.nokernel>")?,
            ]));
        }

        let build_signed = !self.disable_signed
            && config_build
                .get("signed-code")
                .and_then(Value::as_bool)
                .unwrap_or(false);

        let mut packages_image = Vec::new();
        if build_signed {
            packages_image.extend(self.add_package_group(
                "signed.image",
                &ruleid,
                &makeflags,
                vars,
                Some(arch),
            )?);
            packages_image.extend(self.add_package_group(
                "image-unsigned",
                &ruleid,
                &makeflags,
                vars,
                Some(arch),
            )?);
        } else {
            packages_image.extend(self.add_package_group(
                "image",
                &ruleid,
                &makeflags,
                vars,
                Some(arch),
            )?);
        }

        // Per-flavour relation overrides accumulated across the scopes
        for field in ["depends", "provides", "suggests", "recommends", "conflicts", "breaks"] {
            let Some(value) =
                self.config
                    .get_merge("image", Some(arch), Some(featureset), Some(flavour), field)
            else {
                continue;
            };
            for item in value.as_list().unwrap_or_default() {
                let group = RelationGroup::parse_with_arches(item, Some(&arch_set))?;
                for name in &packages_image {
                    let package = self.package_mut(name);
                    let relation = match field {
                        "depends" => &mut package.depends,
                        "provides" => &mut package.provides,
                        "suggests" => &mut package.suggests,
                        "recommends" => &mut package.recommends,
                        "conflicts" => &mut package.conflicts,
                        _ => &mut package.breaks,
                    };
                    relation.merge(group.clone());
                }
            }
        }

        // A versioned constraint on a soft relation implies a Breaks
        // against the complementary range; operator-less entries are
        // skipped
        for field in ["depends", "suggests", "recommends"] {
            let Some(value) =
                self.config
                    .get_merge("image", Some(arch), Some(featureset), Some(flavour), field)
            else {
                continue;
            };
            for item in value.as_list().unwrap_or_default() {
                let group = RelationGroup::parse_with_arches(item, Some(&arch_set))?;
                for entry in group.iter() {
                    if let Some(operator) = entry.operator {
                        let mut negated = entry.clone();
                        negated.operator = Some(-operator);
                        for name in &packages_image {
                            self.package_mut(name)
                                .breaks
                                .push(RelationGroup::from_iter([negated.clone()]));
                        }
                    }
                }
            }
        }

        // Description parts are deduplicated and sorted, so a part listed
        // at several scopes appears once
        if let Some(value) = self.config.get_merge(
            "description",
            Some(arch),
            Some(featureset),
            Some(flavour),
            "parts",
        ) {
            let parts: BTreeSet<String> =
                value.as_list().unwrap_or_default().iter().cloned().collect();
            for part in &parts {
                let long = config_description
                    .get(&format!("part-long-{part}"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "config key part-long-{part} in {}",
                            ConfigKey::new(
                                "description",
                                Some(arch),
                                Some(featureset),
                                Some(flavour)
                            )
                        ))
                    })?
                    .to_string();
                let short = config_description
                    .get(&format!("part-short-{part}"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                for name in &packages_image {
                    let description = &mut self.package_mut(name).description;
                    description.append(&long);
                    description.append_short(&short);
                }
            }
        }

        self.package_mut(&header_name)
            .depends
            .merge(RelationGroup::from_iter([RelationEntry::new(&compiler)]));

        let mut packages_own = packages_image.clone();
        packages_own.push(header_name.clone());

        // The image meta-package is built from the signed source where
        // applicable, together with the headers meta-package, so both
        // transition to testing together
        if do_meta {
            let meta_image =
                self.add_package_group("image.meta", &ruleid, &makeflags, vars, Some(arch))?;
            let headers_meta_template = if build_signed {
                "signed.headers.meta"
            } else {
                "headers.meta"
            };
            let meta_headers = self.add_package_group(
                headers_meta_template,
                &ruleid,
                &makeflags,
                vars,
                Some(arch),
            )?;

            if default_flavour == Some(flavour) && vars["source_suffix"].is_empty() {
                if let Some(name) = meta_image.first() {
                    self.package_mut(name)
                        .provides
                        .push(RelationGroup::parse("linux-image-generic")?);
                }
                if let Some(name) = meta_headers.first() {
                    self.package_mut(name)
                        .provides
                        .push(RelationGroup::parse("linux-headers-generic")?);
                }
            }
            packages_own.extend(meta_image);
            packages_own.extend(meta_headers);
        }

        if config_build
            .get("vdso")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            makeflags.set("VDSO", "True");
        }

        if config_build
            .get("debug-info")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            packages_own.extend(self.add_package_group(
                "image-dbg",
                &ruleid,
                &makeflags,
                vars,
                Some(arch),
            )?);
            if do_meta {
                packages_own.extend(self.add_package_group(
                    "image-dbg.meta",
                    &ruleid,
                    &makeflags,
                    vars,
                    Some(arch),
                )?);
            }
        }

        // In a quick build, only the quick flavour is built
        if let Some(quick) = quick_flavour
            && flavour != quick
        {
            let term = RestrictTerm::new("pkg.linux.quick", true);
            for name in &packages_own {
                let package = self.package_mut(name);
                package.build_profiles = package.build_profiles.with_term(term.clone());
            }
        }

        self.do_flavour_tests_control(
            arch,
            flavour,
            default_flavour,
            quick_flavour,
            &arch_set,
            &packages_image,
            &header_name,
            vars,
        )?;

        self.do_flavour_kconfig(arch, featureset, flavour, &config_base, vars, &mut makeflags)?;

        let merged_config = format!("debian/build/config.{arch}_{featureset}_{flavour}");
        self.makefile.add_cmds(
            &merged_config,
            vec![format!(
                "$(MAKE) -f debian/rules.real {merged_config} {makeflags}"
            )],
        );

        if !self.disable_installer
            && config_packages
                .get("installer")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        {
            self.do_flavour_installer(
                arch,
                featureset,
                flavour,
                build_signed,
                vars,
                &makeflags,
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn do_flavour_tests_control(
        &mut self,
        arch: &str,
        flavour: &str,
        default_flavour: Option<&str>,
        quick_flavour: Option<&str>,
        arch_set: &ArchSet,
        packages_image: &[String],
        header_name: &str,
        vars: &Vars,
    ) -> Result<()> {
        if let Some(text) = self.templates.get_opt("image.tests-control")? {
            let records: Vec<TestsControl> = read_rfc822(&text)?;
            let record = records
                .first()
                .ok_or_else(|| Error::Parse("image.tests-control template is empty".to_string()))?;
            let mut tests_control = process_tests_control(record, vars)?;

            if let Some(image_name) = packages_image.last() {
                tests_control
                    .depends
                    .merge(RelationGroup::parse_with_arches(image_name, Some(arch_set))?);
            }
            match self.tests_control_image {
                Some(index) => {
                    for group in tests_control.depends.iter() {
                        self.tests_control[index].depends.merge(group.clone());
                    }
                }
                None => {
                    self.tests_control.push(tests_control);
                    self.tests_control_image = Some(self.tests_control.len() - 1);
                }
            }
        }

        // Headers are only tested for one flavour per architecture
        if quick_flavour.or(default_flavour) == Some(flavour) {
            if self.tests_control_headers.is_none()
                && let Some(text) = self.templates.get_opt("headers.tests-control")?
            {
                let records: Vec<TestsControl> = read_rfc822(&text)?;
                let record = records.first().ok_or_else(|| {
                    Error::Parse("headers.tests-control template is empty".to_string())
                })?;
                self.tests_control.push(process_tests_control(record, vars)?);
                self.tests_control_headers = Some(self.tests_control.len() - 1);
            }
            if let Some(index) = self.tests_control_headers {
                self.tests_control[index].architecture.add(arch);
                let group = RelationGroup::parse_with_arches(header_name, Some(arch_set))?;
                self.tests_control[index].depends.merge(group);
            }
        }
        Ok(())
    }

    fn do_flavour_kconfig(
        &mut self,
        arch: &str,
        featureset: &str,
        flavour: &str,
        config_base: &Section,
        vars: &Vars,
        makeflags: &mut MakeFlags,
    ) -> Result<()> {
        let kernel_arch = config_base
            .get("kernel-arch")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let mut kconfig = self.check_config("config", true, None, None, None)?;
        kconfig.extend(self.check_config_default(false, &format!("kernelarch-{kernel_arch}/config"))?);
        kconfig.extend(self.check_config(&format!("{arch}/config"), true, Some(arch), None, None)?);
        kconfig.extend(self.check_config(
            &format!("{arch}/config.{flavour}"),
            false,
            Some(arch),
            None,
            Some(flavour),
        )?);
        kconfig.extend(self.check_config(
            &format!("featureset-{featureset}/config"),
            false,
            None,
            Some(featureset),
            None,
        )?);
        kconfig.extend(self.check_config(
            &format!("{arch}/{featureset}/config"),
            false,
            Some(arch),
            Some(featureset),
            None,
        )?);
        kconfig.extend(self.check_config(
            &format!("{arch}/{featureset}/config.{flavour}"),
            false,
            Some(arch),
            Some(featureset),
            Some(flavour),
        )?);
        makeflags.set("KCONFIG", &kconfig.join(" "));
        // Salt the build so binary packages differ across ABIs
        makeflags.set(
            "KCONFIG_OPTIONS",
            &format!(
                " -o \"BUILD_SALT=\\\"{}{}\\\"\"",
                vars["abiname"], vars["localversion"]
            ),
        );
        Ok(())
    }

    fn do_flavour_installer(
        &mut self,
        arch: &str,
        featureset: &str,
        flavour: &str,
        build_signed: bool,
        vars: &Vars,
        makeflags: &MakeFlags,
    ) -> Result<()> {
        let scratch = tempfile::Builder::new()
            .prefix("linux-gencontrol")
            .tempdir()?;
        let base_path = std::path::absolute(self.output_dir.join("installer"))?;
        std::os::unix::fs::symlink(base_path.join("modules"), scratch.path().join("modules"))?;
        std::os::unix::fs::symlink(
            base_path.join("package-list"),
            scratch.path().join("package-list"),
        )?;
        fs::write(
            scratch.path().join("kernel-versions"),
            format!("{arch} - {} - - -\n", vars["flavour"]),
        )?;

        let output = self
            .toolchain
            .installer_packages(scratch.path(), &vars["abiname"])?;
        let records: Vec<BinaryPackage> = read_rfc822(&output)?;
        if records.is_empty() {
            return Err(Error::Collaborator(
                "installer package-list generator returned no packages".to_string(),
            ));
        }
        let rule = rule_name(&[arch, featureset, flavour]);

        if build_signed {
            // The real udebs are built from the signed source; only an
            // unsigned test build appears here, excluded from the package
            // list checks
            for record in records {
                let mut package = record;
                package.build_profiles = RestrictFormula::parse(
                    "<pkg.linux.udeb-unsigned-test-build !noudeb !pkg.linux.nokernel \
                     !pkg.linux.quick>",
                )?;
                package.meta.rules_target = Some("installer-test".to_string());
                self.merge_package_rules(package, &rule, makeflags, Some(arch), false);
            }
        } else {
            let mut makeflags = makeflags.clone();
            makeflags.set("IMAGE_PACKAGE_NAME", &records[0].package);
            for record in records {
                let mut package = record;
                package.build_profiles =
                    RestrictFormula::parse("<!noudeb !pkg.linux.nokernel !pkg.linux.quick>")?;
                package.meta.rules_target = Some("installer".to_string());
                self.merge_package_rules(package, &rule, &makeflags, Some(arch), true);
            }
        }
        Ok(())
    }

    /// Resolve kernel config file paths: an explicit `configs` list at the
    /// exact scope wins over the conventional default path
    fn check_config(
        &self,
        default: &str,
        fail: bool,
        arch: Option<&str>,
        featureset: Option<&str>,
        flavour: Option<&str>,
    ) -> Result<Vec<String>> {
        let configs = self
            .config
            .section(&ConfigKey::new("image", arch, featureset, flavour))
            .and_then(|section| section.get("configs"))
            .and_then(Value::as_list);
        match configs {
            None => self.check_config_default(fail, default),
            Some(files) => self.check_config_files(files),
        }
    }

    fn check_config_default(&self, fail: bool, file: &str) -> Result<Vec<String>> {
        for dir in self.config_dirs.iter().rev() {
            let path = dir.join(file);
            if path.exists() {
                return Ok(vec![path.display().to_string()]);
            }
        }
        if fail {
            return Err(Error::NotFound(format!("kernel config {file}")));
        }
        Ok(vec![])
    }

    fn check_config_files(&self, files: &[String]) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for file in files {
            let path = self
                .config_dirs
                .iter()
                .rev()
                .map(|dir| dir.join(file))
                .find(|path| path.exists())
                .ok_or_else(|| Error::NotFound(format!("kernel config {file}")))?;
            found.push(path.display().to_string());
        }
        Ok(found)
    }

    /// Read a control template, substitute the variables and register the
    /// resulting packages under the given rule identifier
    fn add_package_group(
        &mut self,
        key: &str,
        ruleid: &[&str],
        makeflags: &MakeFlags,
        vars: &Vars,
        arch: Option<&str>,
    ) -> Result<Vec<String>> {
        let records = self.templates.get_control(&format!("{key}.control"))?;
        let rule = rule_name(ruleid);
        let mut names = Vec::new();
        for record in &records {
            let package = process_binary(record, vars)?;
            self.substitute_debhelper_config(key, vars, &package.package)?;
            names.push(self.merge_package_rules(package, &rule, makeflags, arch, true));
        }
        Ok(names)
    }

    /// Register a package under a rule identifier. A package seen before
    /// keeps its record; only the rule map, the architecture set and the
    /// package-list check flag accumulate.
    fn merge_package_rules(
        &mut self,
        package: BinaryPackage,
        rule: &str,
        makeflags: &MakeFlags,
        arch: Option<&str>,
        check_packages: bool,
    ) -> String {
        let name = package.package.clone();
        let entry = self.packages.entry(name.clone()).or_insert(package);
        entry.meta.rules.insert(rule.to_string(), makeflags.clone());
        if let Some(arch) = arch {
            entry.meta.architectures.add(arch);
        }
        entry.meta.check_packages = check_packages;
        name
    }

    /// Substitute kernel version etc. into maintainer scripts, bug
    /// presubj message and lintian overrides
    fn substitute_debhelper_config(
        &mut self,
        prefix: &str,
        vars: &Vars,
        package_name: &str,
    ) -> Result<()> {
        let mut vars = vars.clone();
        vars.insert("package".to_string(), package_name.to_string());
        for id in DEBHELPER_IDS {
            let key = format!("{prefix}.{id}");
            let Some(template) = self.templates.get_opt(&key)? else {
                continue;
            };
            let text = substitute(&template, &vars)?;
            let mode = self.templates.get_mode(&key)? & 0o777;
            self.aux_files.push(AuxFile {
                path: self.output_dir.join(format!("{package_name}.{id}")),
                text,
                mode,
            });
        }
        Ok(())
    }

    fn package_mut(&mut self, name: &str) -> &mut BinaryPackage {
        self.packages
            .get_mut(name)
            .expect("package registered earlier in the walk")
    }

    fn section_value(&self, key: &ConfigKey, name: &str) -> Result<&Value> {
        self.config
            .section(key)
            .and_then(|section| section.get(name))
            .ok_or_else(|| Error::NotFound(format!("config key {name} in {key}")))
    }

    fn section_str(&self, key: &ConfigKey, name: &str) -> Result<String> {
        self.section_value(key, name)?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Schema(format!("config key {name} in {key} must be a string")))
    }

    /// Move Build-Depends pseudo-fields from the binary records to the
    /// source record; entries inherit the package's architecture set and
    /// build profiles unless they carry their own
    fn merge_build_depends(&mut self) {
        let mut promoted = Vec::new();
        for package in self.packages.values_mut() {
            if package.build_depends.is_empty() {
                continue;
            }
            let mut dep = std::mem::take(&mut package.build_depends);
            let arch_all = package.architecture.is_all();
            for group in dep.iter_mut() {
                for item in group.iter_mut() {
                    if !arch_all && item.arches.is_empty() {
                        item.arches = package.architecture.clone();
                    }
                    if !package.build_profiles.is_empty() && item.restrictions.is_empty() {
                        item.restrictions = package.build_profiles.clone();
                    }
                }
            }
            promoted.push((dep, arch_all));
        }
        for (dep, arch_all) in promoted {
            let target = if arch_all {
                &mut self.source.build_depends_indep
            } else {
                &mut self.source.build_depends_arch
            };
            for group in dep.iter() {
                target.push(group.clone());
            }
        }
    }

    /// Turn the per-package rule annotations into the build/binary rule
    /// clusters of the graph
    fn extract_makefile(&mut self) {
        struct Target {
            packages: BTreeSet<String>,
            packages_extra: BTreeSet<String>,
            makeflags: MakeFlags,
            indep: bool,
        }
        let mut targets: std::collections::BTreeMap<(String, String), Target> =
            std::collections::BTreeMap::new();

        for (name, package) in self.packages.iter_mut() {
            if package.meta.rules.is_empty() {
                continue;
            }
            if !package.meta.architectures.is_empty() {
                package.architecture = package.meta.architectures.clone();
            }
            let arches = package.architecture.clone();
            let Some(target_name) = package.meta.rules_target.clone() else {
                continue;
            };
            for (rule, makeflags) in &package.meta.rules {
                let target = targets
                    .entry((target_name.clone(), rule.clone()))
                    .or_insert_with(|| Target {
                        packages: BTreeSet::new(),
                        packages_extra: BTreeSet::new(),
                        makeflags: makeflags.clone(),
                        indep: false,
                    });
                if package.meta.check_packages {
                    target.packages.insert(name.clone());
                } else {
                    target.packages_extra.insert(name.clone());
                }
                target.makeflags = makeflags.clone();
                target.indep = arches.is_all();
            }
        }

        for ((target_name, rule), target) in targets {
            let build_type = if target.indep { "indep" } else { "arch" };
            self.makefile.add_deps(
                &format!("build-{build_type}_{rule}"),
                &[format!("build-{build_type}_{rule}_{target_name}")],
            );
            self.makefile.add_deps(
                &format!("binary-{build_type}_{rule}"),
                &[format!("binary-{build_type}_{rule}_{target_name}")],
            );
            self.makefile.add_rules(
                &format!("build-{build_type}_{rule}_{target_name}"),
                &format!("build_{target_name}"),
                &target.makeflags,
                &target.packages,
                &target.packages_extra,
            );
            self.makefile.add_rules(
                &format!("binary-{build_type}_{rule}_{target_name}"),
                &format!("binary_{target_name}"),
                &target.makeflags,
                &target.packages,
                &target.packages_extra,
            );
        }
    }

    /// Write every output; nothing touches the output directory before
    /// the whole model has been built
    pub fn write(&mut self) -> Result<()> {
        fs::create_dir_all(&self.output_dir)?;

        let mut dump = Vec::new();
        self.config.dump(&mut dump)?;
        fs::write(self.output_dir.join("config.defines.json"), dump)?;

        let mut control = Vec::new();
        write_record(&mut control, &self.source)?;
        for package in self.packages.values() {
            write_record(&mut control, package)?;
        }
        fs::write(self.output_dir.join("control"), control)?;

        let mut rules = Vec::new();
        self.makefile.write(&mut rules)?;
        fs::write(self.output_dir.join("rules.gen"), rules)?;

        if !self.tests_control.is_empty() {
            let tests_dir = self.output_dir.join("tests");
            fs::create_dir_all(&tests_dir)?;
            let mut out = Vec::new();
            for tests_control in &self.tests_control {
                write_record(&mut out, tests_control)?;
            }
            fs::write(tests_dir.join("control"), out)?;
        }

        for aux in &self.aux_files {
            fs::write(&aux.path, &aux.text)?;
            let mut permissions = fs::metadata(&aux.path)?.permissions();
            std::os::unix::fs::PermissionsExt::set_mode(&mut permissions, aux.mode);
            fs::set_permissions(&aux.path, permissions)?;
        }

        info!(
            "wrote {} packages and {} rules to {}",
            self.packages.len() + 1,
            self.makefile.rules().len(),
            self.output_dir.display()
        );
        Ok(())
    }
}

/// The local version suffix of a feature-set; "none" contributes nothing
fn localversion(featureset: &str) -> String {
    if featureset == "none" {
        String::new()
    } else {
        format!("-{featureset}")
    }
}

/// The rule identifier a package cluster registers under; top-level
/// packages hang off the `_real` targets
fn rule_name(ruleid: &[&str]) -> String {
    if ruleid.is_empty() {
        "real".to_string()
    } else {
        ruleid.join("_")
    }
}

/// Expand `@token@` markers; an unknown token is fatal
pub fn substitute(s: &str, vars: &Vars) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in SUBST_RE.captures_iter(s) {
        let whole = caps.get(0).expect("match always has a group 0");
        let name = &caps[1];
        let value = vars
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("substitution variable @{name}@")))?;
        out.push_str(&s[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(out)
}

fn process_relation(
    relation: &crate::control::relation::Relation,
    vars: &Vars,
) -> Result<crate::control::relation::Relation> {
    let mut relation = relation.clone();
    for group in relation.iter_mut() {
        for entry in group.iter_mut() {
            entry.name = substitute(&entry.name, vars)?;
            if let Some(version) = &entry.version {
                entry.version = Some(substitute(version, vars)?);
            }
        }
    }
    Ok(relation)
}

fn process_description(description: &Description, vars: &Vars) -> Result<Description> {
    let mut processed = Description::new();
    for short in &description.short {
        processed.short.push(substitute(short, vars)?);
    }
    for long in &description.long {
        processed.append(&substitute(long, vars)?);
    }
    Ok(processed)
}

fn process_arches(arches: &ArchSet, vars: &Vars) -> Result<ArchSet> {
    Ok(ArchSet::parse(&substitute(&arches.to_string(), vars)?))
}

fn process_unknown(
    unknown: &std::collections::BTreeMap<String, String>,
    vars: &Vars,
) -> Result<std::collections::BTreeMap<String, String>> {
    unknown
        .iter()
        .map(|(name, value)| Ok((name.clone(), substitute(value, vars)?)))
        .collect()
}

fn process_source(record: &SourcePackage, vars: &Vars) -> Result<SourcePackage> {
    let mut package = record.clone();
    package.source = substitute(&record.source, vars)?;
    package.architecture = process_arches(&record.architecture, vars)?;
    package.section = substitute(&record.section, vars)?;
    package.priority = substitute(&record.priority, vars)?;
    package.maintainer = substitute(&record.maintainer, vars)?;
    package.uploaders = substitute(&record.uploaders, vars)?;
    package.standards_version = substitute(&record.standards_version, vars)?;
    package.build_depends = process_relation(&record.build_depends, vars)?;
    package.build_depends_arch = process_relation(&record.build_depends_arch, vars)?;
    package.build_depends_indep = process_relation(&record.build_depends_indep, vars)?;
    package.rules_requires_root = substitute(&record.rules_requires_root, vars)?;
    package.homepage = substitute(&record.homepage, vars)?;
    package.vcs_browser = substitute(&record.vcs_browser, vars)?;
    package.vcs_git = substitute(&record.vcs_git, vars)?;
    package.xs_autobuild = substitute(&record.xs_autobuild, vars)?;
    package.unknown = process_unknown(&record.unknown, vars)?;
    Ok(package)
}

fn process_binary(record: &BinaryPackage, vars: &Vars) -> Result<BinaryPackage> {
    let mut package = record.clone();
    package.package = substitute(&record.package, vars)?;
    package.package_type = substitute(&record.package_type, vars)?;
    package.architecture = process_arches(&record.architecture, vars)?;
    package.section = substitute(&record.section, vars)?;
    package.priority = substitute(&record.priority, vars)?;
    package.build_depends = process_relation(&record.build_depends, vars)?;
    package.build_depends_arch = process_relation(&record.build_depends_arch, vars)?;
    package.build_depends_indep = process_relation(&record.build_depends_indep, vars)?;
    package.build_profiles =
        RestrictFormula::parse(&substitute(&record.build_profiles.to_string(), vars)?)?;
    package.built_using = process_relation(&record.built_using, vars)?;
    package.provides = process_relation(&record.provides, vars)?;
    package.pre_depends = process_relation(&record.pre_depends, vars)?;
    package.depends = process_relation(&record.depends, vars)?;
    package.recommends = process_relation(&record.recommends, vars)?;
    package.suggests = process_relation(&record.suggests, vars)?;
    package.replaces = process_relation(&record.replaces, vars)?;
    package.breaks = process_relation(&record.breaks, vars)?;
    package.conflicts = process_relation(&record.conflicts, vars)?;
    package.multi_arch = substitute(&record.multi_arch, vars)?;
    package.kernel_version = substitute(&record.kernel_version, vars)?;
    package.description = process_description(&record.description, vars)?;
    package.homepage = substitute(&record.homepage, vars)?;
    package.unknown = process_unknown(&record.unknown, vars)?;
    Ok(package)
}

fn process_tests_control(record: &TestsControl, vars: &Vars) -> Result<TestsControl> {
    let mut tests_control = record.clone();
    tests_control.tests = substitute(&record.tests, vars)?;
    tests_control.test_command = substitute(&record.test_command, vars)?;
    tests_control.architecture = process_arches(&record.architecture, vars)?;
    tests_control.restrictions = substitute(&record.restrictions, vars)?;
    tests_control.features = substitute(&record.features, vars)?;
    tests_control.depends = process_relation(&record.depends, vars)?;
    tests_control.tests_directory = substitute(&record.tests_directory, vars)?;
    tests_control.classes = substitute(&record.classes, vars)?;
    tests_control.unknown = process_unknown(&record.unknown, vars)?;
    Ok(tests_control)
}

fn setup_makeflags(
    names: &[(&str, &str, bool)],
    makeflags: &mut MakeFlags,
    data: &Section,
    key: &ConfigKey,
) -> Result<()> {
    for (src, dst, optional) in names {
        match data.get(*src) {
            Some(value) => makeflags.set(dst, &value.render()),
            None if !*optional => {
                return Err(Error::NotFound(format!("config key {src} in {key}")));
            }
            None => {}
        }
    }
    Ok(())
}

fn setup_makeflags_vars(
    names: &[(&str, &str, bool)],
    makeflags: &mut MakeFlags,
    vars: &Vars,
) -> Result<()> {
    for (src, dst, optional) in names {
        match vars.get(*src) {
            Some(value) => makeflags.set(dst, value),
            None if !*optional => {
                return Err(Error::NotFound(format!("variable {src}")));
            }
            None => {}
        }
    }
    Ok(())
}

/// The enabled feature-sets, in configuration order
pub fn iter_featuresets(config: &ConfigStore) -> Result<Vec<String>> {
    let featuresets = config
        .get("base", None, None, None, "featuresets")?
        .as_list()
        .ok_or_else(|| Error::Schema("base featuresets must be a list".to_string()))?;
    Ok(featuresets
        .iter()
        .filter(|featureset| featureset_enabled(config, None, featureset))
        .cloned()
        .collect())
}

/// The configured architectures
pub fn iter_arches(config: &ConfigStore) -> Result<Vec<String>> {
    config
        .get("base", None, None, None, "arches")?
        .as_list()
        .map(<[String]>::to_vec)
        .ok_or_else(|| Error::Schema("base arches must be a list".to_string()))
}

/// The enabled feature-sets of one architecture
pub fn iter_arch_featuresets(config: &ConfigStore, arch: &str) -> Result<Vec<String>> {
    let featuresets = config
        .section(&ConfigKey::new("base", Some(arch), None, None))
        .and_then(|section| section.get("featuresets"))
        .and_then(Value::as_list)
        .map(<[String]>::to_vec)
        .unwrap_or_default();
    Ok(featuresets
        .into_iter()
        .filter(|featureset| featureset_enabled(config, Some(arch), featureset))
        .collect())
}

fn featureset_enabled(config: &ConfigStore, arch: Option<&str>, featureset: &str) -> bool {
    config
        .merge("base", arch, Some(featureset), None)
        .get("enabled")
        .and_then(Value::as_bool)
        .unwrap_or(true)
}

/// The flavours of an (architecture, feature-set) pair
pub fn iter_flavours(config: &ConfigStore, arch: &str, featureset: &str) -> Result<Vec<String>> {
    let key = ConfigKey::new("base", Some(arch), Some(featureset), None);
    config
        .section(&key)
        .and_then(|section| section.get("flavours"))
        .and_then(Value::as_list)
        .map(<[String]>::to_vec)
        .ok_or_else(|| Error::NotFound(format!("config key flavours in {key}")))
}

/// The ABI name embedded in package names, derived from the upstream
/// version and the target distribution
pub fn derive_abiname(distribution: &str, version: &KernelVersion) -> String {
    if distribution == "UNRELEASED" {
        format!("{}+unreleased", version.upstream)
    } else if distribution == "experimental" {
        version.upstream.clone()
    } else if version.revision_backports {
        format!("{}+bpo", version.upstream_full)
    } else {
        format!("{}+rpt", version.upstream_full)
    }
}

/// Release policy: the revision classification must match the target
/// distribution
pub fn check_release_policy(distribution: &str, version: &KernelVersion) -> Result<()> {
    let complete = version.debian.complete();
    let refuse = || {
        Err(Error::Policy(format!(
            "can't upload to {distribution} with a version of {complete}"
        )))
    };

    if distribution == "unstable"
        && (version.revision_experimental
            || version.revision_backports
            || version.revision_other)
    {
        return refuse();
    }
    if distribution == "experimental" && !version.revision_experimental {
        return refuse();
    }
    if (distribution.ends_with("-security") || distribution.ends_with("-lts"))
        && (version.revision_backports || version.revision_other)
    {
        return refuse();
    }
    if distribution.ends_with("-backports") && !version.revision_backports {
        return refuse();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    #[test]
    fn test_substitute() {
        let mut vars = Vars::new();
        vars.insert("abiname".to_string(), "6.1.0-1".to_string());
        vars.insert("localversion".to_string(), "-cloud".to_string());
        assert_eq!(
            substitute("linux-image-@abiname@@localversion@", &vars).unwrap(),
            "linux-image-6.1.0-1-cloud"
        );
        assert_eq!(substitute("no markers", &vars).unwrap(), "no markers");
    }

    #[test]
    fn test_substitute_unknown_token() {
        assert!(substitute("@missing@", &Vars::new()).is_err());
    }

    #[test]
    fn test_rule_name() {
        assert_eq!(rule_name(&[]), "real");
        assert_eq!(rule_name(&["amd64", "none", "cloud"]), "amd64_none_cloud");
    }

    #[test]
    fn test_localversion() {
        assert_eq!(localversion("none"), "");
        assert_eq!(localversion("rt"), "-rt");
    }

    #[test]
    fn test_derive_abiname() {
        let v = KernelVersion::parse("6.1.7-1").unwrap();
        assert_eq!(derive_abiname("UNRELEASED", &v), "6.1+unreleased");
        assert_eq!(derive_abiname("unstable", &v), "6.1.7+rpt");

        let v = KernelVersion::parse("6.1~rc3-1~exp1").unwrap();
        assert_eq!(derive_abiname("experimental", &v), "6.1-rc3");

        let v = KernelVersion::parse("6.1.7-1~bpo11+1").unwrap();
        assert_eq!(derive_abiname("bullseye-backports", &v), "6.1.7+bpo");
    }

    #[test]
    fn test_release_policy() {
        let stable = KernelVersion::parse("6.1.7-1").unwrap();
        let experimental = KernelVersion::parse("6.1~rc3-1~exp1").unwrap();
        let backports = KernelVersion::parse("6.1.7-1~bpo11+1").unwrap();

        assert!(check_release_policy("unstable", &stable).is_ok());
        assert!(check_release_policy("unstable", &experimental).is_err());
        assert!(check_release_policy("unstable", &backports).is_err());
        assert!(check_release_policy("experimental", &experimental).is_ok());
        assert!(check_release_policy("experimental", &stable).is_err());
        assert!(check_release_policy("bookworm-security", &stable).is_ok());
        assert!(check_release_policy("bookworm-security", &backports).is_err());
        assert!(check_release_policy("bullseye-backports", &backports).is_ok());
        assert!(check_release_policy("bullseye-backports", &stable).is_err());
    }

    #[test]
    fn test_iter_featuresets_enabled_filter() {
        let mut config = ConfigStore::default();
        config.set_section(
            ConfigKey::new("base", None, None, None),
            [(
                "featuresets".to_string(),
                Value::List(vec!["none".to_string(), "rt".to_string()]),
            )]
            .into_iter()
            .collect(),
        );
        config.set_section(
            ConfigKey::new("base", None, Some("rt"), None),
            [("enabled".to_string(), Value::Bool(false))]
                .into_iter()
                .collect(),
        );
        assert_eq!(iter_featuresets(&config).unwrap(), vec!["none".to_string()]);
    }
}
