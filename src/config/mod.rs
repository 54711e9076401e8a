// src/config/mod.rs

//! Layered configuration store
//!
//! Entries are keyed by (category, architecture?, feature-set?, flavour?)
//! with absent dimensions acting as wildcards. Lookup walks a fixed
//! precedence list from most to least specific; `merge` flattens the
//! layers key-by-key. The store is populated once at startup from
//! hierarchical defines files and is read-only during generation.

pub mod schema;

use crate::error::{Error, Result};
use schema::{Value, category_schema, is_category};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The dimensional address of one configuration section
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigKey {
    pub category: String,
    pub arch: Option<String>,
    pub featureset: Option<String>,
    pub flavour: Option<String>,
}

impl ConfigKey {
    pub fn new(
        category: &str,
        arch: Option<&str>,
        featureset: Option<&str>,
        flavour: Option<&str>,
    ) -> Self {
        Self {
            category: category.to_string(),
            arch: arch.map(str::to_string),
            featureset: featureset.map(str::to_string),
            flavour: flavour.map(str::to_string),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.category)?;
        let dims = [&self.arch, &self.featureset, &self.flavour];
        if let Some(last) = dims.iter().rposition(|d| d.is_some()) {
            for dim in &dims[..=last] {
                write!(f, "/{}", dim.as_deref().unwrap_or("*"))?;
            }
        }
        Ok(())
    }
}

/// One section: a flat key/value record
pub type Section = BTreeMap<String, Value>;

/// The layered store
#[derive(Debug, Default)]
pub struct ConfigStore {
    entries: BTreeMap<ConfigKey, Section>,
}

impl ConfigStore {
    /// Load the store from a list of configuration directories; later
    /// directories override individual keys of earlier ones.
    ///
    /// Layout per directory: `defines` (top level), `{arch}/defines`,
    /// `{arch}/{featureset}/defines` and `featureset-{fs}/defines`.
    /// Flavour-scoped settings use `[{flavour}_{category}]` sections.
    pub fn load(dirs: &[PathBuf]) -> Result<Self> {
        let mut store = Self::default();

        for dir in dirs {
            store.read_defines(&dir.join("defines"), None, None)?;
        }
        let base = store
            .section(&ConfigKey::new("base", None, None, None))
            .ok_or_else(|| Error::NotFound("base configuration section".to_string()))?;
        let arches = base
            .get("arches")
            .and_then(Value::as_list)
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        let featuresets = base
            .get("featuresets")
            .and_then(Value::as_list)
            .map(<[String]>::to_vec)
            .unwrap_or_default();

        for featureset in &featuresets {
            for dir in dirs {
                store.read_defines(
                    &dir.join(format!("featureset-{featureset}")).join("defines"),
                    None,
                    Some(featureset),
                )?;
            }
        }

        for arch in &arches {
            for dir in dirs {
                store.read_defines(&dir.join(arch).join("defines"), Some(arch), None)?;
            }
            let arch_featuresets = store
                .section(&ConfigKey::new("base", Some(arch), None, None))
                .and_then(|section| section.get("featuresets"))
                .and_then(Value::as_list)
                .map(<[String]>::to_vec)
                .unwrap_or_default();
            for featureset in &arch_featuresets {
                for dir in dirs {
                    store.read_defines(
                        &dir.join(arch).join(featureset).join("defines"),
                        Some(arch),
                        Some(featureset),
                    )?;
                }
            }
        }

        Ok(store)
    }

    fn read_defines(
        &mut self,
        path: &Path,
        arch: Option<&str>,
        featureset: Option<&str>,
    ) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        debug!("loading defines file {}", path.display());
        let text = std::fs::read_to_string(path)?;

        for (section_name, entries) in parse_defines(&text, path)? {
            let (category, flavour) = resolve_section(&section_name, path)?;
            let schema = category_schema(category).ok_or_else(|| {
                Error::Schema(format!(
                    "unknown section [{section_name}] in {}",
                    path.display()
                ))
            })?;
            let key = ConfigKey::new(category, arch, featureset, flavour);
            for (name, raw) in entries {
                let value = match schema.parse(&name, &raw) {
                    Ok(Some(value)) => value,
                    Ok(None) => {
                        return Err(Error::Schema(format!(
                            "unknown key {name} in {} at {}",
                            key,
                            path.display()
                        )));
                    }
                    Err(Error::Schema(message)) => {
                        return Err(Error::Schema(format!(
                            "{message} for key {name} in {} at {}",
                            key,
                            path.display()
                        )));
                    }
                    Err(e) => return Err(e),
                };
                self.entries.entry(key.clone()).or_default().insert(name, value);
            }
        }
        Ok(())
    }

    /// The section stored at exactly this key, no layer merging
    pub fn section(&self, key: &ConfigKey) -> Option<&Section> {
        self.entries.get(key)
    }

    /// Insert or extend a section; only valid during startup, before the
    /// store is handed to the walker
    pub fn set_section(&mut self, key: ConfigKey, section: Section) {
        self.entries.entry(key).or_default().extend(section);
    }

    /// The precedence list for a dimensional context, most specific first
    fn lookup_keys(
        category: &str,
        arch: Option<&str>,
        featureset: Option<&str>,
        flavour: Option<&str>,
    ) -> Vec<ConfigKey> {
        let mut keys = Vec::new();
        if let (Some(arch), Some(featureset), Some(flavour)) = (arch, featureset, flavour) {
            keys.push(ConfigKey::new(
                category,
                Some(arch),
                Some(featureset),
                Some(flavour),
            ));
        }
        if let (Some(arch), Some(featureset)) = (arch, featureset) {
            keys.push(ConfigKey::new(category, Some(arch), Some(featureset), None));
        }
        if let Some(arch) = arch {
            keys.push(ConfigKey::new(category, Some(arch), None, None));
        }
        if let Some(featureset) = featureset {
            keys.push(ConfigKey::new(category, None, Some(featureset), None));
        }
        keys.push(ConfigKey::new(category, None, None, None));
        keys
    }

    /// The value at the most specific layer defining the key
    pub fn get_opt(
        &self,
        category: &str,
        arch: Option<&str>,
        featureset: Option<&str>,
        flavour: Option<&str>,
        key: &str,
    ) -> Option<&Value> {
        for config_key in Self::lookup_keys(category, arch, featureset, flavour) {
            if let Some(value) = self.entries.get(&config_key).and_then(|s| s.get(key)) {
                return Some(value);
            }
        }
        None
    }

    /// Like [`get_opt`](Self::get_opt) but a missing key is an error
    /// naming the full dimension path
    pub fn get(
        &self,
        category: &str,
        arch: Option<&str>,
        featureset: Option<&str>,
        flavour: Option<&str>,
        key: &str,
    ) -> Result<&Value> {
        self.get_opt(category, arch, featureset, flavour, key)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "config key {key} in {}",
                    ConfigKey::new(category, arch, featureset, flavour)
                ))
            })
    }

    /// Flatten the layers into one record: less specific layers are the
    /// base, more specific layers override individual keys
    pub fn merge(
        &self,
        category: &str,
        arch: Option<&str>,
        featureset: Option<&str>,
        flavour: Option<&str>,
    ) -> Section {
        let mut merged = Section::new();
        for key in Self::lookup_keys(category, arch, featureset, flavour)
            .into_iter()
            .rev()
        {
            if let Some(section) = self.entries.get(&key) {
                merged.extend(section.clone());
            }
        }
        merged
    }

    /// Accumulate a key across the layers: list values concatenate from
    /// most specific to least specific, a scalar at the most specific
    /// layer wins outright
    pub fn get_merge(
        &self,
        category: &str,
        arch: Option<&str>,
        featureset: Option<&str>,
        flavour: Option<&str>,
        key: &str,
    ) -> Option<Value> {
        let mut items: Vec<String> = Vec::new();
        let mut found = false;
        for config_key in Self::lookup_keys(category, arch, featureset, flavour) {
            match self.entries.get(&config_key).and_then(|s| s.get(key)) {
                Some(Value::List(list)) => {
                    items.extend(list.iter().cloned());
                    found = true;
                }
                Some(value) => {
                    if !found {
                        return Some(value.clone());
                    }
                    break;
                }
                None => {}
            }
        }
        found.then_some(Value::List(items))
    }

    /// Dump every section as JSON, keyed by the dimension path
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<()> {
        let map: BTreeMap<String, &Section> = self
            .entries
            .iter()
            .map(|(key, section)| (key.to_string(), section))
            .collect();
        serde_json::to_writer_pretty(&mut *out, &map)
            .map_err(|e| Error::Schema(format!("config dump failed: {e}")))?;
        out.write_all(b"\n")?;
        Ok(())
    }
}

/// Resolve a section name into (category, flavour): either a bare category
/// or `{flavour}_{category}`
fn resolve_section<'a>(name: &'a str, path: &Path) -> Result<(&'a str, Option<&'a str>)> {
    if is_category(name) {
        return Ok((name, None));
    }
    if let Some((flavour, category)) = name.rsplit_once('_')
        && is_category(category)
    {
        return Ok((category, Some(flavour)));
    }
    Err(Error::Schema(format!(
        "unknown section [{name}] in {}",
        path.display()
    )))
}

/// Parse an INI-style defines file: `[section]` headers, `key: value` or
/// `key = value` entries, indented continuation lines, `#`/`;` comments
fn parse_defines(text: &str, path: &Path) -> Result<Vec<(String, Vec<(String, String)>)>> {
    let mut sections: Vec<(String, Vec<(String, String)>)> = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line_no = line_no + 1;
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of the previous value
            let entry = sections
                .last_mut()
                .and_then(|(_, entries)| entries.last_mut())
                .ok_or_else(|| {
                    Error::Schema(format!(
                        "continuation before any entry at {}:{line_no}",
                        path.display()
                    ))
                })?;
            entry.1.push('\n');
            entry.1.push_str(line.trim());
            continue;
        }
        if let Some(name) = line.strip_prefix('[') {
            let name = name.strip_suffix(']').ok_or_else(|| {
                Error::Schema(format!(
                    "malformed section header at {}:{line_no}",
                    path.display()
                ))
            })?;
            sections.push((name.to_string(), Vec::new()));
            continue;
        }
        let split = line
            .char_indices()
            .find(|(_, c)| *c == ':' || *c == '=')
            .map(|(i, _)| i)
            .ok_or_else(|| {
                Error::Schema(format!(
                    "not a key/value entry at {}:{line_no}",
                    path.display()
                ))
            })?;
        let (key, value) = line.split_at(split);
        let (_, entries) = sections.last_mut().ok_or_else(|| {
            Error::Schema(format!(
                "entry outside of any section at {}:{line_no}",
                path.display()
            ))
        })?;
        entries.push((
            key.trim().to_string(),
            value[1..].trim().to_string(),
        ));
    }

    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(entries: &[(ConfigKey, &[(&str, Value)])]) -> ConfigStore {
        let mut store = ConfigStore::default();
        for (key, section) in entries {
            store.set_section(
                key.clone(),
                section
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            );
        }
        store
    }

    #[test]
    fn test_lookup_precedence() {
        let store = store_with(&[
            (
                ConfigKey::new("image", None, None, None),
                &[("install-stem", Value::Str("vmlinuz".into()))],
            ),
            (
                ConfigKey::new("image", Some("amd64"), None, None),
                &[("install-stem", Value::Str("vmlinuz-amd64".into()))],
            ),
        ]);

        let v = store
            .get("image", Some("amd64"), Some("none"), Some("cloud"), "install-stem")
            .unwrap();
        assert_eq!(v.as_str(), Some("vmlinuz-amd64"));

        let v = store.get("image", None, Some("none"), None, "install-stem").unwrap();
        assert_eq!(v.as_str(), Some("vmlinuz"));
    }

    #[test]
    fn test_featureset_layer_below_arch() {
        let store = store_with(&[
            (
                ConfigKey::new("build", None, Some("rt"), None),
                &[("debug-info", Value::Bool(true))],
            ),
            (
                ConfigKey::new("build", Some("amd64"), None, None),
                &[("debug-info", Value::Bool(false))],
            ),
        ]);
        // The arch layer is more specific than the bare featureset layer
        let v = store
            .get("build", Some("amd64"), Some("rt"), None, "debug-info")
            .unwrap();
        assert_eq!(v.as_bool(), Some(false));
    }

    #[test]
    fn test_get_missing_is_error() {
        let store = ConfigStore::default();
        let err = store
            .get("image", Some("amd64"), Some("none"), None, "install-stem")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("install-stem"));
        assert!(message.contains("image/amd64/none"));
    }

    #[test]
    fn test_merge_overrides_per_key() {
        let store = store_with(&[
            (
                ConfigKey::new("base", None, None, None),
                &[
                    ("compiler", Value::Str("gcc".into())),
                    ("cflags", Value::Str("-O2".into())),
                ],
            ),
            (
                ConfigKey::new("base", Some("armhf"), None, None),
                &[("compiler", Value::Str("gcc-12".into()))],
            ),
        ]);

        let merged = store.merge("base", Some("armhf"), None, None);
        // Overridden at the arch layer, but the top-level key stays visible
        assert_eq!(merged.get("compiler").and_then(Value::as_str), Some("gcc-12"));
        assert_eq!(merged.get("cflags").and_then(Value::as_str), Some("-O2"));
    }

    #[test]
    fn test_get_merge_concatenates_lists() {
        let store = store_with(&[
            (
                ConfigKey::new("image", None, None, None),
                &[("depends", Value::List(vec!["kmod".into()]))],
            ),
            (
                ConfigKey::new("image", Some("amd64"), Some("none"), Some("cloud")),
                &[("depends", Value::List(vec!["linux-base".into()]))],
            ),
        ]);
        let v = store
            .get_merge("image", Some("amd64"), Some("none"), Some("cloud"), "depends")
            .unwrap();
        assert_eq!(
            v.as_list().unwrap(),
            &["linux-base".to_string(), "kmod".to_string()]
        );
    }

    #[test]
    fn test_load_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        std::fs::write(
            base.join("defines"),
            "[base]\narches: amd64\nfeaturesets:\n none\n\n[packages]\ninstaller: false\n",
        )
        .unwrap();
        std::fs::create_dir_all(base.join("amd64/none")).unwrap();
        std::fs::write(
            base.join("amd64/defines"),
            "[base]\nkernel-arch: x86\nfeaturesets: none\n\n[cloud_description]\nhardware: cloud platforms\n",
        )
        .unwrap();
        std::fs::write(base.join("amd64/none/defines"), "[base]\nflavours: cloud\n").unwrap();

        let store = ConfigStore::load(&[base.to_path_buf()]).unwrap();
        assert_eq!(
            store
                .get("base", Some("amd64"), None, None, "kernel-arch")
                .unwrap()
                .as_str(),
            Some("x86")
        );
        // [cloud_description] lands in the flavour-scoped description section
        let key = ConfigKey::new("description", Some("amd64"), None, Some("cloud"));
        assert_eq!(
            store.section(&key).unwrap().get("hardware").and_then(Value::as_str),
            Some("cloud platforms")
        );
    }

    #[test]
    fn test_load_later_dir_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("config.local");
        std::fs::create_dir_all(&local).unwrap();
        std::fs::write(
            dir.path().join("defines"),
            "[base]\narches:\n\n[packages]\ndocs: true\n",
        )
        .unwrap();
        std::fs::write(local.join("defines"), "[packages]\ndocs: false\n").unwrap();

        let store =
            ConfigStore::load(&[dir.path().to_path_buf(), local]).unwrap();
        assert_eq!(
            store.get("packages", None, None, None, "docs").unwrap().as_bool(),
            Some(false)
        );
    }

    #[test]
    fn test_load_unknown_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("defines"), "[base]\narchs: amd64\n").unwrap();
        let err = ConfigStore::load(&[dir.path().to_path_buf()]).unwrap_err();
        assert!(err.to_string().contains("archs"));
    }

    #[test]
    fn test_load_unknown_section_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("defines"),
            "[base]\narches:\n\n[bogus]\nkey: value\n",
        )
        .unwrap();
        assert!(ConfigStore::load(&[dir.path().to_path_buf()]).is_err());
    }

    #[test]
    fn test_dump_is_json() {
        let store = store_with(&[(
            ConfigKey::new("base", None, None, None),
            &[("arches", Value::List(vec!["amd64".into()]))],
        )]);
        let mut out = Vec::new();
        store.dump(&mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["base"]["arches"][0], "amd64");
    }
}
