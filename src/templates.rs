// src/templates.rs

//! Template service
//!
//! Looks up named text blobs across a list of template directories, with
//! an optional `.in` suffix marking files that carry `@token@` markers.
//! Reads are cached for the lifetime of one generation run. Control-file
//! templates parse into the typed record kinds.

use crate::control::{BinaryPackage, SourcePackage, TestsControl, read_rfc822};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::debug;

pub struct Templates {
    dirs: Vec<PathBuf>,
    cache: HashMap<String, (String, u32)>,
}

impl Templates {
    pub fn new(dirs: &[PathBuf]) -> Self {
        Self {
            dirs: dirs.to_vec(),
            cache: HashMap::new(),
        }
    }

    fn read(&self, key: &str) -> Result<(String, u32)> {
        for suffix in [".in", ""] {
            for dir in &self.dirs {
                let path = dir.join(format!("{key}{suffix}"));
                if path.exists() {
                    debug!("reading template {}", path.display());
                    let text = std::fs::read_to_string(&path)?;
                    let mode = std::fs::metadata(&path)?.permissions().mode();
                    return Ok((text, mode));
                }
            }
        }
        Err(Error::NotFound(format!("template {key}")))
    }

    fn entry(&mut self, key: &str) -> Result<&(String, u32)> {
        if !self.cache.contains_key(key) {
            let value = self.read(key)?;
            self.cache.insert(key.to_string(), value);
        }
        Ok(&self.cache[key])
    }

    /// The template text; missing templates are an error
    pub fn get(&mut self, key: &str) -> Result<String> {
        Ok(self.entry(key)?.0.clone())
    }

    /// The template text, or None when no directory provides it
    pub fn get_opt(&mut self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            Ok(text) => Ok(Some(text)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The file mode of the template source
    pub fn get_mode(&mut self, key: &str) -> Result<u32> {
        Ok(self.entry(key)?.1)
    }

    pub fn get_control(&mut self, key: &str) -> Result<Vec<BinaryPackage>> {
        read_rfc822(&self.get(key)?)
    }

    pub fn get_source_control(&mut self, key: &str) -> Result<Vec<SourcePackage>> {
        read_rfc822(&self.get(key)?)
    }

    pub fn get_tests_control(&mut self, key: &str) -> Result<Vec<TestsControl>> {
        read_rfc822(&self.get(key)?)
    }
}
