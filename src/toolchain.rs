// src/toolchain.rs

//! External toolchain collaborators
//!
//! Generation shells out for two things: per-architecture variable
//! queries via `dpkg-architecture`, and the installer module list via
//! `kernel-wedge`. Both are synchronous, blocking calls; callers decide
//! whether a failure is fatal or best-effort. The trait keeps the walker
//! testable without either tool installed.

use crate::error::{Error, Result};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

pub trait Toolchain {
    /// Query one `dpkg-architecture` variable for a foreign architecture
    fn dpkg_architecture(&self, arch: &str, variable: &str) -> Result<String>;

    /// Run the installer package-list generator and return its output,
    /// RFC-822 binary package records
    fn installer_packages(&self, config_dir: &Path, abiname: &str) -> Result<String>;
}

/// The real host tools
pub struct HostToolchain;

impl Toolchain for HostToolchain {
    fn dpkg_architecture(&self, arch: &str, variable: &str) -> Result<String> {
        debug!("querying dpkg-architecture {} for {}", variable, arch);
        let output = Command::new("dpkg-architecture")
            .args(["-f", "-a", arch, "-q", variable])
            .stderr(Stdio::null())
            .output()
            .map_err(|e| Error::Collaborator(format!("dpkg-architecture: {e}")))?;
        if !output.status.success() {
            return Err(Error::Collaborator(format!(
                "dpkg-architecture -a {arch} -q {variable} exited with {}",
                output.status
            )));
        }
        let value = String::from_utf8(output.stdout)
            .map_err(|_| Error::Collaborator("dpkg-architecture: invalid output".to_string()))?;
        Ok(value.trim().to_string())
    }

    fn installer_packages(&self, config_dir: &Path, abiname: &str) -> Result<String> {
        debug!("running kernel-wedge gen-control {}", abiname);
        let output = Command::new("kernel-wedge")
            .args(["gen-control", abiname])
            .env("KW_DEFCONFIG_DIR", config_dir)
            .env("KW_CONFIG_DIR", config_dir)
            .output()
            .map_err(|e| Error::Collaborator(format!("kernel-wedge: {e}")))?;
        if !output.status.success() {
            return Err(Error::Collaborator(format!(
                "kernel-wedge exited with {}",
                output.status
            )));
        }
        String::from_utf8(output.stdout)
            .map_err(|_| Error::Collaborator("kernel-wedge: invalid output".to_string()))
    }
}
