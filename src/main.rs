// src/main.rs

use anyhow::Result;
use clap::Parser;
use gencontrol::gencontrol::{Gencontrol, Options};
use gencontrol::toolchain::HostToolchain;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "gencontrol")]
#[command(author, version, about = "Generate control metadata and build rules for the kernel packaging matrix", long_about = None)]
struct Cli {
    /// Configuration directories; later directories override earlier ones
    #[arg(
        short = 'c',
        long = "config-dir",
        value_name = "DIR",
        default_values = ["debian/config", "debian/config.local"]
    )]
    config_dirs: Vec<PathBuf>,

    /// Template directories, searched in order
    #[arg(
        short = 't',
        long = "template-dir",
        value_name = "DIR",
        default_values = ["debian/templates"]
    )]
    template_dirs: Vec<PathBuf>,

    /// Changelog driving the version and release policy checks
    #[arg(long, value_name = "FILE", default_value = "debian/changelog")]
    changelog: PathBuf,

    /// Directory receiving control, rules.gen and tests/control
    #[arg(short = 'o', long, value_name = "DIR", default_value = "debian")]
    output_dir: PathBuf,
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let options = Options {
        config_dirs: cli.config_dirs,
        template_dirs: cli.template_dirs,
        changelog_path: cli.changelog,
        output_dir: cli.output_dir,
        disable_installer: std::env::var_os("DEBIAN_KERNEL_DISABLE_INSTALLER").is_some(),
        disable_signed: std::env::var_os("DEBIAN_KERNEL_DISABLE_SIGNED").is_some(),
    };

    let mut gencontrol = Gencontrol::new(options, Box::new(HostToolchain))?;
    info!(
        "generating for {} {}",
        gencontrol.version().debian.complete(),
        gencontrol.abiname()
    );
    gencontrol.run()?;
    Ok(())
}
