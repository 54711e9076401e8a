// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn build_cli() -> Command {
    Command::new("gencontrol")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Generate control metadata and build rules for the kernel packaging matrix")
        .arg(
            Arg::new("config_dirs")
                .short('c')
                .long("config-dir")
                .value_name("DIR")
                .action(ArgAction::Append)
                .help("Configuration directories; later directories override earlier ones"),
        )
        .arg(
            Arg::new("template_dirs")
                .short('t')
                .long("template-dir")
                .value_name("DIR")
                .action(ArgAction::Append)
                .help("Template directories, searched in order"),
        )
        .arg(
            Arg::new("changelog")
                .long("changelog")
                .value_name("FILE")
                .default_value("debian/changelog")
                .help("Changelog driving the version and release policy checks"),
        )
        .arg(
            Arg::new("output_dir")
                .short('o')
                .long("output-dir")
                .value_name("DIR")
                .default_value("debian")
                .help("Directory receiving control, rules.gen and tests/control"),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("gencontrol.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
