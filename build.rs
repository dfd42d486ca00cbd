// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn source_args(cmd: Command) -> Command {
    cmd.arg(Arg::new("archive").help(
        "Archive locator (path, file://, nfs://host:/path, dev://, cdN://, fdN://)",
    ))
    .arg(
        Arg::new("volume")
            .long("volume")
            .action(ArgAction::Append)
            .help("Further volumes of a multi-volume archive, in order"),
    )
    .arg(
        Arg::new("profile")
            .short('p')
            .long("profile")
            .value_name("FILE")
            .help("Replay a saved session profile"),
    )
}

fn selection_args(cmd: Command) -> Command {
    let flag = |name: &'static str, help: &'static str| {
        Arg::new(name).long(name).action(ArgAction::SetTrue).help(help)
    };

    cmd.arg(flag("select-all", "Select every package in the archive"))
        .arg(flag(
            "exclude-missing",
            "With --select-all: skip packages that are no longer installed",
        ))
        .arg(flag(
            "exclude-mismatched",
            "With --select-all: skip packages installed in another version",
        ))
        .arg(
            Arg::new("only")
                .long("only")
                .action(ArgAction::Append)
                .help("Restore only these packages (_NoPackage_ for unowned files)"),
        )
        .arg(
            Arg::new("skip")
                .long("skip")
                .action(ArgAction::Append)
                .help("Do not restore these packages"),
        )
        .arg(flag("complete", "Restore every package regardless of the selection"))
        .arg(flag("restore-rpmdb", "Restore the package database from the archive"))
        .arg(flag("keep-rpmdb", "Keep the installed package database"))
        .arg(flag("no-bootloader", "Do not reconfigure the boot loader afterwards"))
}

fn build_cli() -> Command {
    Command::new("restorer")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Restorer Contributors")
        .about("Restore files and packages from backup archives")
        .subcommand_required(true)
        .arg(
            Arg::new("tar")
                .long("tar")
                .global(true)
                .default_value("/bin/tar")
                .help("GNU tar binary"),
        )
        .arg(
            Arg::new("star")
                .long("star")
                .global(true)
                .default_value("/usr/bin/star")
                .help("star binary, needed for .star subarchives"),
        )
        .arg(
            Arg::new("rpm")
                .long("rpm")
                .global(true)
                .default_value("rpm")
                .help("rpm binary used to query installed packages"),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .global(true)
                .help("Query the package database below this root"),
        )
        .arg(
            Arg::new("converter")
                .long("converter")
                .global(true)
                .help("Program converting the package-info blob to JSON"),
        )
        .arg(
            Arg::new("rpmdb-backup-script")
                .long("rpmdb-backup-script")
                .global(true)
                .default_value("/etc/cron.daily/suse.de-backup-rpmdb")
                .help("Script backing up the package database before it is replaced"),
        )
        .subcommand(
            source_args(Command::new("inspect"))
                .about("Show archive contents and how they compare to the installed system")
                .arg(
                    Arg::new("packages")
                        .short('l')
                        .long("packages")
                        .action(ArgAction::SetTrue)
                        .help("List every package with its selection"),
                ),
        )
        .subcommand(selection_args(source_args(
            Command::new("propose")
                .about("Recommend whether the package database should be restored"),
        )))
        .subcommand(
            selection_args(source_args(
                Command::new("restore").about("Restore the selected packages"),
            ))
            .arg(
                Arg::new("target")
                    .short('t')
                    .long("target")
                    .default_value("/")
                    .help("Directory to restore into"),
            )
            .arg(
                Arg::new("dry-run")
                    .long("dry-run")
                    .action(ArgAction::SetTrue)
                    .help("Walk the selection without extracting anything"),
            )
            .arg(
                Arg::new("bootloader-cmd")
                    .long("bootloader-cmd")
                    .help("Command reconfiguring the boot loader"),
            )
            .arg(
                Arg::new("installer-cmd")
                    .long("installer-cmd")
                    .help("Command installing a missing tool package"),
            )
            .arg(
                Arg::new("stop-file")
                    .long("stop-file")
                    .help("Abort the restore as soon as this file exists"),
            ),
        )
        .subcommand(
            selection_args(source_args(
                Command::new("export-profile")
                    .about("Save the selection as a profile for a later restore"),
            ))
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .required(true)
                    .help("Output file"),
            )
            .arg(
                Arg::new("config-only")
                    .long("config-only")
                    .action(ArgAction::SetTrue)
                    .help("Prepare the profile for another machine; the locally installed packages are ignored"),
            ),
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
    man.render(&mut buffer)
        .expect("Failed to render man page");

    let man_path = man_dir.join("restorer.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");

    println!("cargo:warning=Man page generated at {}", man_path.display());
}
