// src/main.rs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use restorer::archive::pkginfo::{CommandConverter, PackageInfoConverter, TextConverter};
use restorer::config::{RestoreOptions, ToolPaths};
use restorer::hooks::{CommandHook, DeclineInstall, ProgressSink, ToolInstaller};
use restorer::mount::SystemMounter;
use restorer::packages::RpmDatabase;
use restorer::rpmdb::Proposal;
use restorer::selection::SelectionState;
use restorer::{Collaborators, RestoreSession, SessionProfile};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "restorer")]
#[command(author, version, about = "Restore files and packages from backup archives", long_about = None)]
struct Cli {
    #[command(flatten)]
    tools: ToolArgs,

    #[command(subcommand)]
    command: Commands,
}

/// External programs used while restoring
#[derive(Args)]
struct ToolArgs {
    /// GNU tar binary
    #[arg(long, global = true, default_value = "/bin/tar")]
    tar: PathBuf,
    /// star binary, needed for .star subarchives
    #[arg(long, global = true, default_value = "/usr/bin/star")]
    star: PathBuf,
    /// rpm binary used to query installed packages
    #[arg(long, global = true, default_value = "rpm")]
    rpm: PathBuf,
    /// Query the package database below this root
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Program converting the package-info blob to JSON (built-in parser if omitted)
    #[arg(long, global = true)]
    converter: Option<PathBuf>,
    /// Script backing up the package database before it is replaced
    #[arg(long, global = true, default_value = restorer::hooks::DEFAULT_RPMDB_BACKUP_SCRIPT)]
    rpmdb_backup_script: PathBuf,
}

/// Where the archive comes from
#[derive(Args)]
struct SourceArgs {
    /// Archive locator (path, file://, nfs://host:/path, dev://, cdN://, fdN://)
    archive: Option<String>,
    /// Further volumes of a multi-volume archive, in order
    #[arg(long = "volume")]
    volumes: Vec<String>,
    /// Replay a saved session profile
    #[arg(short, long)]
    profile: Option<PathBuf>,
}

/// Which packages to restore
#[derive(Args)]
struct SelectionArgs {
    /// Select every package in the archive
    #[arg(long)]
    select_all: bool,
    /// With --select-all: skip packages that are no longer installed
    #[arg(long)]
    exclude_missing: bool,
    /// With --select-all: skip packages installed in another version
    #[arg(long)]
    exclude_mismatched: bool,
    /// Restore only these packages (`_NoPackage_` for unowned files)
    #[arg(long = "only")]
    only: Vec<String>,
    /// Do not restore these packages
    #[arg(long = "skip")]
    skip: Vec<String>,
    /// Restore every package regardless of the selection
    #[arg(long)]
    complete: bool,
    /// Restore the package database from the archive
    #[arg(long, conflicts_with = "keep_rpmdb")]
    restore_rpmdb: bool,
    /// Keep the installed package database
    #[arg(long)]
    keep_rpmdb: bool,
    /// Do not reconfigure the boot loader afterwards
    #[arg(long)]
    no_bootloader: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show archive contents and how they compare to the installed system
    Inspect {
        #[command(flatten)]
        source: SourceArgs,
        /// List every package with its selection
        #[arg(short = 'l', long)]
        packages: bool,
    },
    /// Recommend whether the package database should be restored
    Propose {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Restore the selected packages
    Restore {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        selection: SelectionArgs,
        /// Directory to restore into
        #[arg(short, long, default_value = "/")]
        target: PathBuf,
        /// Walk the selection without extracting anything
        #[arg(long)]
        dry_run: bool,
        /// Command reconfiguring the boot loader
        #[arg(long)]
        bootloader_cmd: Option<String>,
        /// Command installing a missing tool package, e.g. "zypper -n install"
        #[arg(long)]
        installer_cmd: Option<String>,
        /// Abort the restore as soon as this file exists
        #[arg(long)]
        stop_file: Option<PathBuf>,
    },
    /// Save the selection as a profile for a later restore
    ExportProfile {
        #[command(flatten)]
        source: SourceArgs,
        #[command(flatten)]
        selection: SelectionArgs,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Prepare the profile for another machine; the locally installed
        /// packages are ignored
        #[arg(long)]
        config_only: bool,
    },
}

/// Prints one line per package
struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn package_started(&mut self, index: usize, total: usize, name: &str) {
        let name = if name.is_empty() { "files not owned by any package" } else { name };
        println!("[{}/{}] Restoring {}", index + 1, total, name);
    }

    fn bootloader_started(&mut self) {
        println!("Configuring boot loader...");
    }

    fn error(&mut self, message: &str) {
        eprintln!("Error: {}", message);
    }
}

/// Split "program arg..." into a command hook
fn command_hook(command: &str) -> Result<CommandHook> {
    let mut words = command.split_whitespace();
    let program = words
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty command"))?;
    Ok(words.fold(CommandHook::new(program), CommandHook::arg))
}

fn open_session(
    tools: &ToolArgs,
    bootloader_cmd: Option<&str>,
    installer_cmd: Option<&str>,
) -> Result<RestoreSession> {
    let mut database = RpmDatabase::new(&tools.rpm);
    if let Some(root) = &tools.root {
        database = database.with_root(root);
    }
    let converter: Box<dyn PackageInfoConverter> = match &tools.converter {
        Some(program) => Box::new(CommandConverter::new(program)),
        None => Box::new(TextConverter),
    };
    let installer: Box<dyn ToolInstaller> = match installer_cmd {
        Some(cmd) => Box::new(command_hook(cmd)?),
        None => Box::new(DeclineInstall),
    };
    let bootloader = match bootloader_cmd {
        Some(cmd) => Some(Box::new(command_hook(cmd)?) as Box<dyn restorer::hooks::Bootloader>),
        None => None,
    };

    let collaborators = Collaborators {
        source: Box::new(SystemMounter::default()),
        database: Box::new(database),
        converter,
        bootloader,
        installer,
    };
    let paths = ToolPaths {
        tar: tools.tar.clone(),
        star: tools.star.clone(),
        rpmdb_backup_script: tools.rpmdb_backup_script.clone(),
    };
    Ok(RestoreSession::with_tools(collaborators, paths)?)
}

/// Read the archive (and further volumes) named on the command line or in
/// the profile
fn load_archive(session: &mut RestoreSession, source: &SourceArgs) -> Result<()> {
    let mut locators = Vec::new();

    if let Some(path) = &source.profile {
        let profile = SessionProfile::load(path)
            .with_context(|| format!("Cannot load profile {}", path.display()))?;
        info!("Loaded profile {}", path.display());
        session.import(profile);
        locators = session.archive_locators().to_vec();
    }
    if let Some(archive) = &source.archive {
        locators = vec![archive.clone()];
    }
    if !source.volumes.is_empty() {
        locators.truncate(1);
        locators.extend(source.volumes.iter().cloned());
    }

    let Some((primary, volumes)) = locators.split_first() else {
        return Err(anyhow::anyhow!("No archive given"));
    };
    session
        .read(primary)
        .with_context(|| format!("Cannot read archive {}", primary))?;

    let multi_volume = session.archive().is_some_and(|a| a.is_multi_volume());
    if !multi_volume {
        if !volumes.is_empty() {
            warn!("{} is a single-volume archive, ignoring extra volumes", primary);
        }
        return Ok(());
    }

    for volume in volumes {
        let status = session
            .read_next_volume(volume)
            .with_context(|| format!("Cannot read volume {}", volume))?;
        if !status.success {
            return Err(anyhow::anyhow!("{} is not the next volume of {}", volume, primary));
        }
        if status.last_volume {
            break;
        }
    }
    if !session.test_all_volumes() {
        return Err(anyhow::anyhow!("The archive volumes are incomplete or damaged"));
    }
    Ok(())
}

fn apply_selection(session: &mut RestoreSession, args: &SelectionArgs) -> Result<()> {
    if args.select_all {
        session.select_all(args.exclude_missing, args.exclude_mismatched)?;
    }
    if !args.only.is_empty() {
        session.deselect_all();
        for name in &args.only {
            if !session.set_selection(name, SelectionState::All) {
                warn!("Ignoring unknown package {}", name);
            }
        }
    }
    for name in &args.skip {
        session.set_selection(name, SelectionState::None);
    }

    let mut options = session.options().clone();
    options.complete_restoration |= args.complete;
    if args.no_bootloader {
        options.run_bootloader = false;
    }
    if args.restore_rpmdb {
        options.restore_rpmdb = Some(true);
    } else if args.keep_rpmdb {
        options.restore_rpmdb = Some(false);
    }
    session.set_options(options);
    Ok(())
}

fn print_proposal(proposal: &Proposal) {
    match proposal {
        Proposal::Restore => println!("Restoring the package database is recommended."),
        Proposal::DoNotRestore => println!("Keeping the installed package database is recommended."),
        Proposal::Ambiguous(conflicts) => {
            println!("Neither choice keeps the package database consistent.");
            for (name, installed) in &conflicts.mismatched {
                println!("  selected, installed as {}: {}", installed, name);
            }
            for (name, entry) in &conflicts.missing {
                println!("  not installed: {}-{}", name, entry.version);
            }
            for (name, entry) in &conflicts.extra {
                println!("  not in backup: {}-{}", name, entry.version);
            }
            println!("Use --restore-rpmdb or --keep-rpmdb to decide.");
        }
    }
}

fn abort_on_file(stop_file: Option<&Path>) -> impl FnMut() -> bool + '_ {
    move || stop_file.is_some_and(Path::exists)
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

    match cli.command {
        Commands::Inspect { source, packages } => {
            let mut session = open_session(&cli.tools, None, None)?;
            load_archive(&mut session, &source)?;
            println!("{}", session.summary());

            let missing = session.missing_packages()?;
            let extra = session.extra_packages()?;
            let mismatched = session.mismatched_packages()?;
            println!(
                "Packages: {} missing, {} extra, {} in another version",
                missing.len(),
                extra.len(),
                mismatched.len()
            );
            if session.rpmdb_restorable() {
                println!("The archive contains a package database.");
            }

            if packages {
                let Some(archive) = session.archive() else {
                    return Ok(());
                };
                for package in &archive.packages {
                    let mark = match session.selection().get(&package.name) {
                        Some(SelectionState::All) => "X",
                        Some(SelectionState::Partial(_)) => "P",
                        _ => " ",
                    };
                    let name = if package.is_no_package() {
                        restorer::archive::NO_PACKAGE_ID.to_string()
                    } else {
                        package.full_name()
                    };
                    println!(
                        "[{}] {:<40} {:>6} files  {}",
                        mark,
                        name,
                        package.member_files.len(),
                        package.description
                    );
                }
            }
            Ok(())
        }
        Commands::Propose { source, selection } => {
            let mut session = open_session(&cli.tools, None, None)?;
            load_archive(&mut session, &source)?;
            apply_selection(&mut session, &selection)?;

            if !session.rpmdb_restorable() {
                println!("The archive does not contain a package database.");
                return Ok(());
            }
            print_proposal(&session.propose_rpmdb_restoration()?);
            Ok(())
        }
        Commands::Restore {
            source,
            selection,
            target,
            dry_run,
            bootloader_cmd,
            installer_cmd,
            stop_file,
        } => {
            let mut session =
                open_session(&cli.tools, bootloader_cmd.as_deref(), installer_cmd.as_deref())?;
            load_archive(&mut session, &source)?;
            apply_selection(&mut session, &selection)?;

            if session.options().restore_rpmdb.is_none() {
                let restore = session.rpmdb_restorable()
                    && match session.propose_rpmdb_restoration()? {
                        Proposal::Restore => true,
                        Proposal::DoNotRestore => false,
                        ambiguous @ Proposal::Ambiguous(_) => {
                            print_proposal(&ambiguous);
                            return Err(anyhow::anyhow!("Package database restoration is undecided"));
                        }
                    };
                info!("Restore package database: {}", restore);
                session.set_options(RestoreOptions {
                    restore_rpmdb: Some(restore),
                    ..session.options().clone()
                });
            }
            session.set_options(RestoreOptions {
                dry_run,
                ..session.options().clone()
            });

            println!("{}", session.summary());
            let mut abort = abort_on_file(stop_file.as_deref());
            let mut progress = ConsoleProgress;
            let result = session.write(&mut abort, Some(&mut progress), &target)?;

            println!(
                "Restored {} files from {} packages",
                result.restored_files.len(),
                result.restored_packages
            );
            if !result.failed_files.is_empty() {
                println!("Failed to restore {} files:", result.failed_files.len());
                for file in &result.failed_files {
                    println!("  {}", file);
                }
            }
            match result.bootloader {
                Some(true) => println!("Boot loader configured."),
                Some(false) => println!("Boot loader configuration failed."),
                None => {}
            }

            if result.aborted {
                return Err(anyhow::anyhow!("Restoration aborted"));
            }
            if !result.succeeded() {
                return Err(anyhow::anyhow!("Some files could not be restored"));
            }
            Ok(())
        }
        Commands::ExportProfile {
            source,
            selection,
            output,
            config_only,
        } => {
            let mut session = open_session(&cli.tools, None, None)?;
            if config_only {
                session.set_options(RestoreOptions {
                    config_only: true,
                    ..session.options().clone()
                });
            }
            load_archive(&mut session, &source)?;
            apply_selection(&mut session, &selection)?;

            session
                .export()
                .save(&output)
                .with_context(|| format!("Cannot write profile {}", output.display()))?;
            session.set_modified(false);
            println!("Profile written to {}", output.display());
            Ok(())
        }
    }
}
