// src/main.rs

use clap::{Parser, Subcommand};
use consign::package::{PackageConfig, PackageCreator};
use consign::repository::{PackageRepository, RecordFilter};
use consign::update::{CommandHook, ManifestHook, UpdateManager, ValidationHook};
use consign::version::{CompatPolicy, Version};
use consign::{paths, Error};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser)]
#[command(name = "consign")]
#[command(author, version, about = "Deployment packaging and staged updates for embedded targets", long_about = None)]
struct Cli {
    /// State root for repository, staging and backups
    #[arg(long, global = true, default_value = paths::DEFAULT_STATE_ROOT)]
    state_root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a deployment package from the current project
    CreatePackage {
        /// Package version (overrides consign.toml)
        #[arg(short, long)]
        version: Option<String>,
        /// Output path for the archive
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Path to consign.toml (default: discovered from cwd)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Store a built package in the local repository
    Store {
        /// Path to the package archive
        package_path: PathBuf,
        /// Runtime dependencies to record (repeatable)
        #[arg(short, long)]
        dependency: Vec<String>,
    },
    /// List stored packages
    List {
        /// Only packages with this name
        #[arg(short, long)]
        name: Option<String>,
        /// Only packages for this platform
        #[arg(short, long)]
        platform: Option<String>,
    },
    /// Search stored packages by name substring
    Search { query: String },
    /// Show one stored package record
    Show {
        /// Package id, e.g. gtach-v0.1.0
        id: String,
    },
    /// Verify a stored artifact against its recorded checksum
    Verify { id: String },
    /// Remove a package record and its artifact
    Prune { id: String },
    /// Apply a stored package version to an install directory
    Update {
        /// Package name
        name: String,
        /// Target version
        #[arg(long)]
        to: String,
        /// Live install directory
        #[arg(long)]
        install_dir: Option<PathBuf>,
        /// Permit a major version jump
        #[arg(long)]
        allow_major: bool,
        /// External validation command, run with the staged dir as argument
        #[arg(long)]
        hook: Option<String>,
    },
}

fn run(cli: Cli) -> consign::Result<()> {
    match cli.command {
        Some(Commands::CreatePackage {
            version,
            output,
            config,
        }) => {
            let creator = match &config {
                Some(path) => {
                    let root = path
                        .parent()
                        .filter(|p| !p.as_os_str().is_empty())
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("."));
                    PackageCreator::new(root)
                }
                None => PackageCreator::discover(&std::env::current_dir()?)?,
            };
            let config_path = config
                .unwrap_or_else(|| creator.project_root().join(consign::package::CONFIG_NAME));
            let pkg_config = PackageConfig::from_file(&config_path, version.as_deref())?;

            info!("creating package {} v{}", pkg_config.name, pkg_config.version);
            let artifact = creator.create_package(&pkg_config, output.as_deref())?;
            println!("Created {}", artifact.display());
            Ok(())
        }
        Some(Commands::Store {
            package_path,
            dependency,
        }) => {
            let repo = PackageRepository::open(paths::repository_dir(&cli.state_root))?;
            let record = repo.store(&package_path, dependency)?;
            println!("Stored {} ({})", record.id, record.checksum);
            Ok(())
        }
        Some(Commands::List { name, platform }) => {
            let repo = PackageRepository::open(paths::repository_dir(&cli.state_root))?;
            let filter = RecordFilter {
                name,
                platform,
                ..Default::default()
            };
            let records = repo.list(Some(&filter));
            if records.is_empty() {
                println!("No packages stored");
            }
            for r in records {
                println!("{}  {}  {}  {}", r.id, r.platform, r.created_at.to_rfc3339(), r.checksum);
            }
            Ok(())
        }
        Some(Commands::Search { query }) => {
            let repo = PackageRepository::open(paths::repository_dir(&cli.state_root))?;
            for r in repo.search(&query) {
                println!("{}  {}", r.id, r.platform);
            }
            Ok(())
        }
        Some(Commands::Show { id }) => {
            let repo = PackageRepository::open(paths::repository_dir(&cli.state_root))?;
            let r = repo.get(&id)?;
            println!("Package:      {}", r.name);
            println!("Version:      {}", r.version);
            println!("Platform:     {}", r.platform);
            println!("Archive:      {}", r.archive_path.display());
            println!("Checksum:     {}", r.checksum);
            println!("Stored:       {}", r.created_at.to_rfc3339());
            if !r.dependencies.is_empty() {
                println!("Dependencies: {}", r.dependencies.join(", "));
            }
            Ok(())
        }
        Some(Commands::Verify { id }) => {
            let repo = PackageRepository::open(paths::repository_dir(&cli.state_root))?;
            repo.verify(&id)?;
            println!("{id}: OK");
            Ok(())
        }
        Some(Commands::Prune { id }) => {
            let repo = PackageRepository::open(paths::repository_dir(&cli.state_root))?;
            repo.prune(&id)?;
            println!("Pruned {id}");
            Ok(())
        }
        Some(Commands::Update {
            name,
            to,
            install_dir,
            allow_major,
            hook,
        }) => {
            let target = Version::parse(&to)?;
            let repo = PackageRepository::open(paths::repository_dir(&cli.state_root))?;
            let install_dir =
                install_dir.unwrap_or_else(|| PathBuf::from("/opt").join(&name));
            let manager = UpdateManager::new(
                &repo,
                &cli.state_root,
                &install_dir,
                CompatPolicy {
                    allow_major_jump: allow_major,
                },
            );

            let hook: Box<dyn ValidationHook> = match hook {
                Some(cmd) => Box::new(CommandHook::new(cmd)),
                None => Box::new(ManifestHook),
            };

            let report = manager.apply(&name, &target, hook.as_ref())?;
            match report.from_version {
                Some(from) => println!("Updated {name} {from} -> {}", report.to_version),
                None => println!("Installed {name} {}", report.to_version),
            }
            Ok(())
        }
        None => {
            println!("consign v{}", env!("CARGO_PKG_VERSION"));
            println!("Run 'consign --help' for usage information");
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            let mut source: Option<&Error> = match &e {
                Error::Phase { source, .. } => Some(source),
                _ => None,
            };
            while let Some(inner) = source {
                eprintln!("  caused by: {inner}");
                source = match inner {
                    Error::Phase { source, .. } => Some(source),
                    _ => None,
                };
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
