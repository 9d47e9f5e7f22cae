#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand};

use shipyard_config::{Config, ProjectSettings};
use shipyard_docker::DockerCli;
use shipyard_engine::{
    scripts, ConfiguredPublishers, DistOptions, DistOutcome, FpmCli, GitSource, JobRun, Project, Services,
};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Debug, Parser)]
#[command(name = "shipyard", about = "Build, package and release software in containers")]
#[command(version)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Orchestrator configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

/// What to build: a repository, one of its jobs and a branch.
#[derive(Debug, Args)]
struct JobArgs {
    /// Repository URL (`git://…`, `git+ssh://…` or `git@github.com:user/name`)
    git_url: String,
    /// Job declared in the repository's shipyard.toml
    job: String,
    /// Branch to check out
    branch: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a job and keep the result image
    Build {
        #[command(flatten)]
        target: JobArgs,
        /// Do not run the job's tests
        #[arg(long)]
        skip_tests: bool,
    },
    /// Build, package and release a job's packages
    Dist {
        #[command(flatten)]
        target: JobArgs,
        /// Codename to release to (defaults to the branch's configured codename)
        #[arg(long)]
        codename: Option<String>,
        /// Build anyway when the branch has no codename
        #[arg(long)]
        or_just_build: bool,
        /// Do not run the job's tests
        #[arg(long)]
        skip_tests: bool,
        /// Only release this package
        #[arg(long)]
        package: Option<String>,
        /// Release to this repository instead of the configured ones
        #[arg(long)]
        repo: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.config.as_deref();
    let result = match cli.command {
        Command::Build { target, skip_tests } => cmd_build(config, &target, skip_tests),
        Command::Dist {
            target,
            codename,
            or_just_build,
            skip_tests,
            package,
            repo,
        } => cmd_dist(
            config,
            &target,
            DistOptions {
                codename,
                or_just_build,
                skip_tests,
                package,
                repo,
            },
        ),
    };

    if let Err(msg) = result {
        eprintln!("fatal: {msg}");
        process::exit(1);
    }
}

fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// `RUST_LOG` overrides the level picked from `-v`.
fn init_logging(verbose: u8) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_filter(verbose)))
        .format_timestamp_secs()
        .init();
}

/// Everything a flow needs once the branch is checked out.
struct Workspace {
    config: Config,
    home: PathBuf,
    scripts_dir: PathBuf,
    project: Project,
    source: GitSource,
    settings: ProjectSettings,
}

impl Workspace {
    fn prepare(config_path: Option<&Path>, target: &JobArgs) -> Result<Self, Box<dyn Error>> {
        let config = Config::load(config_path)?;
        let home = config.home()?;
        let scripts_dir = scripts::materialise(&home)?;
        let project = Project::new(&target.git_url, &home, &target.branch, &target.job)?;
        log::info!(
            "{} job `{}` on branch `{}`",
            project.name,
            project.job,
            project.branch
        );
        let source = GitSource::checkout(&project.clone_url, &project.source_path(), &project.branch)?;
        let settings = ProjectSettings::from_source(source.path())?;
        Ok(Self {
            config,
            home,
            scripts_dir,
            project,
            source,
            settings,
        })
    }

    fn run(&self) -> JobRun<'_> {
        JobRun {
            config: &self.config,
            project: &self.project,
            settings: &self.settings,
            source: &self.source,
            scripts_dir: &self.scripts_dir,
        }
    }
}

fn cmd_build(config: Option<&Path>, target: &JobArgs, skip_tests: bool) -> CliResult {
    let workspace = Workspace::prepare(config, target)?;
    let docker = DockerCli::new();
    let fpm = FpmCli::new();
    let publishers = ConfiguredPublishers::new(&workspace.config, &workspace.home);
    let services = Services {
        runtime: &docker,
        image_builder: &docker,
        packaging: &fpm,
        publishers: &publishers,
    };

    let image = shipyard_engine::build(&services, &workspace.run(), skip_tests)?;
    eprintln!("    Built {}", image.reference());
    Ok(())
}

fn cmd_dist(config: Option<&Path>, target: &JobArgs, options: DistOptions) -> CliResult {
    let workspace = Workspace::prepare(config, target)?;
    let docker = DockerCli::new();
    let fpm = FpmCli::new();
    let publishers = ConfiguredPublishers::new(&workspace.config, &workspace.home);
    let services = Services {
        runtime: &docker,
        image_builder: &docker,
        packaging: &fpm,
        publishers: &publishers,
    };

    match shipyard_engine::dist(&services, &workspace.run(), &options)? {
        DistOutcome::Skipped => eprintln!("    Skipped {}", workspace.project.branch),
        DistOutcome::Built => eprintln!("    Built {} (not packaged)", workspace.project.branch),
        DistOutcome::Released(summary) => {
            for name in &summary.already_published {
                eprintln!("    Published {name} (already)");
            }
            for name in &summary.promoted {
                eprintln!("     Promoted {name}");
            }
            for name in &summary.packaged {
                eprintln!("     Released {name}");
            }
            for name in &summary.unchanged {
                eprintln!("    Unchanged {name}");
            }
        }
    }
    Ok(())
}
