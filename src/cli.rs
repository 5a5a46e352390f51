use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(version)]
#[command(about = "Make a resource store match the declarations in a project", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what a deploy would change, without changing anything
    Plan(ProjectArgs),

    /// Create, update and delete resources until the store matches the project
    Deploy(DeployArgs),

    /// Delete every declared resource from the store
    Clean(CleanArgs),

    /// List resource kinds in deployment order
    Kinds,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args)]
pub struct ProjectArgs {
    /// Project directory
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Print a masked diff for every changed resource
    #[arg(long)]
    pub verbose_diff: bool,

    /// Also plan deletion of resources that are not declared
    #[arg(long)]
    pub prune: bool,
}

#[derive(Args)]
pub struct DeployArgs {
    /// Project directory
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Dry run - show what would be done
    #[arg(short, long)]
    pub dry_run: bool,

    /// Redeploy resources even when they are unchanged
    #[arg(long)]
    pub force_update: bool,

    /// Print a masked diff for every changed resource
    #[arg(long)]
    pub verbose_diff: bool,

    /// Delete resources that are not declared
    #[arg(long)]
    pub prune: bool,

    /// Stop dispatching after the first failed call
    #[arg(long)]
    pub fail_fast: bool,

    /// Number of parallel jobs
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Give up dispatching after this many seconds
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Args)]
pub struct CleanArgs {
    /// Project directory
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Dry run - show what would be deleted
    #[arg(short, long)]
    pub dry_run: bool,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}
