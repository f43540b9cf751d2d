//! Command-line definitions.

use clap::builder::styling::{AnsiColor, Color, Styles};
use clap::{Args, Parser, Subcommand};

use atlas::output::OutputFormat;

/// Custom styles for help output - matches atlas's message color scheme.
fn help_styles() -> Styles {
    Styles::styled()
        .header(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .usage(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .literal(
            anstyle::Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Cyan))),
        )
        .placeholder(anstyle::Style::new().fg_color(Some(Color::Ansi(AnsiColor::Cyan))))
}

#[derive(Parser)]
#[command(
    name = "atlas",
    version,
    about = "Crash-safe, human-gated orchestration for AI-assisted development tasks",
    styles = help_styles()
)]
pub struct Cli {
    /// Show debug logging (also RUST_LOG=debug)
    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a workspace and its first task, then run the engine
    Start {
        /// Workspace name (filesystem-safe)
        workspace: String,
        /// What the task should accomplish
        description: String,
        /// Template naming the step list
        #[arg(long, default_value = "feature")]
        template: String,
        /// Branch name (default: atlas/<workspace>)
        #[arg(long)]
        branch: Option<String>,
        /// Base branch to fork from (default from config)
        #[arg(long)]
        base: Option<String>,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Re-enter a parked or failed task
    Resume {
        workspace: String,
        /// Feed prior failure context back to the AI agent
        #[arg(long)]
        ai_fix: bool,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Approve a task awaiting approval
    Approve {
        workspace: Option<String>,
        /// Approve without the interactive menu
        #[arg(long)]
        auto_approve: bool,
        /// Also close the workspace
        #[arg(long)]
        close: bool,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Reject a task awaiting approval
    Reject {
        workspace: Option<String>,
        /// Rewind and retry with feedback
        #[arg(long, requires = "feedback")]
        retry: bool,
        /// Mark rejected; keep the branch for manual work
        #[arg(long, conflicts_with_all = ["retry", "feedback", "step"])]
        done: bool,
        /// Feedback for the retry (required with --retry)
        #[arg(long)]
        feedback: Option<String>,
        /// 1-based step to resume from (default: first implementation step)
        #[arg(long)]
        step: Option<usize>,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Show workspaces and tasks
    Status {
        /// Refresh continuously
        #[arg(long)]
        watch: bool,
        /// Watch refresh interval in seconds
        #[arg(long, default_value_t = 5)]
        interval: u64,
        /// Include per-task step progress
        #[arg(long)]
        progress: bool,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Run all validation stages in the current directory
    Validate(StageArgs),
    /// Run the format stage
    Format(StageArgs),
    /// Run the lint stage
    Lint(StageArgs),
    /// Run the test stage
    Test(StageArgs),
    /// Record a manual checkpoint on the active task's hook
    Checkpoint {
        /// Checkpoint description
        description: Option<String>,
        /// Trigger tag to record
        #[arg(long, default_value = "manual")]
        trigger: String,
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Prune stale hooks per the retention policy
    Cleanup {
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
        /// Prune hook records
        #[arg(long)]
        hooks: bool,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Inspect a task's recovery hook
    Hook {
        #[command(subcommand)]
        command: HookCommand,
    },
    /// Workspace life-cycle
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    /// Abandon the workspace's active task (terminal)
    Abandon {
        workspace: String,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
}

#[derive(Args)]
pub struct StageArgs {
    /// Suppress per-command progress lines
    #[arg(long)]
    pub quiet: bool,
    /// Stream command output line-by-line
    #[arg(long)]
    pub verbose: bool,
    #[arg(long, value_enum, default_value_t)]
    pub output: OutputFormat,
}

#[derive(Subcommand)]
pub enum HookCommand {
    /// Summarise the hook's state and step context
    Status {
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// List checkpoints
    Checkpoints {
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Initialise a hook for a task that predates hook support
    Install {
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Verify one validation receipt's signature
    VerifyReceipt {
        /// Receipt id (e.g. r-3)
        id: String,
        #[arg(long)]
        workspace: Option<String>,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Rewrite HOOK.md from hook.json
    Regenerate {
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Print the hook JSON document
    Export {
        #[arg(long)]
        workspace: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum WorkspaceCommand {
    /// List workspaces with divergence reports
    List {
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Remove the worktree, keep the history
    Retire {
        name: String,
        #[arg(long, value_enum, default_value_t)]
        output: OutputFormat,
    },
    /// Close a workspace (re-openable)
    Close { name: String },
    /// Reopen a closed workspace
    Reopen { name: String },
    /// Delete the workspace and all its records
    Destroy {
        name: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
    },
}
