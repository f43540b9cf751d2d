use clap::Parser;
use std::process;

use atlas::error::{AtlasError, exit_code};
use atlas::validate::Stage;

mod cli;
mod commands;

use cli::{Cli, Commands};
use commands::App;

fn main() {
    // Clap handles its own usage errors with exit code 2.
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "off" }),
    )
    .format_timestamp(None)
    .init();

    if let Err(e) = run(&cli) {
        // The JSON sentinel already wrote its document; print nothing more.
        let rendered = e.to_string();
        if !rendered.is_empty() {
            anstream::eprintln!("{rendered}");
        }
        process::exit(exit_code(&e));
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    let app = App::new()?;

    let result: Result<(), AtlasError> = match &cli.command {
        Commands::Start {
            workspace,
            description,
            template,
            branch,
            base,
            output,
        } => commands::handle_start(
            &app,
            workspace,
            description,
            template,
            branch.clone(),
            base.clone(),
            *output,
        ),
        Commands::Resume {
            workspace,
            ai_fix,
            output,
        } => commands::handle_resume(&app, workspace, *ai_fix, *output),
        Commands::Approve {
            workspace,
            auto_approve,
            close,
            output,
        } => commands::handle_approve(&app, workspace.clone(), *auto_approve, *close, *output),
        Commands::Reject {
            workspace,
            retry,
            done,
            feedback,
            step,
            output,
        } => commands::handle_reject(
            &app,
            workspace.clone(),
            *retry,
            *done,
            feedback.clone(),
            *step,
            *output,
        ),
        Commands::Status {
            watch,
            interval,
            progress,
            output,
        } => commands::handle_status(&app, *watch, *interval, *progress, *output),
        Commands::Validate(args) => commands::handle_stage(&app, None, args),
        Commands::Format(args) => commands::handle_stage(&app, Some(Stage::Format), args),
        Commands::Lint(args) => commands::handle_stage(&app, Some(Stage::Lint), args),
        Commands::Test(args) => commands::handle_stage(&app, Some(Stage::Test), args),
        Commands::Checkpoint {
            description,
            trigger,
            workspace,
        } => commands::handle_checkpoint(&app, description.clone(), trigger, workspace.clone()),
        Commands::Cleanup {
            dry_run,
            hooks,
            output,
        } => commands::handle_cleanup(&app, *dry_run, *hooks, *output),
        Commands::Hook { command } => commands::handle_hook(&app, command),
        Commands::Workspace { command } => commands::handle_workspace(&app, command),
        Commands::Abandon { workspace, output } => {
            commands::handle_abandon(&app, workspace, *output)
        }
    };
    Ok(result?)
}
