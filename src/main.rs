// src/main.rs
//! ops2deb - CLI entry point

use clap::Parser;
use ops2deb::cli::{Cli, Commands};
use ops2deb::commands;
use ops2deb::settings::Settings;
use ops2deb::Error;
use tracing::error;

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli, settings: Settings) -> Result<(), Error> {
    match cli.command.unwrap_or(Commands::Default {
        output: None,
        only: Vec::new(),
        workers: None,
    }) {
        Commands::Generate { output, only } => {
            let settings = with_output(settings, output);
            commands::generate(&settings, &only).await
        }
        Commands::Build { output, workers } => {
            let settings = with_output(settings, output);
            commands::build(&settings, workers).await
        }
        Commands::Default { output, only, workers } => {
            let settings = with_output(settings, output);
            commands::default_command(&settings, &only, workers).await
        }
        Commands::Update { only, skip, dry_run, skip_build } => {
            commands::update(&settings, &only, &skip, dry_run, skip_build).await
        }
        Commands::Lock => commands::lock(&settings).await,
        Commands::Purge => commands::purge(&settings),
        Commands::Migrate => commands::migrate_command(&settings),
        Commands::Validate => commands::validate(&settings),
        Commands::Format => commands::format(&settings),
        Commands::Delta { old, new, format } => commands::delta_command(&old, &new, format),
        Commands::Version => {
            commands::version();
            Ok(())
        }
    }
}

fn with_output(mut settings: Settings, output: Option<std::path::PathBuf>) -> Settings {
    if let Some(output) = output {
        settings.output_directory = output;
    }
    settings
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut settings = Settings::from_env();
    settings.configuration_path = cli.config.clone();
    settings.verbose = settings.verbose || cli.verbose;
    init_tracing(settings.verbose);

    let outcome = tokio::select! {
        outcome = run(cli, settings) => outcome,
        _ = tokio::signal::ctrl_c() => Err(Error::Cancelled),
    };

    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(e.exit_code());
    }
}
