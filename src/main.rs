use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing::{Level, error};

use tgprof::{
    commands::{self, LaunchOptions},
    config::read_config,
    lock::InstanceLock,
    logging::{self, LogSettings},
    paths::Paths,
    ui::{ColorMode, Ui},
};

#[derive(Parser)]
#[command(name = "tgprof")]
#[command(about = "Telegram profile switcher - run a client on another tdata profile and switch back")]
#[command(version)]
struct Cli {
    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// When to use colors
    #[arg(long, global = true, value_name = "WHEN", default_value = "auto")]
    color: ColorMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the client on a profile and restore the default when it exits
    Launch {
        /// Tag of the profile to use; the default profile when omitted
        tag: Option<String>,

        /// Prompt for the credential password
        #[arg(long)]
        ask_password: bool,

        /// Credential password for protected profiles
        #[arg(long, env = "TGPROF_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Show the configuration and the profiles in the installation
    Status,

    /// List, add or remove tags
    Tags {
        #[command(subcommand)]
        action: Option<TagsAction>,
    },

    /// Set the profile that is active at rest
    Default {
        /// Tag of the new default profile
        name: String,
    },

    /// Edit the configuration interactively
    Settings,

    /// Fill in the client name and installation path from a running client
    Detect,

    /// Encrypt a parked profile's credential file
    Protect {
        /// Tag of the profile
        tag: String,
    },

    /// Decrypt a parked profile's credential file
    Unprotect {
        /// Tag of the profile
        tag: String,
    },

    /// Run diagnostics on the configuration and installation
    Doctor,

    /// Print shell completions
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum TagsAction {
    /// Register a tag
    Add { name: String },
    /// Unregister a tag (the profile directory is kept)
    Remove { name: String },
}

fn main() {
    let cli = Cli::parse();
    let ui = Ui::new(cli.color, cli.no_color);

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "tgprof", &mut std::io::stdout());
        return;
    }

    let paths = match Paths::new() {
        Ok(paths) => paths,
        Err(e) => {
            ui.notify(Level::ERROR, &format!("{e:#}"));
            std::process::exit(1);
        }
    };

    let log_file = read_config(&paths.config_file)
        .map(|config| config.log_output)
        .unwrap_or(true)
        .then(|| paths.log_file.clone());
    let logging_ready = match logging::init(LogSettings {
        log_file,
        default_directives: "tgprof=warn".to_string(),
        notifier: ui.notifier(),
    }) {
        Ok(()) => true,
        Err(e) => {
            ui.warn(format!("{e:#}"));
            false
        }
    };

    if let Err(e) = run(cli.command, &paths, &ui) {
        let message = format!("{e:#}");
        if logging_ready {
            error!(user_facing = true, error = %message, "tgprof failed");
        } else {
            ui.notify(Level::ERROR, &message);
        }
        std::process::exit(1);
    }
}

fn run(command: Commands, paths: &Paths, ui: &Ui) -> Result<()> {
    let _lock = InstanceLock::acquire(&paths.lock_file).context("Failed to take the instance lock")?;

    match command {
        Commands::Launch {
            tag,
            ask_password,
            password,
        } => commands::launch(
            paths,
            ui,
            LaunchOptions {
                tag,
                password,
                ask_password,
            },
        ),
        Commands::Status => commands::status(paths, ui),
        Commands::Tags { action } => match action {
            None => commands::tags_list(paths, ui),
            Some(TagsAction::Add { name }) => commands::tags_add(paths, ui, &name),
            Some(TagsAction::Remove { name }) => commands::tags_remove(paths, ui, &name),
        },
        Commands::Default { name } => commands::set_default(paths, ui, &name),
        Commands::Settings => commands::settings(paths, ui),
        Commands::Detect => commands::detect(paths, ui),
        Commands::Protect { tag } => commands::protect(paths, ui, &tag),
        Commands::Unprotect { tag } => commands::unprotect(paths, ui, &tag),
        Commands::Doctor => commands::doctor(paths, ui),
        Commands::Completions { .. } => Ok(()),
    }
}
