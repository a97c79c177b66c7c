//! Handlers for the CLI subcommands.
//!
//! Each function here corresponds to a subcommand in `main.rs`. Handlers
//! load the config store themselves, talk to the user through `crate::ui`,
//! and write configuration back only through `ConfigStore::batch`.
//! Interactive prompts are kept at the edge so the logic below them can be
//! tested with plain arguments.

use anstyle::AnsiColor;
use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::cipher::{Cipher, Persist};
use crate::config::{ConfigStore, Field, SAVE_INTERVAL};
use crate::doctor::run_doctor;
use crate::error::CipherError;
use crate::fs_utils::{dir_size, human_size};
use crate::orchestrator::{Orchestrator, RunOutcome, format_session};
use crate::paths::Paths;
use crate::process::{CLIENT_POOL, EXCLUDED_PROCESSES, ProcessTable, SystemProcesses};
use crate::tags::{CREDENTIAL_FILE, find_tag_dir, is_tag_active, list_profiles, validate_tag_name};
use crate::ui::Ui;

fn load_store(paths: &Paths) -> Result<ConfigStore> {
    ConfigStore::load(paths)
        .with_context(|| format!("Failed to load configuration from {}", paths.config_file.display()))
}

// -----------------------------------------------------------------------------
// launch
// -----------------------------------------------------------------------------

/// Arguments of `tgprof launch`
#[derive(Debug, Default, Clone)]
pub struct LaunchOptions {
    pub tag: Option<String>,
    pub password: Option<String>,
    pub ask_password: bool,
}

/// Switch to a profile, run the client, and switch back when it exits
pub fn launch(paths: &Paths, ui: &Ui, options: LaunchOptions) -> Result<()> {
    let store = load_store(paths)?;

    let password = if options.ask_password {
        inquire::Password::new("Credential password:")
            .without_confirmation()
            .prompt()
            .context("Password prompt cancelled")?
    } else {
        options.password.unwrap_or_default()
    };
    store.set_active_tag(options.tag.unwrap_or_default());
    store.set_decrypt_password(password);

    let processes: Arc<dyn ProcessTable> = Arc::new(SystemProcesses);
    let mut orchestrator = Orchestrator::new(store.clone(), processes);
    orchestrator
        .register_interrupts()
        .context("Failed to install signal handlers")?;

    launch_with(&store, ui, &mut orchestrator)
}

/// Run one session on an already configured orchestrator
pub fn launch_with(store: &ConfigStore, ui: &Ui, orchestrator: &mut Orchestrator) -> Result<()> {
    let persister = store
        .spawn_persister(SAVE_INTERVAL)
        .context("Failed to start the config writer")?;

    let requested = store.active_tag();
    if requested.is_empty() {
        ui.info("Launching the default profile");
    } else {
        ui.info(format!("Launching profile '{}'", requested));
    }

    let result = orchestrator.run();
    let saved = persister.shutdown();
    let outcome = match (result, saved) {
        (Ok(outcome), Ok(())) => outcome,
        (Ok(_), Err(save_err)) => {
            return Err(anyhow::Error::new(save_err).context("Failed to save configuration"));
        }
        (Err(err), saved) => {
            if let Err(save_err) = saved {
                warn!(error = %save_err, "failed to save configuration after a failed run");
            }
            return Err(err);
        }
    };

    match outcome {
        RunOutcome::Launched { tag } => ui.ok(format!("Client started with profile '{}'", tag)),
        RunOutcome::Completed { tag, session } => ui.ok(format!(
            "Session on '{}' ended after {}; default profile restored",
            tag,
            format_session(session)
        )),
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// status / tags
// -----------------------------------------------------------------------------

/// Show the configuration and the profiles found in the installation
pub fn status(paths: &Paths, ui: &Ui) -> Result<()> {
    let store = load_store(paths)?;
    let config = store.configs();

    ui.section("Configuration");
    let mut summary = ui.simple_table();
    let dash = |s: &str| if s.is_empty() { ui.dim("(not set)") } else { s.to_string() };
    summary.add_row(vec![ui.cell("Client"), ui.cell(dash(config.client.as_str()))]);
    summary.add_row(vec![ui.cell("Path"), ui.cell(dash(config.path.as_str()))]);
    summary.add_row(vec![ui.cell("Default"), ui.cell(dash(config.default.as_str()))]);
    summary.add_row(vec![ui.cell("Tags"), ui.cell(dash(config.tags.join(", ").as_str()))]);
    summary.add_row(vec![
        ui.cell("Log file"),
        ui.cell(if config.log_output { "on" } else { "off" }),
    ]);
    ui.println(summary.to_string());
    ui.newline();

    let root = store.install_dir();
    if config.path.is_empty() || !root.is_dir() {
        ui.warn("Installation path is not usable. Run `tgprof detect` or `tgprof settings`.");
        return Ok(());
    }

    let mut known = vec![config.default.clone()];
    known.extend(config.tags.iter().filter(|t| **t != config.default).cloned());
    known.retain(|t| !t.is_empty());

    let profiles = list_profiles(&root, &known);
    if profiles.is_empty() {
        ui.warn(format!("No tagged profiles under {}", root.display()));
        return Ok(());
    }

    let mut table = ui.table();
    table.set_header(vec![
        ui.header_cell("Tags"),
        ui.header_cell("Directory"),
        ui.header_cell("Active"),
        ui.header_cell("Size"),
    ]);
    for profile in &profiles {
        let name = profile
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = dir_size(&profile.dir)
            .map(human_size)
            .unwrap_or_else(|_| "?".to_string());
        let active = if profile.is_active {
            ui.colored_cell("yes", AnsiColor::Green)
        } else {
            ui.cell("-")
        };
        table.add_row(vec![ui.cell(profile.tags.join(", ")), ui.cell(name), active, ui.cell(size)]);
    }
    ui.section("Profiles");
    ui.println(table.to_string());
    Ok(())
}

/// List registered tags
pub fn tags_list(paths: &Paths, ui: &Ui) -> Result<()> {
    let store = load_store(paths)?;
    let default = store.default_tag();
    let root = store.install_dir();
    let tags = store.tags();

    if tags.is_empty() && default.is_empty() {
        ui.warn("No tags registered.");
        ui.println(format!("Add one with: {} tags add <NAME>", ui.bold("tgprof")));
        return Ok(());
    }

    let mut all = tags.clone();
    if !default.is_empty() && !all.contains(&default) {
        all.insert(0, default.clone());
    }
    for tag in &all {
        let icon = if find_tag_dir(&root, tag).is_some() {
            ui.icon_ok()
        } else {
            ui.icon_warn()
        };
        let note = if *tag == default { ui.dim(" (default)") } else { String::new() };
        ui.println(format!("  {} {}{}", icon, tag, note));
    }
    Ok(())
}

/// Register a new tag
pub fn tags_add(paths: &Paths, ui: &Ui, name: &str) -> Result<()> {
    validate_tag_name(name)?;
    let store = load_store(paths)?;
    if store.is_registered(name) {
        bail!("Tag '{}' is already registered", name);
    }

    let mut tags = store.tags();
    tags.push(name.to_string());
    store
        .batch([(Field::Tags, json!(tags))])
        .context("Failed to save tags")?;

    ui.ok(format!("Registered tag '{}'", name));
    if find_tag_dir(&store.install_dir(), name).is_none() {
        ui.warn(format!(
            "No profile carries it yet. Create an empty file named '{}' inside the profile directory.",
            name
        ));
    }
    Ok(())
}

/// Unregister a tag; the profile directory is left alone
pub fn tags_remove(paths: &Paths, ui: &Ui, name: &str) -> Result<()> {
    let store = load_store(paths)?;
    if !store.is_registered(name) {
        bail!("Tag '{}' is not registered", name);
    }
    if store.default_tag() == name {
        bail!(
            "Tag '{}' is the default. Choose another default first with `tgprof default <TAG>`.",
            name
        );
    }

    let tags: Vec<String> = store.tags().into_iter().filter(|t| t != name).collect();
    store
        .batch([(Field::Tags, json!(tags))])
        .context("Failed to save tags")?;
    ui.ok(format!("Removed tag '{}'", name));
    Ok(())
}

/// Make `name` the profile that is active at rest
pub fn set_default(paths: &Paths, ui: &Ui, name: &str) -> Result<()> {
    validate_tag_name(name)?;
    let store = load_store(paths)?;
    if store.default_tag() == name {
        ui.info(format!("'{}' is already the default", name));
        return Ok(());
    }

    store
        .batch([(Field::Default, json!(name))])
        .context("Failed to save default tag")?;
    ui.ok(format!("Default tag: {}", name));

    let root = store.install_dir();
    if find_tag_dir(&root, name).is_none() {
        ui.warn(format!("No profile under {} carries '{}' yet.", root.display(), name));
    } else if !is_tag_active(&root, name) {
        ui.info("It becomes active after the next `tgprof launch`.");
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// settings / detect
// -----------------------------------------------------------------------------

/// Raw answers from the settings editor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsAnswers {
    pub client: String,
    pub path: String,
    pub default: String,
    /// Comma-separated
    pub tags: String,
    pub log_output: bool,
}

/// Turn editor answers into one validated config update
pub fn settings_updates(answers: &SettingsAnswers) -> Result<Vec<(Field, Value)>> {
    let client = answers.client.trim();
    if client.is_empty() || client.contains(['/', '\\']) {
        bail!("Client must be an executable file name, got '{}'", answers.client);
    }

    let default = answers.default.trim();
    if !default.is_empty() {
        validate_tag_name(default)?;
    }

    let mut tags: Vec<String> = Vec::new();
    for tag in answers.tags.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        validate_tag_name(tag)?;
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }

    Ok(vec![
        (Field::Client, json!(client)),
        (Field::Path, json!(answers.path.trim())),
        (Field::Default, json!(default)),
        (Field::Tags, json!(tags)),
        (Field::LogOutput, json!(answers.log_output)),
    ])
}

/// Interactive settings editor
pub fn settings(paths: &Paths, ui: &Ui) -> Result<()> {
    let store = load_store(paths)?;
    let current = store.configs();
    let tags = current.tags.join(", ");

    let answers = SettingsAnswers {
        client: inquire::Text::new("Client executable:")
            .with_default(&current.client)
            .prompt()
            .context("Settings cancelled")?,
        path: inquire::Text::new("Installation directory:")
            .with_default(&current.path)
            .prompt()
            .context("Settings cancelled")?,
        default: inquire::Text::new("Default tag:")
            .with_default(&current.default)
            .prompt()
            .context("Settings cancelled")?,
        tags: inquire::Text::new("Tags (comma-separated):")
            .with_default(&tags)
            .prompt()
            .context("Settings cancelled")?,
        log_output: inquire::Confirm::new("Write tgprof.log?")
            .with_default(current.log_output)
            .prompt()
            .context("Settings cancelled")?,
    };

    let updates = settings_updates(&answers)?;
    store.batch(updates).context("Failed to save settings")?;
    ui.ok(format!("Saved {}", store.config_file().display()));

    if !Path::new(answers.path.trim()).is_dir() {
        ui.warn("The installation directory does not exist.");
    }
    Ok(())
}

/// Fill in client name and path from a running client
pub fn detect(paths: &Paths, ui: &Ui) -> Result<()> {
    detect_with(paths, ui, &SystemProcesses)
}

pub fn detect_with(paths: &Paths, ui: &Ui, processes: &dyn ProcessTable) -> Result<()> {
    let store = load_store(paths)?;
    let spinner = ui.spinner("Looking for a running client...");

    let Some(name) = processes.find_first_matching_process(CLIENT_POOL, EXCLUDED_PROCESSES) else {
        ui.spinner_finish(&spinner, false, "No running client found");
        bail!("Start the client once, then run `tgprof detect` again.");
    };
    let Some(dir) = processes.process_install_dir(&name) else {
        ui.spinner_finish(&spinner, false, format!("Found '{}' but not its location", name));
        bail!("Could not read the executable path of '{}'.", name);
    };

    store
        .batch([
            (Field::Client, json!(name)),
            (Field::Path, json!(dir.to_string_lossy())),
        ])
        .context("Failed to save detected client")?;
    ui.spinner_finish(
        &spinner,
        true,
        format!("Detected {} in {}", name, dir.display()),
    );
    Ok(())
}

// -----------------------------------------------------------------------------
// protect / unprotect
// -----------------------------------------------------------------------------

/// Locate the credential file of a parked profile
fn parked_credential(store: &ConfigStore, tag: &str) -> Result<std::path::PathBuf> {
    let root = store.install_dir();
    let Some(dir) = find_tag_dir(&root, tag) else {
        bail!("No profile under {} carries the tag '{}'", root.display(), tag);
    };
    if is_tag_active(&root, tag) {
        bail!(
            "Profile '{}' is active. The client reads its credentials in plaintext; \
             switch away from it before changing its protection.",
            tag
        );
    }
    let file = dir.join(CREDENTIAL_FILE);
    if !file.is_file() {
        bail!("Profile '{}' has no {} file", tag, CREDENTIAL_FILE);
    }
    Ok(file)
}

/// Encrypt a parked profile's credential file
pub fn protect(paths: &Paths, ui: &Ui, tag: &str) -> Result<()> {
    let password = inquire::Password::new("New credential password:")
        .prompt()
        .context("Password prompt cancelled")?;
    protect_with(paths, ui, tag, &password)
}

pub fn protect_with(paths: &Paths, ui: &Ui, tag: &str, password: &str) -> Result<()> {
    if password.is_empty() {
        bail!("Password cannot be empty");
    }
    let store = load_store(paths)?;
    let file = parked_credential(&store, tag)?;
    let cipher = Cipher::new(password);

    if cipher.decrypt(&file, Persist::DryRun).is_ok() {
        bail!("Profile '{}' is already protected with this password", tag);
    }
    cipher
        .encrypt(&file, Persist::Write)
        .with_context(|| format!("Failed to encrypt {}", file.display()))?;

    ui.ok(format!("Protected '{}'", tag));
    ui.info("Pass the same password to `tgprof launch` (--ask-password or TGPROF_PASSWORD).");
    Ok(())
}

/// Decrypt a parked profile's credential file back to plaintext
pub fn unprotect(paths: &Paths, ui: &Ui, tag: &str) -> Result<()> {
    let password = inquire::Password::new("Credential password:")
        .without_confirmation()
        .prompt()
        .context("Password prompt cancelled")?;
    unprotect_with(paths, ui, tag, &password)
}

pub fn unprotect_with(paths: &Paths, ui: &Ui, tag: &str, password: &str) -> Result<()> {
    let store = load_store(paths)?;
    let file = parked_credential(&store, tag)?;

    match Cipher::new(password).decrypt(&file, Persist::Write) {
        Ok(_) => {
            ui.ok(format!("Removed protection from '{}'", tag));
            Ok(())
        }
        Err(CipherError::InvalidCiphertext) => {
            bail!("Wrong password, or '{}' is not protected", tag)
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to decrypt {}", file.display()))),
    }
}

// -----------------------------------------------------------------------------
// doctor
// -----------------------------------------------------------------------------

pub fn doctor(paths: &Paths, ui: &Ui) -> Result<()> {
    if !run_doctor(paths, ui) {
        bail!("Doctor found issues");
    }
    Ok(())
}
