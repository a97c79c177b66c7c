//! Diagnostics for `tgprof doctor`.
//!
//! Checks the configuration and the profile layout of the installation:
//! - configs.json is readable and complete
//! - the client executable exists
//! - the default tag and every registered tag resolve to a directory
//! - the active slot holds the default profile
//! - no credential backups or unmarked scratch directories were left behind
//!
//! Nothing is modified; configs.json is read directly so that a broken file
//! is reported instead of being replaced with defaults.

use anstyle::AnsiColor;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::config::{Config, read_config};
use crate::paths::Paths;
use crate::tags::{ACTIVE_SLOT, CREDENTIAL_BACKUP, list_profiles, scratch_dirs};
use crate::ui::Ui;

/// Run every check, returning true when no issue was found
pub fn run_doctor(paths: &Paths, ui: &Ui) -> bool {
    ui.section("tgprof doctor");
    ui.newline();

    let mut healthy = true;

    let mut config = None;
    healthy &= check_step(ui, "Configuration", || match read_config(&paths.config_file) {
        Ok(c) => {
            ui.println(format!(
                "  {} {} is valid",
                ui.icon_ok(),
                paths.config_file.display()
            ));
            config = Some(c);
            true
        }
        Err(reason) => {
            ui.println(format!(
                "  {} {} is unusable: {}",
                ui.icon_err(),
                paths.config_file.display(),
                reason
            ));
            ui.println(format!(
                "  {} It will be reset to defaults on the next run",
                ui.icon_info()
            ));
            false
        }
    });

    let Some(config) = config else {
        return false;
    };
    let root = PathBuf::from(&config.path);

    healthy &= check_step(ui, "Client", || check_client(ui, &config, &root));
    if !root.is_dir() {
        return false;
    }

    healthy &= check_step(ui, "Tags", || check_tags(ui, &config, &root));
    healthy &= check_step(ui, "Active slot", || check_active_slot(ui, &config, &root));
    healthy &= check_step(ui, "Leftovers", || check_leftovers(ui, &config, &root));

    check_step(ui, "Logging", || {
        if !config.log_output {
            ui.println(format!("  {} File logging is off", ui.icon_info()));
            return true;
        }
        match OpenOptions::new().create(true).append(true).open(&paths.log_file) {
            Ok(_) => ui.println(format!(
                "  {} Logging to {}",
                ui.icon_ok(),
                paths.log_file.display()
            )),
            Err(e) => ui.println(format!(
                "  {} Cannot write {}: {}",
                ui.icon_warn(),
                paths.log_file.display(),
                e
            )),
        }
        true
    });

    if healthy {
        ui.ok("No issues found");
    }
    healthy
}

fn check_client(ui: &Ui, config: &Config, root: &Path) -> bool {
    if config.path.is_empty() {
        ui.println(format!(
            "  {} Installation path is not set (run `tgprof detect`)",
            ui.icon_err()
        ));
        return false;
    }
    if !root.is_dir() {
        ui.println(format!(
            "  {} Installation path is not a directory: {}",
            ui.icon_err(),
            root.display()
        ));
        return false;
    }
    ui.println(format!("  {} Installation: {}", ui.icon_ok(), root.display()));

    let exe = root.join(&config.client);
    if config.client.is_empty() || !exe.is_file() {
        ui.println(format!(
            "  {} Client executable missing: {}",
            ui.icon_err(),
            exe.display()
        ));
        return false;
    }
    ui.println(format!("  {} Client: {}", ui.icon_ok(), config.client));
    true
}

fn check_tags(ui: &Ui, config: &Config, root: &Path) -> bool {
    let mut ok = true;

    if config.default.is_empty() {
        ui.println(format!(
            "  {} No default tag (run `tgprof default <TAG>`)",
            ui.icon_err()
        ));
        ok = false;
    }

    for tag in known_tags(config) {
        let holders: Vec<_> = list_profiles(root, std::slice::from_ref(&tag))
            .into_iter()
            .map(|p| p.dir)
            .collect();
        let is_default = tag == config.default;
        match holders.as_slice() {
            [] if is_default => {
                ui.println(format!(
                    "  {} Default tag '{}' has no profile directory",
                    ui.icon_err(),
                    tag
                ));
                ok = false;
            }
            [] => ui.println(format!(
                "  {} Tag '{}' has no profile directory",
                ui.icon_warn(),
                tag
            )),
            [dir] => ui.println(format!(
                "  {} {} -> {}",
                ui.icon_ok(),
                tag,
                dir_name(dir)
            )),
            [first, rest @ ..] => ui.println(format!(
                "  {} Tag '{}' is carried by {} directories; using {} (also in {})",
                ui.icon_warn(),
                tag,
                rest.len() + 1,
                dir_name(first),
                rest.iter().map(|d| dir_name(d)).collect::<Vec<_>>().join(", ")
            )),
        }
    }
    ok
}

fn check_active_slot(ui: &Ui, config: &Config, root: &Path) -> bool {
    let active = root.join(ACTIVE_SLOT);
    if !active.is_dir() {
        ui.println(format!(
            "  {} No {} directory; the next launch will restore the default profile",
            ui.icon_warn(),
            ACTIVE_SLOT
        ));
        return true;
    }

    let holder = list_profiles(root, &known_tags(config))
        .into_iter()
        .find(|p| p.is_active);
    match holder {
        Some(p) if p.tags.contains(&config.default) => {
            ui.println(format!(
                "  {} Default profile '{}' is active",
                ui.icon_ok(),
                config.default
            ));
            true
        }
        Some(p) => {
            ui.println(format!(
                "  {} Profile '{}' is still active; the last run did not restore the default",
                ui.icon_err(),
                p.tags.join(", ")
            ));
            false
        }
        None => {
            ui.println(format!(
                "  {} The active profile carries no known tag",
                ui.icon_warn()
            ));
            true
        }
    }
}

fn check_leftovers(ui: &Ui, config: &Config, root: &Path) -> bool {
    let mut ok = true;
    let profiles = list_profiles(root, &known_tags(config));

    for profile in &profiles {
        let backup = profile.dir.join(CREDENTIAL_BACKUP);
        if backup.is_file() {
            ui.println(format!(
                "  {} Credential backup left in {}",
                ui.icon_err(),
                dir_name(&profile.dir)
            ));
            ok = false;
        }
    }

    let orphans: Vec<_> = scratch_dirs(root)
        .into_iter()
        .filter(|dir| !profiles.iter().any(|p| &p.dir == dir))
        .collect();
    for dir in &orphans {
        ui.println(format!(
            "  {} {} carries no known tag",
            ui.icon_warn(),
            dir_name(dir)
        ));
    }

    if ok && orphans.is_empty() {
        ui.println(format!("  {} Nothing left behind", ui.icon_ok()));
    }
    ok
}

/// Default first, then registered tags, without duplicates
fn known_tags(config: &Config) -> Vec<String> {
    let mut tags = Vec::with_capacity(config.tags.len() + 1);
    if !config.default.is_empty() {
        tags.push(config.default.clone());
    }
    for tag in &config.tags {
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    tags
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

fn check_step<F>(ui: &Ui, name: &str, check_fn: F) -> bool
where
    F: FnOnce() -> bool,
{
    ui.println(ui.bold(format!("Checking {}...", name)));
    let success = check_fn();
    if !success {
        ui.println(ui.colored("  Issues detected!", AnsiColor::Red));
    }
    ui.newline();
    success
}
