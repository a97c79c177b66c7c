//! Profile swapping.
//!
//! This module implements the core mechanism of tgprof: exchanging the
//! profile bound to the active slot for a parked one. Every swap is two
//! renames:
//! 1. the current active slot moves to a fresh scratch name
//! 2. the target profile moves into the active slot
//!
//! A failed second step rolls the first one back, so an attempt either
//! performs both renames or neither. Permission errors are retried a fixed
//! number of times with a fixed backoff.
//!
//! When a decryption password is set, the credential file of the profile
//! being activated is decrypted in place (or, if it is not ciphertext for
//! that password, backed up to a `.bak` sidecar) and the change is undone
//! when the profile leaves the active slot again.

use rand::seq::SliceRandom;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cipher::{Cipher, Persist};
use crate::config::{ConfigStore, CredentialState};
use crate::error::{CipherError, SwapError};
use crate::tags::{
    ACTIVE_SLOT, CREDENTIAL_BACKUP, CREDENTIAL_FILE, SCRATCH_PREFIX, find_tag_dir,
};

const SCRATCH_ALPHABET: &[u8] = b"ABCDEFGH";
const SCRATCH_LEN: usize = 8;

/// Bounded retry for renames that fail with a permission error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Pause between two attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Directory rename primitive
pub trait Renamer: Send + Sync {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Renames through the real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsRenamer;

impl Renamer for FsRenamer {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// What a swap request did to the filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Both renames were performed
    Switched,
    /// The requested profile already held the active slot; nothing moved
    AlreadyActive,
}

/// Result of `SwapEngine::activate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    /// The tag that was actually activated
    pub tag: String,
    /// The requested tag was not registered and the default was used
    pub fell_back: bool,
    pub outcome: SwapOutcome,
}

enum AttemptError {
    Permission(PathBuf),
    Fatal(SwapError),
}

#[derive(Clone)]
pub struct SwapEngine {
    store: ConfigStore,
    retry: RetryPolicy,
    renamer: Arc<dyn Renamer>,
}

impl std::fmt::Debug for SwapEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapEngine")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl SwapEngine {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            renamer: Arc::new(FsRenamer),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_renamer(mut self, renamer: Arc<dyn Renamer>) -> Self {
        self.renamer = renamer;
        self
    }

    /// Map a requested tag to the tag that will be activated
    ///
    /// Returns the tag and whether it is a fallback to the default.
    pub fn resolve_tag(&self, tag: &str) -> (String, bool) {
        let default = self.store.default_tag();
        if tag.is_empty() || tag == default {
            (default, false)
        } else if self.store.is_registered(tag) {
            (tag.to_string(), false)
        } else {
            (default, true)
        }
    }

    /// Bring the profile for `tag` into the active slot
    ///
    /// Unregistered tags fall back to the default profile.
    pub fn activate(&self, tag: &str) -> Result<Activation, SwapError> {
        let (resolved, fell_back) = self.resolve_tag(tag);
        if fell_back {
            warn!(requested = %tag, default = %resolved, "tag is not registered, using default");
        }

        if resolved == self.store.default_tag() {
            let outcome = self.restore()?;
            return Ok(Activation {
                tag: resolved,
                fell_back,
                outcome,
            });
        }

        let root = self.store.install_dir();
        let active = root.join(ACTIVE_SLOT);
        let target =
            find_tag_dir(&root, &resolved).ok_or_else(|| SwapError::TagUnresolved(resolved.clone()))?;

        if target == active {
            info!(tag = %resolved, "profile already active, nothing to swap");
            return Ok(Activation {
                tag: resolved,
                fell_back,
                outcome: SwapOutcome::AlreadyActive,
            });
        }

        // Whatever sits in the slot now gets its credential file back to rest state first.
        self.settle_credential(&active)?;
        self.prepare_credential(&target)?;

        if let Err(err) = self.swap_in(&root, &target) {
            if let Err(revert_err) = self.settle_credential(&target) {
                error!(
                    dir = %target.display(),
                    error = %revert_err,
                    "failed to revert credential file after aborted swap"
                );
            }
            return Err(err);
        }

        info!(tag = %resolved, "switched to profile");
        Ok(Activation {
            tag: resolved,
            fell_back,
            outcome: SwapOutcome::Switched,
        })
    }

    /// Bring the default profile back into the active slot
    ///
    /// A no-op when the default profile is already active.
    pub fn restore(&self) -> Result<SwapOutcome, SwapError> {
        let root = self.store.install_dir();
        let default = self.store.default_tag();
        let active = root.join(ACTIVE_SLOT);
        let default_dir =
            find_tag_dir(&root, &default).ok_or_else(|| SwapError::TagUnresolved(default.clone()))?;

        if default_dir == active {
            if self.store.credential_state() != CredentialState::Untouched {
                warn!("credential markers set while the default profile is active, clearing them");
                self.store.set_credential_state(CredentialState::Untouched);
            }
            debug!(tag = %default, "default profile already active");
            return Ok(SwapOutcome::AlreadyActive);
        }

        self.settle_credential(&active)?;
        self.swap_in(&root, &default_dir)?;
        info!(tag = %default, "restored default profile");
        Ok(SwapOutcome::Switched)
    }

    // -------------------------------------------------------------------------
    // Credential handling
    // -------------------------------------------------------------------------

    fn cipher(&self) -> Option<Cipher> {
        let password = self.store.decrypt_password();
        if password.is_empty() {
            None
        } else {
            Some(Cipher::new(&password))
        }
    }

    /// Decrypt or back up the credential file of a profile about to be activated
    fn prepare_credential(&self, profile: &Path) -> Result<CredentialState, SwapError> {
        let Some(cipher) = self.cipher() else {
            return Ok(CredentialState::Untouched);
        };
        let file = profile.join(CREDENTIAL_FILE);
        if !file.is_file() {
            debug!(dir = %profile.display(), "profile has no credential file");
            return Ok(CredentialState::Untouched);
        }

        let state = match cipher.decrypt(&file, Persist::Write) {
            Ok(_) => {
                debug!(file = %file.display(), "credential file decrypted");
                CredentialState::Decrypted
            }
            Err(CipherError::InvalidCiphertext) => {
                let backup = profile.join(CREDENTIAL_BACKUP);
                fs::copy(&file, &backup).map_err(|source| SwapError::Io {
                    path: backup.clone(),
                    source,
                })?;
                debug!(file = %file.display(), "credential file is not ciphertext, backed up");
                CredentialState::BackedUp
            }
            Err(err) => return Err(err.into()),
        };

        self.store.set_credential_state(state);
        Ok(state)
    }

    /// Undo whatever `prepare_credential` did to the profile in `profile`
    fn settle_credential(&self, profile: &Path) -> Result<(), SwapError> {
        let state = self.store.credential_state();
        let file = profile.join(CREDENTIAL_FILE);

        match state {
            CredentialState::Untouched => return Ok(()),
            CredentialState::Decrypted => match self.cipher() {
                Some(cipher) => match cipher.encrypt(&file, Persist::Write) {
                    Ok(_) => debug!(file = %file.display(), "credential file re-encrypted"),
                    Err(CipherError::NotAFile(_)) => {
                        warn!(file = %file.display(), "credential file vanished, nothing to re-encrypt")
                    }
                    Err(err) => return Err(err.into()),
                },
                None => warn!("decryption password was cleared, credential file left decrypted"),
            },
            CredentialState::BackedUp => {
                let backup = profile.join(CREDENTIAL_BACKUP);
                if backup.is_file() {
                    fs::rename(&backup, &file).map_err(|source| SwapError::Io {
                        path: backup.clone(),
                        source,
                    })?;
                    debug!(file = %file.display(), "credential file restored from backup");
                } else {
                    warn!(file = %backup.display(), "credential backup missing");
                }
            }
        }

        self.store.set_credential_state(CredentialState::Untouched);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Renames
    // -------------------------------------------------------------------------

    fn swap_in(&self, root: &Path, target: &Path) -> Result<(), SwapError> {
        let active = root.join(ACTIVE_SLOT);
        let max = self.retry.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_swap(root, &active, target) {
                Ok(()) => return Ok(()),
                Err(AttemptError::Permission(path)) if attempt < max => {
                    warn!(
                        attempt,
                        max,
                        path = %path.display(),
                        "permission denied while swapping, retrying"
                    );
                    std::thread::sleep(self.retry.backoff);
                }
                Err(AttemptError::Permission(path)) => {
                    return Err(SwapError::PermissionExhausted {
                        path,
                        attempts: attempt,
                    });
                }
                Err(AttemptError::Fatal(err)) => return Err(err),
            }
        }
    }

    /// One attempt at both renames; on failure nothing has moved
    fn try_swap(&self, root: &Path, active: &Path, target: &Path) -> Result<(), AttemptError> {
        let scratch = fresh_scratch(root);

        let parked = match self.renamer.rename(active, &scratch) {
            Ok(()) => {
                debug!(from = %active.display(), to = %scratch.display(), "parked active slot");
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("active slot is empty");
                false
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(AttemptError::Permission(active.to_path_buf()));
            }
            Err(source) => {
                return Err(AttemptError::Fatal(SwapError::Rename {
                    from: active.to_path_buf(),
                    to: scratch,
                    source,
                }));
            }
        };

        let Err(e) = self.renamer.rename(target, active) else {
            return Ok(());
        };

        if parked {
            if let Err(source) = self.renamer.rename(&scratch, active) {
                error!(
                    scratch = %scratch.display(),
                    error = %source,
                    "could not move the parked profile back into the active slot"
                );
                return Err(AttemptError::Fatal(SwapError::Rename {
                    from: scratch,
                    to: active.to_path_buf(),
                    source,
                }));
            }
        }

        Err(match e.kind() {
            io::ErrorKind::NotFound => {
                AttemptError::Fatal(SwapError::MissingProfile(target.to_path_buf()))
            }
            io::ErrorKind::PermissionDenied => AttemptError::Permission(target.to_path_buf()),
            _ => AttemptError::Fatal(SwapError::Rename {
                from: target.to_path_buf(),
                to: active.to_path_buf(),
                source: e,
            }),
        })
    }
}

/// Random scratch name: the prefix plus eight distinct letters from A..=H
pub fn scratch_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = SCRATCH_ALPHABET
        .choose_multiple(&mut rng, SCRATCH_LEN)
        .map(|&b| b as char)
        .collect();
    format!("{SCRATCH_PREFIX}{suffix}")
}

fn fresh_scratch(root: &Path) -> PathBuf {
    let mut candidate = root.join(scratch_name());
    for _ in 0..16 {
        if !candidate.exists() {
            break;
        }
        candidate = root.join(scratch_name());
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Fixture, fixture, make_profile};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn fast_engine(fx: &Fixture) -> SwapEngine {
        SwapEngine::new(fx.store.clone()).with_retry(RetryPolicy {
            attempts: 5,
            backoff: Duration::from_millis(10),
        })
    }

    /// Renamer that fails with a permission error while `fail` says so
    struct FlakyRenamer {
        fail: Box<dyn Fn(&Path, &Path, u32) -> bool + Send + Sync>,
        calls: AtomicU32,
    }

    impl FlakyRenamer {
        fn new(fail: impl Fn(&Path, &Path, u32) -> bool + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                fail: Box::new(fail),
                calls: AtomicU32::new(0),
            })
        }
    }

    impl Renamer for FlakyRenamer {
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if (self.fail)(from, to, call) {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            fs::rename(from, to)
        }
    }

    fn active_marker(fx: &Fixture, tag: &str) -> bool {
        fx.root.join(ACTIVE_SLOT).join(tag).is_file()
    }

    fn profile_count(fx: &Fixture) -> usize {
        fs::read_dir(&fx.root)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().is_dir())
            .count()
    }

    #[test]
    fn test_scratch_name_shape() {
        let name = scratch_name();
        let suffix = name.strip_prefix(SCRATCH_PREFIX).unwrap();
        assert_eq!(suffix.len(), SCRATCH_LEN);
        let mut letters: Vec<char> = suffix.chars().collect();
        letters.sort();
        letters.dedup();
        assert_eq!(letters.len(), SCRATCH_LEN);
        assert!(letters.iter().all(|c| ('A'..='H').contains(c)));
    }

    #[test]
    fn test_restore_is_idempotent() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        make_profile(&fx.root, "parked-alt", "alt", b"a");

        let renamer = FlakyRenamer::new(|_, _, _| false);
        let engine = fast_engine(&fx).with_renamer(renamer.clone());

        assert_eq!(engine.restore().unwrap(), SwapOutcome::AlreadyActive);
        assert_eq!(engine.restore().unwrap(), SwapOutcome::AlreadyActive);
        assert_eq!(renamer.calls.load(Ordering::SeqCst), 0);
        assert!(active_marker(&fx, "work"));
    }

    #[test]
    fn test_switch_and_revert() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        make_profile(&fx.root, "parked-alt", "alt", b"a");
        let before = profile_count(&fx);
        let engine = fast_engine(&fx);

        let activation = engine.activate("alt").unwrap();
        assert_eq!(activation.outcome, SwapOutcome::Switched);
        assert!(!activation.fell_back);
        assert!(active_marker(&fx, "alt"));
        assert!(!fx.root.join("parked-alt").exists());

        let work_scratch = find_tag_dir(&fx.root, "work").unwrap();
        let scratch_name = work_scratch.file_name().unwrap().to_str().unwrap();
        assert!(scratch_name.starts_with(SCRATCH_PREFIX));

        assert_eq!(engine.restore().unwrap(), SwapOutcome::Switched);
        assert!(active_marker(&fx, "work"));
        assert!(!work_scratch.exists());
        assert_eq!(profile_count(&fx), before);

        let alt_dir = find_tag_dir(&fx.root, "alt").unwrap();
        assert_ne!(alt_dir, fx.root.join(ACTIVE_SLOT));
    }

    #[test]
    fn test_unregistered_tag_falls_back_to_default() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, "parked-work", "work", b"w");
        make_profile(&fx.root, ACTIVE_SLOT, "alt", b"a");
        let engine = fast_engine(&fx);

        let activation = engine.activate("stranger").unwrap();
        assert!(activation.fell_back);
        assert_eq!(activation.tag, "work");
        assert_eq!(activation.outcome, SwapOutcome::Switched);
        assert!(active_marker(&fx, "work"));
    }

    #[test]
    fn test_activate_default_does_not_consult_other_tags() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, "parked-work", "work", b"w");
        // "alt" is registered but has no directory; activating the default must not care.
        let engine = fast_engine(&fx);

        let activation = engine.activate("").unwrap();
        assert_eq!(activation.tag, "work");
        assert!(!activation.fell_back);
        assert!(active_marker(&fx, "work"));
    }

    #[test]
    fn test_activate_already_active_is_noop() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, "parked-work", "work", b"w");
        make_profile(&fx.root, ACTIVE_SLOT, "alt", b"a");
        let renamer = FlakyRenamer::new(|_, _, _| false);
        let engine = fast_engine(&fx).with_renamer(renamer.clone());

        let activation = engine.activate("alt").unwrap();
        assert_eq!(activation.outcome, SwapOutcome::AlreadyActive);
        assert_eq!(renamer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registered_tag_without_directory_is_unresolved() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        let engine = fast_engine(&fx);

        assert!(matches!(
            engine.activate("alt"),
            Err(SwapError::TagUnresolved(tag)) if tag == "alt"
        ));
        assert!(active_marker(&fx, "work"));
    }

    #[test]
    fn test_unresolvable_default_is_fatal() {
        let fx = fixture("work", &[]);
        assert!(matches!(
            fast_engine(&fx).restore(),
            Err(SwapError::TagUnresolved(tag)) if tag == "work"
        ));
    }

    #[test]
    fn test_missing_active_slot_is_tolerated() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, "parked-work", "work", b"w");
        make_profile(&fx.root, "parked-alt", "alt", b"a");
        let engine = fast_engine(&fx);

        engine.activate("alt").unwrap();
        assert!(active_marker(&fx, "alt"));
        assert_eq!(profile_count(&fx), 2);
    }

    #[test]
    fn test_permission_exhaustion_on_first_step() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        make_profile(&fx.root, "parked-alt", "alt", b"a");

        let renamer = FlakyRenamer::new(|_, _, _| true);
        let engine = SwapEngine::new(fx.store.clone())
            .with_retry(RetryPolicy {
                attempts: 5,
                backoff: Duration::from_millis(40),
            })
            .with_renamer(renamer.clone());

        let started = Instant::now();
        let err = engine.activate("alt").unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, SwapError::PermissionExhausted { attempts: 5, .. }));
        assert_eq!(renamer.calls.load(Ordering::SeqCst), 5);
        assert!(elapsed >= Duration::from_millis(4 * 40));
        assert!(active_marker(&fx, "work"));
        assert!(fx.root.join("parked-alt").exists());
    }

    #[test]
    fn test_permission_exhaustion_on_second_step_rolls_back() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        let alt_dir = make_profile(&fx.root, "parked-alt", "alt", b"a");

        let target = alt_dir.clone();
        let renamer = FlakyRenamer::new(move |from, _, _| from == target.as_path());
        let engine = fast_engine(&fx).with_renamer(renamer.clone());

        let err = engine.activate("alt").unwrap_err();
        assert!(matches!(err, SwapError::PermissionExhausted { attempts: 5, .. }));
        // park, fail, roll back: three renames per attempt
        assert_eq!(renamer.calls.load(Ordering::SeqCst), 15);
        assert!(active_marker(&fx, "work"));
        assert!(alt_dir.exists());
        assert_eq!(profile_count(&fx), 2);
    }

    #[test]
    fn test_transient_permission_error_recovers() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        make_profile(&fx.root, "parked-alt", "alt", b"a");

        let renamer = FlakyRenamer::new(|_, _, call| call <= 2);
        let engine = fast_engine(&fx).with_renamer(renamer.clone());

        assert_eq!(engine.activate("alt").unwrap().outcome, SwapOutcome::Switched);
        assert!(active_marker(&fx, "alt"));
        assert_eq!(renamer.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_encrypted_profile_is_decrypted_and_reencrypted() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"work-plain");
        let cipher = Cipher::new("secret");
        let ciphertext = cipher.encrypt_bytes(b"alt-credentials");
        make_profile(&fx.root, "parked-alt", "alt", &ciphertext);
        fx.store.set_decrypt_password("secret");
        let engine = fast_engine(&fx);

        engine.activate("alt").unwrap();
        let active_cred = fx.root.join(ACTIVE_SLOT).join(CREDENTIAL_FILE);
        assert_eq!(fs::read(&active_cred).unwrap(), b"alt-credentials");
        assert_eq!(fx.store.credential_state(), CredentialState::Decrypted);

        engine.restore().unwrap();
        let alt_dir = find_tag_dir(&fx.root, "alt").unwrap();
        let parked = fs::read(alt_dir.join(CREDENTIAL_FILE)).unwrap();
        assert_eq!(cipher.decrypt_bytes(&parked).unwrap(), b"alt-credentials");
        assert_eq!(fx.store.credential_state(), CredentialState::Untouched);
        assert_eq!(
            fs::read(fx.root.join(ACTIVE_SLOT).join(CREDENTIAL_FILE)).unwrap(),
            b"work-plain"
        );
    }

    #[test]
    fn test_plaintext_profile_is_backed_up_and_restored() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        make_profile(&fx.root, "parked-alt", "alt", b"plain alt credentials");
        fx.store.set_decrypt_password("secret");
        let engine = fast_engine(&fx);

        engine.activate("alt").unwrap();
        let active = fx.root.join(ACTIVE_SLOT);
        assert!(active.join(CREDENTIAL_BACKUP).is_file());
        assert_eq!(fx.store.credential_state(), CredentialState::BackedUp);

        // the client rewrites its credentials during the session
        fs::write(active.join(CREDENTIAL_FILE), b"rewritten").unwrap();

        engine.restore().unwrap();
        let alt_dir = find_tag_dir(&fx.root, "alt").unwrap();
        assert_eq!(
            fs::read(alt_dir.join(CREDENTIAL_FILE)).unwrap(),
            b"plain alt credentials"
        );
        assert!(!alt_dir.join(CREDENTIAL_BACKUP).exists());
        assert!(!fx.store.was_decrypted() && !fx.store.had_backup());
    }

    #[test]
    fn test_no_password_leaves_credentials_alone() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        make_profile(&fx.root, "parked-alt", "alt", b"plain");
        let engine = fast_engine(&fx);

        engine.activate("alt").unwrap();
        assert!(!fx.root.join(ACTIVE_SLOT).join(CREDENTIAL_BACKUP).exists());
        assert_eq!(fx.store.credential_state(), CredentialState::Untouched);
    }

    #[test]
    fn test_failed_swap_reverts_credential() {
        let fx = fixture("work", &["alt"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        let cipher = Cipher::new("secret");
        let ciphertext = cipher.encrypt_bytes(b"alt-credentials");
        let alt_dir = make_profile(&fx.root, "parked-alt", "alt", &ciphertext);
        fx.store.set_decrypt_password("secret");

        let renamer = FlakyRenamer::new(|_, _, _| true);
        let engine = fast_engine(&fx).with_renamer(renamer);

        assert!(engine.activate("alt").is_err());
        let on_disk = fs::read(alt_dir.join(CREDENTIAL_FILE)).unwrap();
        assert_eq!(cipher.decrypt_bytes(&on_disk).unwrap(), b"alt-credentials");
        assert_eq!(fx.store.credential_state(), CredentialState::Untouched);
    }

    #[test]
    fn test_sequences_keep_one_active_slot() {
        let fx = fixture("work", &["alt", "spare"]);
        make_profile(&fx.root, ACTIVE_SLOT, "work", b"w");
        make_profile(&fx.root, "parked-alt", "alt", b"a");
        make_profile(&fx.root, "parked-spare", "spare", b"s");
        let before = profile_count(&fx);
        let engine = fast_engine(&fx);

        for tag in ["alt", "spare", "", "spare", "unknown", "alt", "alt"] {
            engine.activate(tag).unwrap();
            assert!(fx.root.join(ACTIVE_SLOT).is_dir());
            assert_eq!(profile_count(&fx), before);
        }
        engine.restore().unwrap();
        assert!(active_marker(&fx, "work"));
    }
}
