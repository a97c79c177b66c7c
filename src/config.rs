//! Configuration store.
//!
//! `ConfigStore` is the single piece of shared mutable state in tgprof. It
//! holds two kinds of fields behind one re-entrant lock:
//! - durable settings (`Config`), persisted to `configs.json`
//! - per-run session fields (`Session`), never written to disk
//!
//! Logical writes only mark the store dirty. Physical writes happen through
//! `flush`, either from the background `Persister` or explicitly.

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::fs_utils::write_atomic;
use crate::paths::Paths;

/// Minimum delay between two background writes
pub const SAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Durable settings stored in configs.json
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Client executable file name
    pub client: String,
    /// Client installation directory
    pub path: String,
    /// Tag of the profile that is active at rest
    pub default: String,
    /// Registered tags
    pub tags: Vec<String>,
    /// Also write logs to tgprof.log
    pub log_output: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: "Telegram".to_string(),
            path: String::new(),
            default: String::new(),
            tags: Vec::new(),
            log_output: true,
        }
    }
}

/// Which reversible change the swap engine made to a credential file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialState {
    #[default]
    Untouched,
    /// Decrypted in place; must be re-encrypted on restore
    Decrypted,
    /// A `.bak` sidecar was taken; must be moved back on restore
    BackedUp,
}

/// Fields that only live for the duration of one run
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub active_tag: String,
    pub process_alive: bool,
    pub run_complete: bool,
    pub decrypt_password: String,
    pub was_decrypted: bool,
    pub had_backup: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("active_tag", &self.active_tag)
            .field("process_alive", &self.process_alive)
            .field("run_complete", &self.run_complete)
            .field("decrypt_password", &"<redacted>")
            .field("was_decrypted", &self.was_decrypted)
            .field("had_backup", &self.had_backup)
            .finish()
    }
}

/// Every field addressable through the dynamic `get`/`set`/`batch` API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Client,
    Path,
    Default,
    Tags,
    LogOutput,
    ActiveTag,
    ProcessAlive,
    RunComplete,
    DecryptPassword,
    WasDecrypted,
    HadBackup,
}

impl Field {
    pub const DURABLE: [Field; 5] = [
        Field::Client,
        Field::Path,
        Field::Default,
        Field::Tags,
        Field::LogOutput,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Client => "client",
            Field::Path => "path",
            Field::Default => "default",
            Field::Tags => "tags",
            Field::LogOutput => "log_output",
            Field::ActiveTag => "tag",
            Field::ProcessAlive => "process_alive",
            Field::RunComplete => "run_complete",
            Field::DecryptPassword => "password",
            Field::WasDecrypted => "decrypted",
            Field::HadBackup => "has_backup",
        }
    }

    pub fn is_durable(self) -> bool {
        Self::DURABLE.contains(&self)
    }

    fn expected_type(self) -> &'static str {
        match self {
            Field::Tags => "list of strings",
            Field::LogOutput
            | Field::ProcessAlive
            | Field::RunComplete
            | Field::WasDecrypted
            | Field::HadBackup => "bool",
            _ => "string",
        }
    }

    fn mismatch(self, value: &Value) -> ConfigError {
        ConfigError::TypeMismatch {
            field: self.name(),
            expected: self.expected_type(),
            actual: json_type(value),
        }
    }
}

impl FromStr for Field {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field = match s {
            "client" => Field::Client,
            "path" => Field::Path,
            "default" => Field::Default,
            "tags" => Field::Tags,
            "log_output" => Field::LogOutput,
            "tag" => Field::ActiveTag,
            "process_alive" => Field::ProcessAlive,
            "run_complete" => Field::RunComplete,
            "password" => Field::DecryptPassword,
            "decrypted" => Field::WasDecrypted,
            "has_backup" => Field::HadBackup,
            other => return Err(ConfigError::UnknownField(other.to_string())),
        };
        Ok(field)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone)]
struct Inner {
    config: Config,
    session: Session,
    dirty: bool,
}

struct Shared {
    config_file: PathBuf,
    config_tmp: PathBuf,
    state: ReentrantMutex<RefCell<Inner>>,
    batch_lock: Mutex<()>,
}

/// Thread-safe handle to the configuration
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct ConfigStore {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.read(|inner| {
            f.debug_struct("ConfigStore")
                .field("config_file", &self.shared.config_file)
                .field("config", &inner.config)
                .field("session", &inner.session)
                .field("dirty", &inner.dirty)
                .finish()
        })
    }
}

impl ConfigStore {
    /// Load the store from `paths.config_file`
    ///
    /// A missing, unreadable, truncated or incomplete file is replaced with
    /// the defaults, which are written out immediately.
    pub fn load(paths: &Paths) -> Result<Self, ConfigError> {
        let (config, needs_write) = match read_config(&paths.config_file) {
            Ok(config) => (config, false),
            Err(reason) => {
                if paths.config_file.exists() {
                    warn!(path = %paths.config_file.display(), %reason, "config unusable, restoring defaults");
                } else {
                    info!(path = %paths.config_file.display(), "no config found, writing defaults");
                }
                (Config::default(), true)
            }
        };

        let store = Self {
            shared: Arc::new(Shared {
                config_file: paths.config_file.clone(),
                config_tmp: paths.config_tmp.clone(),
                state: ReentrantMutex::new(RefCell::new(Inner {
                    config,
                    session: Session::default(),
                    dirty: false,
                })),
                batch_lock: Mutex::new(()),
            }),
        };

        if needs_write {
            store.flush()?;
        }
        Ok(store)
    }

    fn read<R>(&self, f: impl FnOnce(&Inner) -> R) -> R {
        let guard = self.shared.state.lock();
        let inner = guard.borrow();
        f(&inner)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let guard = self.shared.state.lock();
        let mut inner = guard.borrow_mut();
        f(&mut inner)
    }

    fn write_durable(&self, f: impl FnOnce(&mut Config)) {
        self.write(|inner| {
            f(&mut inner.config);
            inner.dirty = true;
        });
    }

    // -------------------------------------------------------------------------
    // Typed accessors
    // -------------------------------------------------------------------------

    /// Snapshot of the durable settings
    pub fn configs(&self) -> Config {
        self.read(|inner| inner.config.clone())
    }

    pub fn client(&self) -> String {
        self.read(|inner| inner.config.client.clone())
    }

    pub fn path(&self) -> String {
        self.read(|inner| inner.config.path.clone())
    }

    /// Installation root as a path
    pub fn install_dir(&self) -> PathBuf {
        PathBuf::from(self.path())
    }

    pub fn default_tag(&self) -> String {
        self.read(|inner| inner.config.default.clone())
    }

    pub fn tags(&self) -> Vec<String> {
        self.read(|inner| inner.config.tags.clone())
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.read(|inner| inner.config.tags.iter().any(|t| t == tag))
    }

    pub fn log_output(&self) -> bool {
        self.read(|inner| inner.config.log_output)
    }

    pub fn set_client(&self, value: impl Into<String>) {
        let value = value.into();
        self.write_durable(|c| c.client = value);
    }

    pub fn set_path(&self, value: impl Into<String>) {
        let value = value.into();
        self.write_durable(|c| c.path = value);
    }

    pub fn set_default(&self, value: impl Into<String>) {
        let value = value.into();
        self.write_durable(|c| c.default = value);
    }

    pub fn set_tags(&self, value: Vec<String>) {
        self.write_durable(|c| c.tags = value);
    }

    pub fn set_log_output(&self, value: bool) {
        self.write_durable(|c| c.log_output = value);
    }

    pub fn active_tag(&self) -> String {
        self.read(|inner| inner.session.active_tag.clone())
    }

    pub fn set_active_tag(&self, value: impl Into<String>) {
        let value = value.into();
        self.write(|inner| inner.session.active_tag = value);
    }

    pub fn process_alive(&self) -> bool {
        self.read(|inner| inner.session.process_alive)
    }

    pub fn set_process_alive(&self, value: bool) {
        self.write(|inner| inner.session.process_alive = value);
    }

    pub fn run_complete(&self) -> bool {
        self.read(|inner| inner.session.run_complete)
    }

    pub fn set_run_complete(&self, value: bool) {
        self.write(|inner| inner.session.run_complete = value);
    }

    pub fn decrypt_password(&self) -> String {
        self.read(|inner| inner.session.decrypt_password.clone())
    }

    pub fn set_decrypt_password(&self, value: impl Into<String>) {
        let value = value.into();
        self.write(|inner| inner.session.decrypt_password = value);
    }

    pub fn was_decrypted(&self) -> bool {
        self.read(|inner| inner.session.was_decrypted)
    }

    pub fn had_backup(&self) -> bool {
        self.read(|inner| inner.session.had_backup)
    }

    /// Set the decrypted marker, refusing to overlap with the backup marker
    pub fn set_was_decrypted(&self, value: bool) -> Result<(), ConfigError> {
        self.write(|inner| {
            if value && inner.session.had_backup {
                return Err(ConfigError::MarkerConflict(Field::WasDecrypted.name()));
            }
            inner.session.was_decrypted = value;
            Ok(())
        })
    }

    /// Set the backup marker, refusing to overlap with the decrypted marker
    pub fn set_had_backup(&self, value: bool) -> Result<(), ConfigError> {
        self.write(|inner| {
            if value && inner.session.was_decrypted {
                return Err(ConfigError::MarkerConflict(Field::HadBackup.name()));
            }
            inner.session.had_backup = value;
            Ok(())
        })
    }

    pub fn credential_state(&self) -> CredentialState {
        self.read(|inner| {
            debug_assert!(!(inner.session.was_decrypted && inner.session.had_backup));
            match (inner.session.was_decrypted, inner.session.had_backup) {
                (true, _) => CredentialState::Decrypted,
                (false, true) => CredentialState::BackedUp,
                (false, false) => CredentialState::Untouched,
            }
        })
    }

    /// Set both credential markers in one step
    pub fn set_credential_state(&self, state: CredentialState) {
        self.write(|inner| {
            inner.session.was_decrypted = state == CredentialState::Decrypted;
            inner.session.had_backup = state == CredentialState::BackedUp;
        });
    }

    // -------------------------------------------------------------------------
    // Dynamic field access
    // -------------------------------------------------------------------------

    /// Read any field as a JSON value
    pub fn get(&self, field: Field) -> Value {
        self.read(|inner| {
            let c = &inner.config;
            let s = &inner.session;
            match field {
                Field::Client => Value::from(c.client.clone()),
                Field::Path => Value::from(c.path.clone()),
                Field::Default => Value::from(c.default.clone()),
                Field::Tags => Value::from(c.tags.clone()),
                Field::LogOutput => Value::from(c.log_output),
                Field::ActiveTag => Value::from(s.active_tag.clone()),
                Field::ProcessAlive => Value::from(s.process_alive),
                Field::RunComplete => Value::from(s.run_complete),
                Field::DecryptPassword => Value::from(s.decrypt_password.clone()),
                Field::WasDecrypted => Value::from(s.was_decrypted),
                Field::HadBackup => Value::from(s.had_backup),
            }
        })
    }

    /// Set any field from a JSON value, validating its type
    pub fn set(&self, field: Field, value: Value) -> Result<(), ConfigError> {
        match field {
            Field::Client => self.set_client(expect_string(field, value)?),
            Field::Path => self.set_path(expect_string(field, value)?),
            Field::Default => self.set_default(expect_string(field, value)?),
            Field::Tags => self.set_tags(expect_string_list(field, value)?),
            Field::LogOutput => self.set_log_output(expect_bool(field, &value)?),
            Field::ActiveTag => self.set_active_tag(expect_string(field, value)?),
            Field::ProcessAlive => self.set_process_alive(expect_bool(field, &value)?),
            Field::RunComplete => self.set_run_complete(expect_bool(field, &value)?),
            Field::DecryptPassword => self.set_decrypt_password(expect_string(field, value)?),
            Field::WasDecrypted => self.set_was_decrypted(expect_bool(field, &value)?)?,
            Field::HadBackup => self.set_had_backup(expect_bool(field, &value)?)?,
        }
        Ok(())
    }

    /// Apply several updates as one transaction
    ///
    /// Other batches are blocked for the duration, and so are individual
    /// writes from other threads. If any update is rejected or the final
    /// save fails, every field is restored to its value at the start of the
    /// batch and nothing is persisted.
    pub fn batch<I>(&self, updates: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (Field, Value)>,
    {
        let _batch = self.shared.batch_lock.lock();
        let _state = self.shared.state.lock();
        let snapshot = self.read(|inner| inner.clone());

        let result = updates
            .into_iter()
            .try_for_each(|(field, value)| self.set(field, value))
            .and_then(|()| {
                self.write(|inner| inner.dirty = true);
                self.flush()
            });

        if let Err(err) = result {
            debug!(error = %err, "config batch rolled back");
            self.write(|inner| *inner = snapshot);
            return Err(err);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.read(|inner| inner.dirty)
    }

    pub fn config_file(&self) -> &std::path::Path {
        &self.shared.config_file
    }

    /// Write the durable settings to disk atomically
    pub fn flush(&self) -> Result<(), ConfigError> {
        let _state = self.shared.state.lock();
        let content = self.read(|inner| serde_json::to_string_pretty(&inner.config))?;

        let parent = self
            .shared
            .config_file
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return Err(ConfigError::DirectoryUnwritable {
                path: parent,
                source: None,
            });
        }

        write_atomic(
            &self.shared.config_file,
            &self.shared.config_tmp,
            content.as_bytes(),
        )
        .map_err(|source| ConfigError::DirectoryUnwritable {
            path: parent,
            source: Some(source),
        })?;

        self.write(|inner| inner.dirty = false);
        debug!(path = %self.shared.config_file.display(), "config saved");
        Ok(())
    }

    /// Flush only if something changed since the last write
    pub fn flush_if_dirty(&self) -> Result<bool, ConfigError> {
        if self.is_dirty() {
            self.flush()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Start the background writer
    pub fn spawn_persister(&self, interval: Duration) -> io::Result<Persister> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let store = self.clone();

        let handle = std::thread::Builder::new()
            .name("config-persister".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    if let Err(err) = store.flush_if_dirty() {
                        warn!(error = %err, "background config save failed");
                    }
                    if store.run_complete() {
                        debug!("run complete, config persister exiting");
                        break;
                    }
                }
            })?;

        Ok(Persister {
            store: self.clone(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

fn expect_string(field: Field, value: Value) -> Result<String, ConfigError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(field.mismatch(&other)),
    }
}

fn expect_bool(field: Field, value: &Value) -> Result<bool, ConfigError> {
    value.as_bool().ok_or_else(|| field.mismatch(value))
}

fn expect_string_list(field: Field, value: Value) -> Result<Vec<String>, ConfigError> {
    let Value::Array(items) = value else {
        return Err(field.mismatch(&value));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(s) => Ok(s),
            other => Err(field.mismatch(&other)),
        })
        .collect()
}

/// Read and validate `configs.json` without falling back to defaults
pub fn read_config(path: &std::path::Path) -> Result<Config, String> {
    let content = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let value: Value = serde_json::from_str(&content).map_err(|e| e.to_string())?;
    let object = value.as_object().ok_or("config is not a JSON object")?;

    if let Some(missing) = Field::DURABLE
        .iter()
        .find(|f| !object.contains_key(f.name()))
    {
        return Err(format!("missing field '{}'", missing.name()));
    }

    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Handle to the background config writer
///
/// `shutdown` (or dropping the handle) stops the thread and performs a
/// final synchronous flush if anything is still dirty.
pub struct Persister {
    store: ConfigStore,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Persister {
    /// Whether the background thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    pub fn shutdown(mut self) -> Result<(), ConfigError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ConfigError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("config persister thread panicked");
            }
        }
        self.store.flush_if_dirty().map(|_| ())
    }
}

impl Drop for Persister {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(err) = self.stop() {
                warn!(error = %err, "final config save failed");
            }
        }
    }
}
