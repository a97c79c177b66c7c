//! Logging setup.
//!
//! All diagnostics go through `tracing`. Events carrying `user_facing = true`
//! are meant for the person at the terminal: instead of a log line on stderr
//! they are handed to a notifier (see `ui::Ui::notify`). Every event still
//! lands in `tgprof.log` when file output is enabled.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// Environment variable holding the filter directives
pub const LOG_ENV: &str = "TGPROF_LOG";

const USER_FACING: &str = "user_facing";

/// Receives user-facing events
pub type Notifier = Arc<dyn Fn(Level, &str) + Send + Sync>;

pub struct LogSettings {
    /// Append to this file as well as stderr
    pub log_file: Option<PathBuf>,
    /// Stderr verbosity when `TGPROF_LOG` is unset
    pub default_directives: String,
    pub notifier: Notifier,
}

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber
pub fn init(settings: LogSettings) -> anyhow::Result<()> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter_fn(|meta| meta.fields().field(USER_FACING).is_none()))
        .with_filter(env_filter(&settings.default_directives));

    let file_layer = match &settings.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("Failed to open log file {:?}: {}", path, e))?;
            Some(
                fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_filter(env_filter("tgprof=info")),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(NotifyLayer::new(settings.notifier))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Forwards `user_facing = true` events to a notifier
pub struct NotifyLayer {
    notifier: Notifier,
}

impl NotifyLayer {
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }
}

impl<S: Subscriber> Layer<S> for NotifyLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().fields().field(USER_FACING).is_none() {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if visitor.user_facing {
            (self.notifier)(*event.metadata().level(), &visitor.render());
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    user_facing: bool,
    message: String,
    error: Option<String>,
}

impl MessageVisitor {
    fn render(&self) -> String {
        match &self.error {
            Some(error) if !self.message.is_empty() => format!("{}\n\n{}", self.message, error),
            Some(error) => error.clone(),
            None => self.message.clone(),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_bool(&mut self, field: &Field, value: bool) {
        if field.name() == USER_FACING {
            self.user_facing = value;
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "error" => self.error = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => {
                self.message.clear();
                let _ = write!(self.message, "{:?}", value);
            }
            "error" => self.error = Some(format!("{:?}", value)),
            _ => {}
        }
    }
}
