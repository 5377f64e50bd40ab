//! Log routing for hosts that embed the store.
//!
//! The engine logs through `tracing`. [`install`] sets up a global
//! `tracing-subscriber` registry with a reloadable level filter and two
//! sinks: a callback layer that forwards events to the registered
//! [`LogHandler`], and a `fmt` layer to stderr that is active only while no
//! handler is registered. A host that already installed its own subscriber
//! keeps it; the calls here then only affect the callback slot.

use parking_lot::RwLock;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::{filter_fn, LevelFilter};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, Layer, Registry};

/// Minimum severity of forwarded log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LogLevel {
    /// Everything, including replay and lock details.
    Debug,
    /// Growth, compaction, restore.
    #[default]
    Info,
    /// Recoverable problems such as corruption.
    Warning,
    /// Failed operations.
    Error,
    /// Nothing.
    None,
}

impl LogLevel {
    /// Converts to a `tracing` level filter.
    #[must_use]
    pub const fn to_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Info => LevelFilter::INFO,
            Self::Warning => LevelFilter::WARN,
            Self::Error => LevelFilter::ERROR,
            Self::None => LevelFilter::OFF,
        }
    }

    fn from_level(level: &Level) -> Self {
        match *level {
            Level::ERROR => Self::Error,
            Level::WARN => Self::Warning,
            Level::INFO => Self::Info,
            _ => Self::Debug,
        }
    }
}

/// One log event handed to a [`LogHandler`].
#[derive(Debug, Clone, Copy)]
pub struct LogRecord<'a> {
    /// Severity.
    pub level: LogLevel,
    /// Module path that emitted the event.
    pub target: &'a str,
    /// Source file, when known.
    pub file: Option<&'a str>,
    /// Source line, when known.
    pub line: Option<u32>,
    /// Message followed by `key=value` fields.
    pub message: &'a str,
}

/// Receiver for log events.
pub type LogHandler = Arc<dyn Fn(&LogRecord<'_>) + Send + Sync>;

type HandlerSlot = Arc<RwLock<Option<LogHandler>>>;

struct Logging {
    slot: HandlerSlot,
    level: Option<reload::Handle<LevelFilter, Registry>>,
}

static LOGGING: OnceLock<Logging> = OnceLock::new();

/// Installs the global subscriber once; later calls only update the level
/// and handler.
///
/// Returns `true` if this call installed the subscriber.
pub fn install(level: LogLevel, handler: Option<LogHandler>) -> bool {
    let mut installed = false;
    let logging = LOGGING.get_or_init(|| {
        let slot: HandlerSlot = Arc::new(RwLock::new(None));
        let (filter, handle) = reload::Layer::new(level.to_filter());
        let fmt_slot = Arc::clone(&slot);
        let result = tracing_subscriber::registry()
            .with(filter)
            .with(CallbackLayer {
                slot: Arc::clone(&slot),
            })
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr)
                    .with_filter(filter_fn(move |_| fmt_slot.read().is_none())),
            )
            .try_init();
        installed = result.is_ok();
        Logging {
            slot,
            level: installed.then_some(handle),
        }
    });
    *logging.slot.write() = handler;
    set_log_level(level);
    installed
}

/// Replaces the log handler. `None` restores stderr output.
pub fn register_log_handler(handler: Option<LogHandler>) {
    match LOGGING.get() {
        Some(logging) => *logging.slot.write() = handler,
        None => {
            install(LogLevel::default(), handler);
        }
    }
}

/// Changes the minimum level of the installed subscriber.
pub fn set_log_level(level: LogLevel) {
    let Some(handle) = LOGGING.get().and_then(|l| l.level.as_ref()) else {
        return;
    };
    if let Err(e) = handle.reload(level.to_filter()) {
        tracing::warn!(error = %e, "failed to change log level");
    }
}

struct CallbackLayer {
    slot: HandlerSlot,
}

impl<S: Subscriber> Layer<S> for CallbackLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(handler) = self.slot.read().clone() else {
            return;
        };
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let meta = event.metadata();
        handler(&LogRecord {
            level: LogLevel::from_level(meta.level()),
            target: meta.target(),
            file: meta.file(),
            line: meta.line(),
            message: &visitor.finish(),
        });
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(mut self) -> String {
        if !self.fields.is_empty() {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            self.message.push_str(self.fields.trim_start());
        }
        self.message
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}
