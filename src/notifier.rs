//! Process-global error-record sink.
//!
//! Failures that cannot (or should not only) travel up a `Result` chain are
//! posted here as structured records: fatal engine-configuration errors
//! from the notification hub, and migration failures tagged with their
//! action so observers can separate them from unrelated traffic.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::ErrorCode;

/// Info key carrying the originating action of a record.
pub const INFO_KEY_ACTION: &str = "action";
/// Info key carrying the database path a record concerns.
pub const INFO_KEY_PATH: &str = "path";

/// Action tag for migration-originated records.
pub const ACTION_MIGRATE: &str = "migrate";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Level {
    Debug,
    Notice,
    Warning,
    Error,
    Fatal,
}

/// A structured error record.
#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    pub level: Level,
    pub code: ErrorCode,
    pub message: String,
    pub infos: BTreeMap<String, String>,
}

impl ErrorRecord {
    pub fn new(level: Level, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            level,
            code,
            message: message.into(),
            infos: BTreeMap::new(),
        }
    }

    pub fn with_info(mut self, key: &str, value: impl Into<String>) -> Self {
        self.infos.insert(key.to_string(), value.into());
        self
    }
}

type NotificationCallback = Box<dyn Fn(&ErrorRecord) + Send + Sync>;

static SHARED: Lazy<Notifier> = Lazy::new(Notifier::new);

/// Process-wide sink multiplexing error records to named observers.
///
/// Observers run synchronously under the sink's shared lock and must not
/// register or unregister observers from inside a callback.
pub struct Notifier {
    callbacks: RwLock<HashMap<String, NotificationCallback>>,
}

impl Notifier {
    fn new() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared() -> &'static Notifier {
        &SHARED
    }

    /// Register or replace the observer under `name`; `None` removes it.
    pub fn set_notification(&self, name: &str, callback: Option<NotificationCallback>) {
        let mut callbacks = self.callbacks.write().unwrap();
        match callback {
            Some(callback) => {
                callbacks.insert(name.to_string(), callback);
            }
            None => {
                callbacks.remove(name);
            }
        }
    }

    pub fn notify(&self, record: &ErrorRecord) {
        let callbacks = self.callbacks.read().unwrap();
        for callback in callbacks.values() {
            callback(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn record() -> ErrorRecord {
        ErrorRecord::new(Level::Error, ErrorCode::Busy, "writer busy")
            .with_info(INFO_KEY_ACTION, ACTION_MIGRATE)
    }

    #[test]
    fn test_notify_fans_out_to_named_observers() {
        let notifier = Notifier::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        notifier.set_notification(
            "first",
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let counter = second.clone();
        notifier.set_notification(
            "second",
            Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        notifier.notify(&record());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        notifier.set_notification("first", None);
        notifier.notify(&record());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_replacing_an_observer_keeps_one_registration() {
        let notifier = Notifier::new();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = count.clone();
            notifier.set_notification(
                "observer",
                Some(Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
            );
        }

        notifier.notify(&record());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_records_carry_action_tag() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let notifier = Notifier::new();
        let sink = seen.clone();
        notifier.set_notification(
            "collector",
            Some(Box::new(move |record: &ErrorRecord| {
                sink.lock().unwrap().push(record.clone());
            })),
        );

        notifier.notify(&record());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].infos.get(INFO_KEY_ACTION).map(String::as_str),
            Some(ACTION_MIGRATE)
        );
        assert_eq!(seen[0].code, ErrorCode::Busy);
    }
}
