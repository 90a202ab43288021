//! Engine-wide notification hub.
//!
//! A process-global singleton that installs the storage engine's global
//! hooks once and multiplexes the resulting events to any number of named
//! observers. Registration takes the hub lock exclusively; dispatch takes
//! it shared and runs observers synchronously on the engine thread that
//! raised the event, so observers must be non-blocking and must not
//! register or unregister on the hub from inside a callback.

use std::collections::HashMap;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::{Once, RwLock};

use log::warn;
use once_cell::sync::OnceCell;
use rusqlite::ffi;

use crate::error::ErrorCode;
use crate::notifier::{ErrorRecord, Level, Notifier};

/// Pager lock level, as reported by the engine's lock instrumentation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PagerLock {
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

impl PagerLock {
    pub fn from_raw(raw: c_int) -> Option<PagerLock> {
        match raw {
            ffi::SQLITE_LOCK_NONE => Some(PagerLock::None),
            ffi::SQLITE_LOCK_SHARED => Some(PagerLock::Shared),
            ffi::SQLITE_LOCK_RESERVED => Some(PagerLock::Reserved),
            ffi::SQLITE_LOCK_PENDING => Some(PagerLock::Pending),
            ffi::SQLITE_LOCK_EXCLUSIVE => Some(PagerLock::Exclusive),
            _ => None,
        }
    }
}

/// Shared-memory lock kind. The engine passes a flag word carrying exactly
/// one of the shared/exclusive bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShmLock {
    Shared,
    Exclusive,
}

impl ShmLock {
    pub fn from_flags(flags: c_int) -> ShmLock {
        if flags & ffi::SQLITE_SHM_SHARED != 0 {
            debug_assert_eq!(flags & ffi::SQLITE_SHM_EXCLUSIVE, 0);
            ShmLock::Shared
        } else {
            debug_assert_ne!(flags & ffi::SQLITE_SHM_EXCLUSIVE, 0);
            ShmLock::Exclusive
        }
    }
}

/// Opaque, non-null token identifying the connection behind a shm-lock
/// change. Observers use it to deduplicate events per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionToken(usize);

impl ConnectionToken {
    pub fn from_ptr(identifier: *mut c_void) -> ConnectionToken {
        debug_assert!(!identifier.is_null());
        ConnectionToken(identifier as usize)
    }
}

pub type LogObserver = Box<dyn Fn(ErrorCode, &str) + Send + Sync>;
pub type FileOpenedObserver = Box<dyn Fn(i32, &str, i32, i32) + Send + Sync>;
pub type WillLockObserver = Box<dyn Fn(&str, PagerLock) + Send + Sync>;
pub type LockDidChangeObserver = Box<dyn Fn(&str, PagerLock) + Send + Sync>;
pub type WillShmLockObserver = Box<dyn Fn(&str, ShmLock, i32) + Send + Sync>;
pub type ShmLockDidChangeObserver = Box<dyn Fn(&str, ConnectionToken, i32, i32) + Send + Sync>;

/// The four lock-event callbacks of one subscriber; each is independently
/// optional.
#[derive(Default)]
pub struct LockEventObserver {
    pub will_lock: Option<WillLockObserver>,
    pub lock_did_change: Option<LockDidChangeObserver>,
    pub will_shm_lock: Option<WillShmLockObserver>,
    pub shm_lock_did_change: Option<ShmLockDidChangeObserver>,
}

#[derive(Default)]
struct Subscriptions {
    log: HashMap<String, LogObserver>,
    file_opened: HashMap<String, FileOpenedObserver>,
    lock_events: HashMap<String, LockEventObserver>,
}

/// C-compatible lock instrumentation entry points, for engine builds that
/// carry the lock-tracing patch. `context` is the hub's stable address and
/// must be passed back verbatim to every entry point.
pub struct LockHook {
    pub will_lock: unsafe extern "C" fn(*mut c_void, *const c_char, c_int),
    pub lock_did_change: unsafe extern "C" fn(*mut c_void, *const c_char, c_int),
    pub will_shm_lock: unsafe extern "C" fn(*mut c_void, *const c_char, c_int, c_int),
    pub shm_lock_did_change:
        unsafe extern "C" fn(*mut c_void, *const c_char, *mut c_void, c_int, c_int),
    pub context: *mut c_void,
}

static SHARED: OnceCell<EventHub> = OnceCell::new();
static INSTALL: Once = Once::new();

/// Process-wide engine notification hub. Lives for the whole process; the
/// engine hooks are installed on first access and never torn down.
pub struct EventHub {
    subscriptions: RwLock<Subscriptions>,
}

impl EventHub {
    fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Subscriptions::default()),
        }
    }

    /// The process-wide hub. Engine hooks are installed the first time this
    /// is called; installation failures are posted to the shared notifier
    /// as fatal records and the remaining hooks are still attempted.
    pub fn shared() -> &'static EventHub {
        let hub = SHARED.get_or_init(EventHub::new);
        INSTALL.call_once(install_engine_hooks);
        hub
    }

    /// Ensure the singleton exists and the engine hooks are installed.
    /// Idempotent; meant to be called once before any connection is opened,
    /// since the engine rejects global configuration afterwards.
    pub fn initialize() {
        EventHub::shared();
    }

    // Registration

    /// Register or replace the log observer under `name`; `None` removes it.
    pub fn set_log_notification(&self, name: &str, observer: Option<LogObserver>) {
        let mut subscriptions = self.subscriptions.write().unwrap();
        match observer {
            Some(observer) => {
                subscriptions.log.insert(name.to_string(), observer);
            }
            None => {
                subscriptions.log.remove(name);
            }
        }
    }

    /// Register or replace the file-opened observer under `name`; `None`
    /// removes it.
    pub fn set_file_opened_notification(&self, name: &str, observer: Option<FileOpenedObserver>) {
        let mut subscriptions = self.subscriptions.write().unwrap();
        match observer {
            Some(observer) => {
                subscriptions.file_opened.insert(name.to_string(), observer);
            }
            None => {
                subscriptions.file_opened.remove(name);
            }
        }
    }

    /// Register or replace the lock-event observer under `name`. Absent
    /// callbacks are simply never invoked.
    pub fn set_lock_event_notification(&self, name: &str, observer: LockEventObserver) {
        let mut subscriptions = self.subscriptions.write().unwrap();
        subscriptions.lock_events.insert(name.to_string(), observer);
    }

    // Dispatch

    pub fn post_log(&self, code: ErrorCode, message: &str) {
        let subscriptions = self.subscriptions.read().unwrap();
        for observer in subscriptions.log.values() {
            observer(code, message);
        }
    }

    pub fn post_file_opened(&self, fd: i32, path: &str, flags: i32, mode: i32) {
        let subscriptions = self.subscriptions.read().unwrap();
        for observer in subscriptions.file_opened.values() {
            observer(fd, path, flags, mode);
        }
    }

    pub fn post_will_lock(&self, path: &str, lock: PagerLock) {
        debug_assert!(matches!(
            lock,
            PagerLock::Shared | PagerLock::Reserved | PagerLock::Exclusive
        ));
        let subscriptions = self.subscriptions.read().unwrap();
        for observer in subscriptions.lock_events.values() {
            if let Some(will_lock) = &observer.will_lock {
                will_lock(path, lock);
            }
        }
    }

    pub fn post_lock_did_change(&self, path: &str, lock: PagerLock) {
        let subscriptions = self.subscriptions.read().unwrap();
        for observer in subscriptions.lock_events.values() {
            if let Some(lock_did_change) = &observer.lock_did_change {
                lock_did_change(path, lock);
            }
        }
    }

    pub fn post_will_shm_lock(&self, path: &str, lock: ShmLock, mask: i32) {
        let subscriptions = self.subscriptions.read().unwrap();
        for observer in subscriptions.lock_events.values() {
            if let Some(will_shm_lock) = &observer.will_shm_lock {
                will_shm_lock(path, lock, mask);
            }
        }
    }

    pub fn post_shm_lock_did_change(
        &self,
        path: &str,
        identifier: ConnectionToken,
        shared_mask: i32,
        exclusive_mask: i32,
    ) {
        let subscriptions = self.subscriptions.read().unwrap();
        for observer in subscriptions.lock_events.values() {
            if let Some(shm_lock_did_change) = &observer.shm_lock_did_change {
                shm_lock_did_change(path, identifier, shared_mask, exclusive_mask);
            }
        }
    }

    /// The lock instrumentation entry points, with this hub's address as
    /// context. Engine builds with lock tracing register these at startup.
    pub fn lock_hook(&'static self) -> LockHook {
        LockHook {
            will_lock: will_lock_trampoline,
            lock_did_change: lock_did_change_trampoline,
            will_shm_lock: will_shm_lock_trampoline,
            shm_lock_did_change: shm_lock_did_change_trampoline,
            context: self as *const EventHub as *mut c_void,
        }
    }
}

// Engine installation. Runs once, before any connection exists if the
// embedder calls `EventHub::initialize()` early enough; later calls get a
// misuse code from the engine, which lands in the notifier like any other
// installation failure.

fn install_engine_hooks() {
    // Global log callback.
    let result = unsafe { rusqlite::trace::config_log(Some(engine_log)) };
    if let Err(err) = result {
        let code = crate::error::RowShiftError::from(err).engine_code();
        installation_failed(code, "installing the engine log callback");
    }

    unsafe {
        let rc = ffi::sqlite3_config(ffi::SQLITE_CONFIG_MULTITHREAD);
        config_exit(rc, "selecting multithread threading mode");

        let rc = ffi::sqlite3_config(ffi::SQLITE_CONFIG_MEMSTATUS, 0 as c_int);
        config_exit(rc, "disabling memory statistics");
    }

    #[cfg(unix)]
    unsafe {
        let rc = install_open_override();
        config_exit(rc, "overriding the VFS open system call");
    }
}

fn config_exit(rc: c_int, what: &str) {
    let code = ErrorCode::from_raw(rc);
    if !code.is_success() {
        installation_failed(code, what);
    }
}

fn installation_failed(code: ErrorCode, what: &str) {
    warn!("engine hook installation failed while {what}: {code}");
    Notifier::shared().notify(&ErrorRecord::new(
        Level::Fatal,
        code,
        format!("engine hook installation failed while {what}"),
    ));
}

fn engine_log(code: c_int, message: &str) {
    if let Some(hub) = SHARED.get() {
        hub.post_log(ErrorCode::from_raw(code), message);
    }
}

#[cfg(unix)]
unsafe fn install_open_override() -> c_int {
    let vfs = ffi::sqlite3_vfs_find(std::ptr::null());
    if vfs.is_null() || (*vfs).iVersion < 3 {
        return ffi::SQLITE_ERROR;
    }
    let set_system_call = match (*vfs).xSetSystemCall {
        Some(set_system_call) => set_system_call,
        None => return ffi::SQLITE_ERROR,
    };
    let open: unsafe extern "C" fn(*const c_char, c_int, c_int) -> c_int = vfs_open;
    set_system_call(
        vfs,
        b"open\0".as_ptr().cast(),
        Some(std::mem::transmute::<
            unsafe extern "C" fn(*const c_char, c_int, c_int) -> c_int,
            unsafe extern "C" fn(),
        >(open)),
    )
}

/// Replacement for the VFS `open` system call: performs the real open and
/// then broadcasts the outcome, returning the descriptor (or error)
/// unchanged.
#[cfg(unix)]
unsafe extern "C" fn vfs_open(path: *const c_char, flags: c_int, mode: c_int) -> c_int {
    let fd = libc::open(path, flags, mode);
    if !path.is_null() {
        if let Some(hub) = SHARED.get() {
            if let Ok(path) = CStr::from_ptr(path).to_str() {
                hub.post_file_opened(fd, path, flags, mode);
            }
        }
    }
    fd
}

// Lock instrumentation trampolines. The context pointer is the hub address
// handed out by `lock_hook`.

unsafe extern "C" fn will_lock_trampoline(context: *mut c_void, path: *const c_char, lock: c_int) {
    let hub = &*(context as *const EventHub);
    if let (Ok(path), Some(lock)) = (CStr::from_ptr(path).to_str(), PagerLock::from_raw(lock)) {
        hub.post_will_lock(path, lock);
    }
}

unsafe extern "C" fn lock_did_change_trampoline(
    context: *mut c_void,
    path: *const c_char,
    lock: c_int,
) {
    let hub = &*(context as *const EventHub);
    if let (Ok(path), Some(lock)) = (CStr::from_ptr(path).to_str(), PagerLock::from_raw(lock)) {
        hub.post_lock_did_change(path, lock);
    }
}

unsafe extern "C" fn will_shm_lock_trampoline(
    context: *mut c_void,
    path: *const c_char,
    flags: c_int,
    mask: c_int,
) {
    let hub = &*(context as *const EventHub);
    if let Ok(path) = CStr::from_ptr(path).to_str() {
        hub.post_will_shm_lock(path, ShmLock::from_flags(flags), mask);
    }
}

unsafe extern "C" fn shm_lock_did_change_trampoline(
    context: *mut c_void,
    path: *const c_char,
    identifier: *mut c_void,
    shared_mask: c_int,
    exclusive_mask: c_int,
) {
    let hub = &*(context as *const EventHub);
    if let Ok(path) = CStr::from_ptr(path).to_str() {
        hub.post_shm_lock_did_change(
            path,
            ConnectionToken::from_ptr(identifier),
            shared_mask,
            exclusive_mask,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_log_fan_out_and_unregister() {
        let hub = EventHub::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let counter = a.clone();
        hub.set_log_notification(
            "a",
            Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let counter = b.clone();
        hub.set_log_notification(
            "b",
            Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        hub.post_log(ErrorCode::Notice, "checkpoint");
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        hub.set_log_notification("a", None);
        hub.post_log(ErrorCode::Notice, "checkpoint");
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_file_opened_broadcast() {
        let hub = EventHub::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = seen.clone();
        hub.set_file_opened_notification(
            "watcher",
            Some(Box::new(move |fd, path, flags, mode| {
                sink.lock().unwrap().push((fd, path.to_string(), flags, mode));
            })),
        );

        hub.post_file_opened(7, "/tmp/main.db", 2, 0o644);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(7, "/tmp/main.db".to_string(), 2, 0o644)]);
    }

    #[test]
    fn test_lock_event_callbacks_are_independently_optional() {
        let hub = EventHub::new();
        let will = Arc::new(AtomicUsize::new(0));
        let did = Arc::new(AtomicUsize::new(0));

        let counter = will.clone();
        hub.set_lock_event_notification(
            "partial",
            LockEventObserver {
                will_lock: Some(Box::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );
        let counter = did.clone();
        hub.set_lock_event_notification(
            "other",
            LockEventObserver {
                lock_did_change: Some(Box::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        hub.post_will_lock("/tmp/main.db", PagerLock::Exclusive);
        hub.post_lock_did_change("/tmp/main.db", PagerLock::None);

        assert_eq!(will.load(Ordering::SeqCst), 1);
        assert_eq!(did.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shm_lock_dispatch_carries_token_and_masks() {
        let hub = EventHub::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        let sink = seen.clone();
        hub.set_lock_event_notification(
            "shm",
            LockEventObserver {
                shm_lock_did_change: Some(Box::new(move |path, token, shared, exclusive| {
                    sink.lock().unwrap().push((path.to_string(), token, shared, exclusive));
                })),
                ..Default::default()
            },
        );

        let token = ConnectionToken::from_ptr(0x1000 as *mut c_void);
        hub.post_shm_lock_did_change("/tmp/main.db-shm", token, 0b1, 0b10);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, token);
        assert_eq!((seen[0].2, seen[0].3), (0b1, 0b10));
    }

    #[test]
    fn test_shm_flag_translation() {
        assert_eq!(ShmLock::from_flags(ffi::SQLITE_SHM_SHARED), ShmLock::Shared);
        assert_eq!(
            ShmLock::from_flags(ffi::SQLITE_SHM_EXCLUSIVE),
            ShmLock::Exclusive
        );
    }

    #[test]
    fn test_pager_lock_translation() {
        assert_eq!(PagerLock::from_raw(0), Some(PagerLock::None));
        assert_eq!(PagerLock::from_raw(4), Some(PagerLock::Exclusive));
        assert_eq!(PagerLock::from_raw(99), None);
    }

    #[test]
    fn test_lock_hook_trampolines_dispatch_through_context() {
        let hub = EventHub::shared();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = count.clone();
        hub.set_lock_event_notification(
            "trampoline-test",
            LockEventObserver {
                will_lock: Some(Box::new(move |path, lock| {
                    assert_eq!(path, "/tmp/main.db");
                    assert_eq!(lock, PagerLock::Shared);
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        );

        let hook = hub.lock_hook();
        let path = std::ffi::CString::new("/tmp/main.db").expect("path");
        unsafe {
            (hook.will_lock)(hook.context, path.as_ptr(), ffi::SQLITE_LOCK_SHARED);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shared_hub_is_idempotent() {
        EventHub::initialize();
        let first = EventHub::shared() as *const EventHub;
        EventHub::initialize();
        let second = EventHub::shared() as *const EventHub;
        assert_eq!(first, second);
    }
}
