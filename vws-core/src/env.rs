//! Thread-scoped environment: last error, error policy hooks, allocation
//! hooks, and the leveled trace sink.
//!
//! Every thread gets its own [`Environment`], created lazily with defaults on
//! first use or installed explicitly with [`init`]. Error state is never shared
//! between threads. The only cross-thread state is the trace lock, which
//! serializes emission to the (process-wide) log sink.
//!
//! Hooks run while the environment is borrowed and must not call back into
//! this module.

use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, Error, ErrorCode, ErrorValue, Result};
use crate::util;

static TRACE_LOCK: Mutex<()> = Mutex::new(());

thread_local! {
    static ENV: RefCell<Option<Environment>> = const { RefCell::new(None) };
}

/// Trace priority. Messages below the environment threshold are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_log(self) -> log::Level {
        match self {
            Level::Debug => log::Level::Debug,
            Level::Info => log::Level::Info,
            Level::Warn => log::Level::Warn,
            Level::Error => log::Level::Error,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        })
    }
}

impl FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            other => Err(format!("unknown trace level: {other}")),
        }
    }
}

/// Destination for formatted trace messages.
pub trait TraceSink {
    fn emit(&self, level: Level, message: &str);
}

/// Default sink: forwards to the `log` facade under target `vws`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TraceSink for LogSink {
    fn emit(&self, level: Level, message: &str) {
        log::log!(target: "vws", level.as_log(), "{}", message);
    }
}

/// Error recording and policy. Defaults store the value and apply
/// [`default_process`].
pub trait ErrorHooks {
    /// Store `{code, text}` as the thread's current error.
    fn record(&self, slot: &mut ErrorValue, code: ErrorCode, text: String) {
        slot.code = code;
        slot.text = Some(text);
    }

    /// Policy decision for a freshly recorded error.
    fn process(&self, value: &ErrorValue) {
        default_process(value);
    }

    fn clear(&self, slot: &mut ErrorValue) {
        *slot = ErrorValue::success();
    }

    fn success(&self, slot: &mut ErrorValue) {
        *slot = ErrorValue::success();
    }
}

/// Fatal errors terminate the process, memory errors are reported, anything
/// else is only recorded.
pub fn default_process(value: &ErrorValue) {
    let text = value.text.as_deref().unwrap_or("");
    if value.code.contains(ErrorCode::FATAL) {
        log::error!(target: "vws", "fatal error ({}): {}", value.code, text);
        std::process::exit(1);
    }
    if value.code.contains(ErrorCode::MEM) {
        log::error!(target: "vws", "memory error: {}", text);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultErrorHooks;

impl ErrorHooks for DefaultErrorHooks {}

/// Allocation policy. Each allocation kind has a failure handler whose
/// return value becomes the result of the wrapper: `Some`/`true` means the
/// handler recovered, `None`/`false` propagates a memory error.
pub trait AllocHooks {
    /// Empty vector with room for `size` bytes.
    fn alloc(&self, size: usize) -> std::result::Result<Vec<u8>, AllocError> {
        let mut v = Vec::new();
        v.try_reserve_exact(size)
            .map_err(|_| AllocError { requested: size })?;
        Ok(v)
    }

    fn alloc_failed(&self, _size: usize) -> Option<Vec<u8>> {
        None
    }

    /// `count * size` zero bytes.
    fn alloc_zeroed(&self, count: usize, size: usize) -> std::result::Result<Vec<u8>, AllocError> {
        let total = count.checked_mul(size).ok_or(AllocError {
            requested: usize::MAX,
        })?;
        let mut v = Vec::new();
        v.try_reserve_exact(total)
            .map_err(|_| AllocError { requested: total })?;
        v.resize(total, 0);
        Ok(v)
    }

    fn alloc_zeroed_failed(&self, _count: usize, _size: usize) -> Option<Vec<u8>> {
        None
    }

    /// Make room for at least `additional` bytes past `buf.len()`.
    fn grow(&self, buf: &mut Vec<u8>, additional: usize) -> std::result::Result<(), AllocError> {
        buf.try_reserve_exact(additional).map_err(|_| AllocError {
            requested: buf.len().saturating_add(additional),
        })
    }

    fn grow_failed(&self, _buf: &mut Vec<u8>, _additional: usize) -> bool {
        false
    }

    /// Owned copy of `s`.
    fn dup(&self, s: &str) -> std::result::Result<String, AllocError> {
        let mut out = String::new();
        out.try_reserve_exact(s.len())
            .map_err(|_| AllocError { requested: s.len() })?;
        out.push_str(s);
        Ok(out)
    }

    fn dup_failed(&self, _s: &str) -> Option<String> {
        None
    }
}

/// Global allocator with no recovery.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAlloc;

impl AllocHooks for SystemAlloc {}

/// Per-thread context. Build with [`Environment::builder`] and install with
/// [`init`], or let the first use create a default one.
pub struct Environment {
    alloc: Box<dyn AllocHooks>,
    errors: Box<dyn ErrorHooks>,
    sink: Box<dyn TraceSink>,
    trace_level: Option<Level>,
    last: ErrorValue,
    state: u64,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            alloc: Box::new(SystemAlloc),
            errors: Box::new(DefaultErrorHooks),
            sink: Box::new(LogSink),
            trace_level: Some(Level::Info),
            last: ErrorValue::success(),
            state: 0,
        }
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("trace_level", &self.trace_level)
            .field("last", &self.last)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Environment {
    pub fn builder() -> Builder {
        Builder {
            env: Environment::default(),
        }
    }

    pub fn last_error(&self) -> &ErrorValue {
        &self.last
    }

    /// Record an error, run the process hook, and return the code.
    pub fn submit_error(&mut self, code: ErrorCode, message: String) -> ErrorCode {
        self.errors.record(&mut self.last, code, message);
        self.errors.process(&self.last);
        code
    }

    pub fn clear_error(&mut self) {
        self.errors.clear(&mut self.last);
    }

    pub fn mark_success(&mut self) {
        self.errors.success(&mut self.last);
    }

    pub fn trace_level(&self) -> Option<Level> {
        self.trace_level
    }

    /// `None` turns tracing off.
    pub fn set_trace_level(&mut self, level: Option<Level>) {
        self.trace_level = level;
    }

    pub fn trace_enabled(&self, level: Level) -> bool {
        self.trace_level.is_some_and(|threshold| level >= threshold)
    }

    pub fn trace(&mut self, level: Level, args: fmt::Arguments<'_>) {
        if !self.trace_enabled(level) {
            return;
        }
        let guard = match TRACE_LOCK.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                self.submit_error(ErrorCode::SYS, "trace lock poisoned".to_string());
                poisoned.into_inner()
            }
        };
        let message = fmt::format(args);
        self.sink.emit(level, &message);
        drop(guard);
    }

    pub fn alloc(&mut self, size: usize) -> Result<Vec<u8>> {
        match self.alloc.alloc(size) {
            Ok(v) => Ok(v),
            Err(err) => match self.alloc.alloc_failed(size) {
                Some(v) => Ok(v),
                None => Err(self.memory_error(err)),
            },
        }
    }

    pub fn alloc_zeroed(&mut self, count: usize, size: usize) -> Result<Vec<u8>> {
        match self.alloc.alloc_zeroed(count, size) {
            Ok(v) => Ok(v),
            Err(err) => match self.alloc.alloc_zeroed_failed(count, size) {
                Some(v) => Ok(v),
                None => Err(self.memory_error(err)),
            },
        }
    }

    pub fn grow(&mut self, buf: &mut Vec<u8>, additional: usize) -> Result<()> {
        match self.alloc.grow(buf, additional) {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.alloc.grow_failed(buf, additional) {
                    Ok(())
                } else {
                    Err(self.memory_error(err))
                }
            }
        }
    }

    pub fn dup(&mut self, s: &str) -> Result<String> {
        match self.alloc.dup(s) {
            Ok(v) => Ok(v),
            Err(err) => match self.alloc.dup_failed(s) {
                Some(v) => Ok(v),
                None => Err(self.memory_error(err)),
            },
        }
    }

    fn memory_error(&mut self, err: AllocError) -> Error {
        self.submit_error(ErrorCode::MEM, err.to_string());
        Error::Memory(err)
    }

    pub fn state(&self) -> u64 {
        self.state
    }

    pub fn is_flag(&self, flag: u64) -> bool {
        util::is_flag(self.state, flag)
    }

    pub fn set_flag(&mut self, flag: u64) {
        util::set_flag(&mut self.state, flag);
    }

    pub fn clear_flag(&mut self, flag: u64) {
        util::clear_flag(&mut self.state, flag);
    }
}

/// Configures an [`Environment`] before it is installed.
pub struct Builder {
    env: Environment,
}

impl Builder {
    pub fn alloc_hooks(mut self, hooks: impl AllocHooks + 'static) -> Self {
        self.env.alloc = Box::new(hooks);
        self
    }

    pub fn error_hooks(mut self, hooks: impl ErrorHooks + 'static) -> Self {
        self.env.errors = Box::new(hooks);
        self
    }

    pub fn trace_sink(mut self, sink: impl TraceSink + 'static) -> Self {
        self.env.sink = Box::new(sink);
        self
    }

    pub fn trace_level(mut self, level: Option<Level>) -> Self {
        self.env.trace_level = level;
        self
    }

    pub fn build(self) -> Environment {
        self.env
    }
}

/// Install `env` for the calling thread, replacing any existing one.
pub fn init(env: Environment) {
    ENV.with(|cell| *cell.borrow_mut() = Some(env));
}

/// Tear down the calling thread's environment. The next use re-creates a
/// default one.
pub fn cleanup() {
    ENV.with(|cell| cell.borrow_mut().take());
}

pub fn is_initialized() -> bool {
    ENV.with(|cell| cell.borrow().is_some())
}

/// Run `f` against the calling thread's environment.
pub fn with<R>(f: impl FnOnce(&mut Environment) -> R) -> R {
    ENV.with(|cell| {
        let mut slot = cell.borrow_mut();
        f(slot.get_or_insert_with(Environment::default))
    })
}

pub fn submit_error(code: ErrorCode, message: impl Into<String>) -> ErrorCode {
    let message = message.into();
    with(|env| env.submit_error(code, message))
}

pub fn clear_error() {
    with(Environment::clear_error);
}

pub fn mark_success() {
    with(Environment::mark_success);
}

pub fn last_error() -> ErrorValue {
    with(|env| env.last_error().clone())
}

pub fn trace_enabled(level: Level) -> bool {
    with(|env| env.trace_enabled(level))
}

pub fn set_trace_level(level: Option<Level>) {
    with(|env| env.set_trace_level(level));
}

pub fn trace(level: Level, args: fmt::Arguments<'_>) {
    with(|env| env.trace(level, args));
}

pub fn alloc(size: usize) -> Result<Vec<u8>> {
    with(|env| env.alloc(size))
}

pub fn alloc_zeroed(count: usize, size: usize) -> Result<Vec<u8>> {
    with(|env| env.alloc_zeroed(count, size))
}

pub fn grow(buf: &mut Vec<u8>, additional: usize) -> Result<()> {
    with(|env| env.grow(buf, additional))
}

pub fn dup(s: &str) -> Result<String> {
    with(|env| env.dup(s))
}

/// Format and emit a trace message through the calling thread's environment.
#[macro_export]
macro_rules! vws_trace {
    ($level:expr, $($arg:tt)+) => {
        $crate::env::trace($level, format_args!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::{Arc, Barrier};

    #[derive(Clone, Default)]
    struct Collect(Rc<RefCell<Vec<(Level, String)>>>);

    impl TraceSink for Collect {
        fn emit(&self, level: Level, message: &str) {
            self.0.borrow_mut().push((level, message.to_string()));
        }
    }

    #[derive(Clone, Default)]
    struct CountingHooks(Rc<Cell<u32>>);

    impl ErrorHooks for CountingHooks {
        fn process(&self, _value: &ErrorValue) {
            self.0.set(self.0.get() + 1);
        }
    }

    struct NoGrow {
        recover: bool,
    }

    impl AllocHooks for NoGrow {
        fn grow(&self, buf: &mut Vec<u8>, additional: usize) -> std::result::Result<(), AllocError> {
            Err(AllocError {
                requested: buf.len() + additional,
            })
        }

        fn grow_failed(&self, _buf: &mut Vec<u8>, _additional: usize) -> bool {
            self.recover
        }

        fn dup(&self, s: &str) -> std::result::Result<String, AllocError> {
            Err(AllocError { requested: s.len() })
        }

        fn dup_failed(&self, _s: &str) -> Option<String> {
            self.recover.then(|| "fallback".to_string())
        }
    }

    #[test]
    fn submit_then_clear() {
        init(Environment::default());
        let code = submit_error(ErrorCode::SOCKET | ErrorCode::RECV, "peer went away");
        assert_eq!(code, ErrorCode::SOCKET | ErrorCode::RECV);
        let last = last_error();
        assert_eq!(last.code, code);
        assert_eq!(last.text.as_deref(), Some("peer went away"));

        clear_error();
        assert!(last_error().is_success());
        assert!(last_error().text.is_none());

        submit_error(ErrorCode::TIMEOUT, "slow");
        mark_success();
        assert_eq!(last_error(), ErrorValue::success());
    }

    #[test]
    fn error_state_is_per_thread() {
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [ErrorCode::SEND, ErrorCode::RECV]
            .into_iter()
            .map(|code| {
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    submit_error(code, format!("thread error {code}"));
                    barrier.wait();
                    let seen = last_error().code;
                    barrier.wait();
                    seen
                })
            })
            .collect();
        let seen: Vec<ErrorCode> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(seen, vec![ErrorCode::SEND, ErrorCode::RECV]);
    }

    #[test]
    fn cleanup_releases_and_reinitializes() {
        submit_error(ErrorCode::RT, "boom");
        assert!(is_initialized());
        cleanup();
        assert!(!is_initialized());
        assert!(last_error().is_success());
        assert!(is_initialized());
    }

    #[test]
    fn process_hook_is_overridable() {
        let hooks = CountingHooks::default();
        init(Environment::builder().error_hooks(hooks.clone()).build());
        submit_error(ErrorCode::FATAL, "would exit with the default policy");
        submit_error(ErrorCode::WARN, "minor");
        assert_eq!(hooks.0.get(), 2);
        assert_eq!(last_error().code, ErrorCode::WARN);
        cleanup();
    }

    #[test]
    fn trace_threshold_suppresses_lower_levels() {
        let sink = Collect::default();
        init(
            Environment::builder()
                .trace_sink(sink.clone())
                .trace_level(Some(Level::Warn))
                .build(),
        );
        crate::vws_trace!(Level::Debug, "hidden {}", 1);
        crate::vws_trace!(Level::Info, "hidden {}", 2);
        crate::vws_trace!(Level::Warn, "shown {}", 3);
        crate::vws_trace!(Level::Error, "shown {}", 4);
        assert_eq!(
            *sink.0.borrow(),
            vec![
                (Level::Warn, "shown 3".to_string()),
                (Level::Error, "shown 4".to_string())
            ]
        );

        set_trace_level(None);
        crate::vws_trace!(Level::Error, "off");
        assert_eq!(sink.0.borrow().len(), 2);
        assert!(!trace_enabled(Level::Error));
        cleanup();
    }

    #[test]
    fn grow_failure_reports_memory_error() {
        init(
            Environment::builder()
                .alloc_hooks(NoGrow { recover: false })
                .error_hooks(CountingHooks::default())
                .build(),
        );
        let mut buf = Vec::new();
        let err = grow(&mut buf, 64).unwrap_err();
        assert!(matches!(err, Error::Memory(AllocError { requested: 64 })));
        assert_eq!(last_error().code, ErrorCode::MEM);
        assert!(dup("abc").is_err());
        cleanup();
    }

    #[test]
    fn failure_handler_can_recover() {
        init(Environment::builder().alloc_hooks(NoGrow { recover: true }).build());
        let mut buf = Vec::new();
        assert!(grow(&mut buf, 64).is_ok());
        assert_eq!(dup("abc").unwrap(), "fallback");
        assert!(last_error().is_success());
        cleanup();
    }

    #[test]
    fn default_allocators() {
        let v = alloc(32).unwrap();
        assert!(v.is_empty());
        assert!(v.capacity() >= 32);
        let z = alloc_zeroed(4, 8).unwrap();
        assert_eq!(z, vec![0u8; 32]);
        assert_eq!(dup("hello").unwrap(), "hello");
        assert!(alloc_zeroed(usize::MAX, 2).is_err());
        assert_eq!(last_error().code, ErrorCode::MEM);
        cleanup();
    }

    #[test]
    fn state_flags() {
        with(|env| {
            env.set_flag(1 << 4);
            env.set_flag(1 << 1);
            assert!(env.is_flag(1 << 4));
            env.clear_flag(1 << 4);
            assert!(!env.is_flag(1 << 4));
            assert_eq!(env.state(), 1 << 1);
        });
        cleanup();
    }

    #[test]
    fn level_parsing() {
        assert_eq!("WARN".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!(" debug ".parse::<Level>().unwrap(), Level::Debug);
        assert!("loud".parse::<Level>().is_err());
        assert!(Level::Debug < Level::Info && Level::Warn < Level::Error);
    }
}
