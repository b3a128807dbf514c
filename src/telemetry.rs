//! Logging setup and panic reporting.

use std::any::Any;
use std::backtrace::Backtrace;
use std::sync::Once;

use tracing::error;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over `level` when set.
///
/// Calling this twice is harmless; the second call keeps the first subscriber.
pub fn init_tracing(level: &str, json: bool) {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(level))
    .unwrap_or_else(|_| EnvFilter::new("info"));

  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .with_thread_ids(true);
  let result = if json {
    builder.json().try_init()
  } else {
    builder.try_init()
  };
  if result.is_err() {
    tracing::debug!("Global subscriber already set, keeping it.");
  }
}

static PANIC_HOOK: Once = Once::new();

/// Routes panics through `tracing` with a captured backtrace, then runs the previous hook.
pub fn install_panic_hook() {
  PANIC_HOOK.call_once(|| {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
      let location = info
        .location()
        .map(|l| format!("{}:{}", l.file(), l.line()))
        .unwrap_or_else(|| "<unknown>".to_string());
      let thread = std::thread::current();
      error!(
        panic = %panic_message(info.payload()),
        %location,
        thread = thread.name().unwrap_or("<unnamed>"),
        backtrace = %Backtrace::force_capture(),
        "Panic."
      );
      previous(info);
    }));
  });
}

/// Whether [`install_panic_hook`] has run in this process.
pub fn panic_hook_installed() -> bool {
  PANIC_HOOK.is_completed()
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&'static str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
