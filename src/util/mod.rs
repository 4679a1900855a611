//! Small shared helpers: wall-clock milliseconds, poisoned-lock recovery,
//! and the trailing-edge debouncer used by cache warm-up.

mod debounce;
mod lock;
mod time;

pub use debounce::Debouncer;
pub(crate) use lock::{MutexExt, RwLockExt};
pub use time::now_ms;
