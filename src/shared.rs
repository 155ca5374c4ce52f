pub mod fs_atomic;
pub mod logging;
pub mod time;

pub use fs_atomic::atomic_write_file;
pub use logging::{append_core_log, append_sandbox_log};
pub use time::{now_millis, now_secs};
