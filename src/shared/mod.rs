pub mod errors;
pub mod front_matter;
pub mod fs_atomic;
pub mod ids;
pub mod logging;
pub mod time;

pub use errors::{PipelineError, RuntimeError};
pub use fs_atomic::{atomic_move_file, atomic_write_file, canonicalize_existing};
pub use ids::{new_uuid, sanitize_filename_component, validate_stem};
pub use logging::append_runtime_log;
pub use time::{now_rfc3339, now_secs};
