//! Hot reload of the credential key file, supplementing the admin-surface
//! reload path that this crate otherwise leaves out of scope. A
//! `notify-debouncer-full` watch triggers [`crate::pool::CredentialPool::reload_keys`]
//! whenever the underlying file is rewritten, so an operator can rotate
//! keys by replacing the file rather than restarting the process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use tracing::{info, warn};

use crate::pool::{CredentialPool, KeySpec};

/// How long to wait after the last filesystem event before reloading, so a
/// writer that truncates then rewrites the file doesn't trigger a reload
/// against a half-written file.
const DEBOUNCE: Duration = Duration::from_secs(2);

/// Starts watching `path`, reloading `pool` via `load` whenever the file
/// changes. The returned [`Debouncer`] must be kept alive for the watch to
/// stay active; dropping it stops the watcher.
pub fn watch(
	path: &Path,
	pool: Arc<CredentialPool>,
	load: impl Fn(&Path) -> anyhow::Result<Vec<KeySpec>> + Send + 'static,
) -> anyhow::Result<Debouncer<notify::RecommendedWatcher, RecommendedCache>> {
	let watched_path: PathBuf = path.to_path_buf();
	let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| match result {
		Ok(events) if events.iter().any(|e| e.kind.is_modify() || e.kind.is_create()) => match load(&watched_path) {
			Ok(keys) => {
				let count = keys.len();
				pool.reload_keys(keys);
				info!(count, path = %watched_path.display(), "reloaded credential key file");
			},
			Err(err) => warn!(%err, path = %watched_path.display(), "key file changed but failed to parse; keeping previous keys"),
		},
		Ok(_) => {},
		Err(errors) => {
			for err in errors {
				warn!(%err, "key file watcher error");
			}
		},
	})?;
	debouncer.watch(path, RecursiveMode::NonRecursive)?;
	Ok(debouncer)
}
