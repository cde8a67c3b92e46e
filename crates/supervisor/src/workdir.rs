//! Transient working area and result artifact directories.

use std::{
	io::ErrorKind,
	path::{Path, PathBuf},
};

use tokio::fs;
use tracing::debug;

/// Wipe the working area and recreate it empty, along with the result base.
pub(crate) async fn prepare(work_dir: &Path, result_base: &Path) -> std::io::Result<()> {
	match fs::remove_dir_all(work_dir).await {
		Ok(()) => debug!(?work_dir, "cleared work directory"),
		Err(err) if err.kind() == ErrorKind::NotFound => {}
		Err(err) => return Err(err),
	}

	fs::create_dir_all(work_dir).await?;
	fs::create_dir_all(result_base).await?;
	Ok(())
}

/// Pick the first `<base>/<prefix><n>.trace` which doesn't exist yet.
pub(crate) async fn next_result_dir(base: &Path, prefix: &str) -> std::io::Result<PathBuf> {
	for n in 0_u32.. {
		let candidate = base.join(format!("{prefix}{n}.trace"));
		if !fs::try_exists(&candidate).await? {
			debug!(?candidate, "picked result directory");
			return Ok(candidate);
		}
	}

	Err(std::io::Error::new(
		ErrorKind::AlreadyExists,
		"no free result directory name",
	))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn prepare_wipes_previous_contents() {
		let tmp = tempfile::tempdir().unwrap();
		let work = tmp.path().join("work");
		std::fs::create_dir_all(work.join("stale")).unwrap();
		std::fs::write(work.join("stale/file"), b"old").unwrap();

		prepare(&work, &work).await.unwrap();
		assert!(work.is_dir());
		assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
	}

	#[tokio::test]
	async fn prepare_creates_missing_dirs() {
		let tmp = tempfile::tempdir().unwrap();
		let work = tmp.path().join("a/b");
		let results = tmp.path().join("results");
		prepare(&work, &results).await.unwrap();
		assert!(work.is_dir());
		assert!(results.is_dir());
	}

	#[tokio::test]
	async fn result_dir_skips_existing() {
		let tmp = tempfile::tempdir().unwrap();
		assert_eq!(
			next_result_dir(tmp.path(), "trace").await.unwrap(),
			tmp.path().join("trace0.trace")
		);

		std::fs::create_dir(tmp.path().join("trace0.trace")).unwrap();
		std::fs::create_dir(tmp.path().join("trace1.trace")).unwrap();
		assert_eq!(
			next_result_dir(tmp.path(), "trace").await.unwrap(),
			tmp.path().join("trace2.trace")
		);
	}
}
