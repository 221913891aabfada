//! Where Lodestone stores its own data (config).
//!
//! Documents stay in the folder they are indexed from; vectors live in the store.

use std::path::PathBuf;

/// Returns the directory where Lodestone stores its config.
/// On Linux: `~/.local/share/lodestone/`.
/// Creates the directory if it doesn't exist; returns `None` if we can't determine the path.
pub fn app_data_dir() -> Option<PathBuf> {
    let dir = directories::ProjectDirs::from("dev", "Lodestone", "lodestone")?
        .data_local_dir()
        .to_path_buf();
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}
