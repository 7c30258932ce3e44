use std::path::PathBuf;
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

const SAVEDATA_DIR_NAME: &str = "savedata";
const HISTORY_DB_FILE: &str = "history.db";

fn exe_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent().map(|p| p.to_path_buf())
}

/// Resolve and create the application's data directory.
///
/// `POLARIS_DATA_DIR` wins; otherwise `<exe_dir>/savedata`.
pub(crate) fn data_dir() -> Result<PathBuf, String> {
    if let Some(dir) = DATA_DIR.get() {
        return Ok(dir.clone());
    }

    let dir = match std::env::var("POLARIS_DATA_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        Some(dir) => PathBuf::from(dir),
        None => exe_dir()
            .ok_or_else(|| "Failed to resolve executable directory".to_string())?
            .join(SAVEDATA_DIR_NAME),
    };

    std::fs::create_dir_all(&dir).map_err(|e| format!("Failed to create data directory: {e}"))?;
    let _ = DATA_DIR.set(dir.clone());
    Ok(dir)
}

pub(crate) fn history_db_path() -> Result<PathBuf, String> {
    Ok(data_dir()?.join(HISTORY_DB_FILE))
}
