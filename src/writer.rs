//! Atomic file writer (spec.md §4.4): write-temp-then-rename so readers of
//! `path` always observe either the previous complete file or the new one,
//! never a partial write.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::err::WriterError;
use crate::model::BackendFile;

#[cfg(unix)]
const OUTPUT_MODE: u32 = 0o644;

/// Encode and atomically write `file` to `path`. Writes `path.tmp` (mode
/// 0644), then renames it into place; on rename failure the temp file is
/// removed on a best-effort basis (spec.md §4.4).
pub fn write_backend_file(path: &Path, file: &BackendFile) -> Result<(), WriterError> {
    let encoded = file.encode()?;
    write_atomic(path, &encoded)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), WriterError> {
    let tmp_path = temp_path(path);

    let write_result = (|| -> std::io::Result<()> {
        let mut tmp = std::fs::File::create(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.flush()?;
        tmp.sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.set_permissions(std::fs::Permissions::from_mode(OUTPUT_MODE))?;
        }
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(WriterError::TempWrite(err));
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(WriterError::Rename(err));
    }
    Ok(())
}
