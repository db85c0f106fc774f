//! Atomic file replacement.
//!
//! Outputs are polled by status checks while a run is still going, so a
//! reader must never observe a half-written file: data goes to a temp file in
//! the destination directory, is synced, then renamed over the target.

use std::io::{self, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

pub fn write_atomically<F>(path: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
