//! Capability-scoped reads of local source files.

use std::io;

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;

/// Reads a local file through a directory handle opened on its parent.
///
/// # Errors
///
/// Returns the underlying I/O error when the parent cannot be opened or the
/// file cannot be read.
pub(crate) fn read_bytes(path: &Utf8Path) -> io::Result<Vec<u8>> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{path} has no file name"))
    })?;
    let parent = match path.parent() {
        Some(dir) if !dir.as_str().is_empty() => dir,
        _ => Utf8Path::new("."),
    };
    let dir = Dir::open_ambient_dir(parent, ambient_authority())?;
    dir.read(file_name)
}
