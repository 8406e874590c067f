use std::io::Write;
use std::path::Path;

/// Writes `content` to `path` atomically with owner-only permissions.
///
/// The bytes go to a sibling temp file first (created `0600` on unix), which is
/// then renamed over the destination. A crash mid-write leaves the previous
/// file intact.
pub fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = tempfile::Builder::new()
        .prefix(".mailprint-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    file.write_all(content)?;
    file.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
    }

    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
