use anyhow::Result;
use std::path::Path;

/// Bytes free on the file system holding `path`.
#[cfg(target_os = "linux")]
pub fn free_bytes(path: &Path) -> Result<u64> {
    use anyhow::Context;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).context("path contains NUL")?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL terminated and stat is a valid out pointer.
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        anyhow::bail!(
            "statvfs {} failed: {}",
            path.display(),
            std::io::Error::last_os_error()
        );
    }
    Ok(stat.f_bfree as u64 * stat.f_bsize as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn free_bytes(path: &Path) -> Result<u64> {
    anyhow::bail!("free space of {} unavailable on this platform", path.display())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn temp_dir_has_some_space() {
        let dir = tempfile::tempdir().unwrap();
        assert!(free_bytes(dir.path()).unwrap() > 0);
        assert!(free_bytes(Path::new("/definitely/not/here")).is_err());
    }
}
