#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn path_contains_separator(cmd: &str) -> bool {
    cmd.contains(std::path::MAIN_SEPARATOR) || cmd.contains('/')
}

fn find_executable_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    let dirs = std::env::split_paths(&path_var).collect::<Vec<_>>();
    find_executable_in_dirs(name, &dirs)
}

fn find_executable_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    if name.trim().is_empty() {
        return None;
    }
    dirs.iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Resolves a provisioning program given either as a path or as a bare name on `PATH`.
pub fn resolve_program(cmd: &str) -> Option<PathBuf> {
    let trimmed = cmd.trim();
    if trimmed.is_empty() {
        return None;
    }
    if path_contains_separator(trimmed) {
        let path = PathBuf::from(trimmed);
        return is_executable(&path).then_some(path);
    }
    find_executable_in_path(trimmed)
}
