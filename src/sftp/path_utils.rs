//! Cross-platform path utilities for SFTP operations
//!
//! Local paths follow the host platform (including Windows drive letters and
//! UNC paths). Remote SFTP paths always use `/`.

use std::path::Path;

/// Check if a local path is absolute (cross-platform).
///
/// Handles:
/// - Unix absolute paths: `/home/user`
/// - Windows drive letters: `C:\Users`, `D:/data`
/// - Windows UNC paths: `\\server\share`, `\\?\C:\long\path`
pub fn is_absolute_local_path(path: &Path) -> bool {
    if path.is_absolute() {
        return true;
    }

    let path = path.to_string_lossy();

    if path.starts_with('/') {
        return true;
    }

    // Windows drive letter: C:\ or C:/
    let bytes = path.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
    {
        return true;
    }

    // Windows UNC path
    path.starts_with("\\\\") || path.starts_with("//")
}

/// Remote SFTP paths are absolute when they start with `/`, even on
/// Windows SSH servers.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Parent of a remote path; `/` is its own parent
pub fn remote_parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// Last component of a remote path
pub fn remote_file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Extension of a file name including the dot; leading dots don't count
/// (`.bashrc` has none, `a.tar.gz` has `.gz`)
pub fn split_extension(name: &str) -> (&str, &str) {
    let leading = name.len() - name.trim_start_matches('.').len();
    match name[leading..].rfind('.') {
        Some(idx) => name.split_at(leading + idx),
        None => (name, ""),
    }
}

/// Target path for renaming `old_path` to `new_name` within the same folder.
///
/// Files keep their extension: when `new_name` does not already end with the
/// old extension it is appended. Directories are renamed verbatim.
pub fn renamed_path(old_path: &str, new_name: &str, is_dir: bool) -> String {
    let mut name = new_name.to_string();
    if !is_dir {
        let (_, ext) = split_extension(remote_file_name(old_path));
        if !ext.is_empty() && !name.ends_with(ext) {
            name.push_str(ext);
        }
    }
    join_remote_path(remote_parent(old_path), &name)
}

/// Path of the in-flight file for a local destination
pub fn local_part_path(dest: &Path) -> std::path::PathBuf {
    let mut name = dest.as_os_str().to_os_string();
    name.push(super::types::PART_SUFFIX);
    name.into()
}

/// Path of the in-flight file for a remote destination
pub fn remote_part_path(dest: &str) -> String {
    format!("{}{}", dest, super::types::PART_SUFFIX)
}

/// Where an existing remote destination waits while it is being replaced
pub fn remote_backup_path(dest: &str) -> String {
    format!("{}{}", dest, super::types::BACKUP_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_absolute_local_path() {
        assert!(is_absolute_local_path(Path::new("/home/user")));
        assert!(is_absolute_local_path(Path::new("/")));
        assert!(is_absolute_local_path(Path::new("C:\\Users")));
        assert!(is_absolute_local_path(Path::new("d:/data")));
        assert!(is_absolute_local_path(Path::new("\\\\server\\share")));
        assert!(is_absolute_local_path(Path::new("//server/share")));

        assert!(!is_absolute_local_path(Path::new("relative/path")));
        assert!(!is_absolute_local_path(Path::new("./current")));
        assert!(!is_absolute_local_path(Path::new("")));
    }

    #[test]
    fn test_is_absolute_remote_path() {
        assert!(is_absolute_remote_path("/home/user"));
        assert!(is_absolute_remote_path("/"));
        assert!(!is_absolute_remote_path("relative/path"));
        assert!(!is_absolute_remote_path("C:\\Windows"));
    }

    #[test]
    fn test_join_remote_path() {
        assert_eq!(join_remote_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/home/", "file.txt"), "/home/file.txt");
        assert_eq!(join_remote_path("/", "home"), "/home");
    }

    #[test]
    fn test_remote_parent_and_name() {
        assert_eq!(remote_parent("/home/pi/photo.jpg"), "/home/pi");
        assert_eq!(remote_parent("/photo.jpg"), "/");
        assert_eq!(remote_parent("/"), "/");
        assert_eq!(remote_file_name("/home/pi/photo.jpg"), "photo.jpg");
        assert_eq!(remote_file_name("/home/pi/"), "pi");
    }

    #[test]
    fn test_split_extension() {
        assert_eq!(split_extension("photo.jpg"), ("photo", ".jpg"));
        assert_eq!(split_extension("a.tar.gz"), ("a.tar", ".gz"));
        assert_eq!(split_extension(".bashrc"), (".bashrc", ""));
        assert_eq!(split_extension("Makefile"), ("Makefile", ""));
    }

    #[test]
    fn test_renamed_path_keeps_extension() {
        assert_eq!(renamed_path("/pics/photo.jpg", "vacation", false), "/pics/vacation.jpg");
        assert_eq!(renamed_path("/pics/photo.jpg", "vacation.jpg", false), "/pics/vacation.jpg");
        assert_eq!(renamed_path("/pics/notes", "todo", false), "/pics/todo");
        assert_eq!(renamed_path("/pics/album.2024", "trip", true), "/pics/trip");
    }

    #[test]
    fn test_part_paths() {
        assert_eq!(remote_part_path("/data/a.bin"), "/data/a.bin.ferry-part");
        assert_eq!(remote_backup_path("/data/a.bin"), "/data/a.bin.ferry-old");
        assert_eq!(
            local_part_path(Path::new("/tmp/a.bin")),
            std::path::PathBuf::from("/tmp/a.bin.ferry-part")
        );
    }
}
