//! Utility functions

use crate::error::{BuildError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};
use walkdir::WalkDir;

/// A regex that matches a double-quoted C-style include directive with the
/// named group "path".
pub static RE_INCLUDE_DIRECTIVE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^\s*#\s*include\s+"(?P<path>[^"]+)""#).unwrap());

/// A regex that matches a `{name}` macro token inside a settings string with
/// the named group "name". Dotted names are allowed so adapters can reference
/// nested values.
pub static RE_MACRO_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(?P<name>[A-Za-z_][A-Za-z0-9_.]*)\}").unwrap());

/// Returns the extension of `path` including the leading dot, or the empty
/// string for extensionless files.
///
/// The empty string is a valid extension throughout the engine; tools may
/// declare it to consume files with no extension.
pub fn extension_of(path: &Path) -> String {
    match path.extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

/// The host platform name used for `platform` axis matching: one of the
/// `std::env::consts::OS` values, e.g. `linux`, `windows`, `macos`.
pub fn host_platform() -> &'static str {
    std::env::consts::OS
}

/// Canonicalize the path, returning an absolute path without `.` or `..`
/// components and without UNC prefixes on Windows.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| BuildError::io(err, path))
}

/// Returns an absolute form of the path, resolving against the current
/// working directory only when necessary. The file does not have to exist.
pub fn absolutize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if path.is_absolute() {
        return Ok(normalize_lexically(path));
    }
    let cwd = std::env::current_dir().map_err(|err| BuildError::io(err, path))?;
    Ok(normalize_lexically(&cwd.join(path)))
}

// Removes `.` and resolves `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(comp);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Last modification time of the file at `path`.
pub fn mtime(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|err| BuildError::io(err, path))
}

/// Creates the parent directory of the given file, recursively.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildError::io(err, parent))?;
    }
    Ok(())
}

/// Reads and deserializes a JSON file.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|err| BuildError::io(err, path))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Serializes and writes a value as a JSON file, creating parent directories
/// as needed.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let file = fs::File::create(path).map_err(|err| BuildError::io(err, path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush().map_err(|err| BuildError::io(err, path))?;
    Ok(())
}

/// Fsync the directory itself where the platform provides it, so entries
/// created in it survive a crash. A no-op on platforms without directory
/// fsync.
pub fn sync_dir(dir: &Path) -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            let handle = fs::File::open(dir).map_err(|err| BuildError::io(err, dir))?;
            handle.sync_all().map_err(|err| BuildError::io(err, dir))?;
            Ok(())
        } else {
            let _ = dir;
            Ok(())
        }
    }
}

/// Returns an iterator that yields all files under `root` (following
/// symlinks) whose extension is contained in `extensions`.
pub fn source_files_iter<'a>(
    root: &Path,
    extensions: &'a indexmap::IndexSet<String>,
) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| extensions.contains(&extension_of(e.path())))
        .map(|e| e.path().to_path_buf())
}

/// Returns all quoted include paths referenced by the given source text.
pub fn find_include_paths(source: &str) -> impl Iterator<Item = &str> {
    RE_INCLUDE_DIRECTIVE
        .captures_iter(source)
        .filter_map(|cap| cap.name("path").map(|m| m.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_includes_leading_dot() {
        assert_eq!(extension_of(Path::new("/a/b/foo.cpp")), ".cpp");
        assert_eq!(extension_of(Path::new("/a/b/Makefile")), "");
        assert_eq!(extension_of(Path::new("foo.tar.gz")), ".gz");
    }

    #[test]
    fn finds_quoted_includes_only() {
        let src = r#"
            #include "foo.h"
            #include <vector>
              #  include "bar/baz.h"
            // #include "not this one" -- still matched, scanning is textual
        "#;
        let found: Vec<_> = find_include_paths(src).collect();
        assert!(found.contains(&"foo.h"));
        assert!(found.contains(&"bar/baz.h"));
        assert!(!found.contains(&"vector"));
    }

    #[test]
    fn normalizes_dot_components() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/./c/../d")),
            PathBuf::from("/a/b/d")
        );
    }
}
