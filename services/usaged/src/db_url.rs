//! Checks on `DATABASE_URL` before the store opens it.

use std::fs;
use std::path::PathBuf;

use anyhow::bail;

const MEMORY_PREFIX: &str = "sqlite::memory:";
const URL_PREFIX: &str = "sqlite://";

pub fn validate_database_url(url: &str) -> anyhow::Result<()> {
    if url.starts_with(MEMORY_PREFIX) {
        return Ok(());
    }
    let Some(rest) = url.strip_prefix(URL_PREFIX) else {
        bail!("database url must start with `sqlite://` or use `sqlite::memory:`");
    };
    if strip_query(rest).is_empty() {
        bail!("database url is missing a filesystem component after `sqlite://`");
    }
    Ok(())
}

/// Creates the directory that will hold the database file, if any.
pub fn ensure_parent_dir(url: &str) -> anyhow::Result<()> {
    let Some(path) = database_file(url) else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn database_file(url: &str) -> Option<PathBuf> {
    if url.starts_with(MEMORY_PREFIX) {
        return None;
    }
    let rest = url.strip_prefix(URL_PREFIX)?;
    Some(PathBuf::from(strip_drive_slash(strip_query(rest))))
}

fn strip_query(rest: &str) -> &str {
    rest.split_once('?').map(|(path, _)| path).unwrap_or(rest)
}

/// `sqlite:///C:/db` carries a slash before the drive letter.
fn strip_drive_slash(path: &str) -> &str {
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 3
        && bytes[0] == b'/'
        && bytes[1].is_ascii_alphabetic()
        && bytes[2] == b':';
    if drive {
        &path[1..]
    } else {
        path
    }
}
