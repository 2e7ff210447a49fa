use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

pub const SECRET_FILE_NAME: &str = "ipc_secret_key.txt";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub fn secret_path(root_profile_dir: &Path) -> PathBuf {
    root_profile_dir.join(SECRET_FILE_NAME)
}

/// Every instance started against the same root profile directory ends up
/// with the same token.
pub fn load_or_create(path: &Path) -> Result<String, SecretError> {
    let io_err = |source: io::Error| SecretError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(token) = read_token(path).map_err(io_err)? {
        return Ok(token);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }

    // Writers serialize on the guard and publish by rename.
    let guard = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path.with_extension("lock"))
        .map_err(io_err)?;
    guard.lock_exclusive().map_err(io_err)?;
    let created = publish_if_missing(path);
    let _ = guard.unlock();
    created.map_err(io_err)
}

fn read_token(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let token = content.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn publish_if_missing(path: &Path) -> io::Result<String> {
    if let Some(token) = read_token(path)? {
        return Ok(token);
    }
    let token = new_token();
    let staged = stage_token(path, &token)?;
    let published = fs::rename(&staged, path);
    if published.is_err() {
        let _ = fs::remove_file(&staged);
    }
    published.map(|()| token)
}

fn stage_token(path: &Path, token: &str) -> io::Result<PathBuf> {
    let staged = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staged)?;
    file.write_all(token.as_bytes())?;
    file.flush()?;
    restrict_permissions(&staged);
    Ok(staged)
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
