// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Storage seam between the coordinator and document backends.
//!
//! Only the local-filesystem backend ships here; remote content providers
//! plug in behind [`Storage`] and are configured outside the core. A document
//! is copied into the worker's jail at load and copied back at save.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::{debug, info};
use url::Url;

use crate::error::{Result, WsdError};

/// Document root inside a worker's chroot, relative to the jail directory.
pub const JAILED_DOCUMENT_ROOT: &str = "user/docs";

/// What a backend knows about a document before loading it.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub filename: String,
    pub modified_time: SystemTime,
    pub size: u64,
}

pub trait Storage: Send + Sync {
    fn uri(&self) -> &Url;

    /// Probe the document; fails when the URI is invalid or inaccessible.
    fn file_info(&self) -> Result<FileInfo>;

    /// Copy the document into the jail. Returns the path as the worker sees
    /// it inside the chroot.
    fn load_to_jail(&self) -> Result<PathBuf>;

    /// Copy the jailed document back to its origin.
    fn save_from_jail(&self) -> Result<()>;
}

/// Decode and parse a document URI from the wire.
///
/// The URI arrives url-encoded. Bare absolute paths are accepted as local
/// documents.
pub fn sanitize_uri(raw: &str) -> Result<Url> {
    let invalid = || WsdError::BadRequest("Invalid URI.".to_owned());
    let decoded = percent_decode_str(raw).decode_utf8().map_err(|_| invalid())?;
    let decoded = decoded.trim().to_owned();

    let uri = match Url::parse(&decoded) {
        Ok(uri) => uri,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::from_file_path(&decoded).map_err(|()| invalid())?
        }
        Err(_) => return Err(invalid()),
    };

    if uri.path().is_empty() || uri.path() == "/" {
        return Err(invalid());
    }
    Ok(uri)
}

/// Stable per-document key: url-encoded `host + path`.
///
/// The host stays part of the key so documents with equal paths on different
/// hosts never share a broker.
pub fn doc_key(uri: &Url) -> String {
    let raw = format!("{}{}", uri.host_str().unwrap_or(""), uri.path());
    utf8_percent_encode(&raw, NON_ALPHANUMERIC).to_string()
}

/// Create a probe-only storage handle for validation.
pub fn create(uri: &Url) -> Result<Arc<dyn Storage>> {
    LocalStorage::create(uri, None)
}

/// Create a storage handle bound to a worker jail.
pub fn create_jailed(uri: &Url, jail_root: &Path) -> Result<Arc<dyn Storage>> {
    LocalStorage::create(uri, Some(jail_root.to_path_buf()))
}

/// Local filesystem backend for `file://` documents.
struct LocalStorage {
    uri: Url,
    local_path: PathBuf,
    jail_root: Option<PathBuf>,
    jailed_path: Mutex<Option<PathBuf>>,
}

impl LocalStorage {
    fn create(uri: &Url, jail_root: Option<PathBuf>) -> Result<Arc<dyn Storage>> {
        if uri.scheme() != "file" {
            return Err(WsdError::Storage(format!(
                "no storage backend configured for scheme [{}]",
                uri.scheme()
            )));
        }
        let local_path = uri
            .to_file_path()
            .map_err(|()| WsdError::BadRequest("Invalid URI.".to_owned()))?;
        Ok(Arc::new(Self { uri: uri.clone(), local_path, jail_root, jailed_path: Mutex::new(None) }))
    }

    fn filename(&self) -> String {
        self.local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl Storage for LocalStorage {
    fn uri(&self) -> &Url {
        &self.uri
    }

    fn file_info(&self) -> Result<FileInfo> {
        let meta = std::fs::metadata(&self.local_path)
            .map_err(|e| WsdError::Storage(format!("cannot stat [{}]: {e}", self.local_path.display())))?;
        if !meta.is_file() {
            return Err(WsdError::Storage(format!(
                "[{}] is not a regular file",
                self.local_path.display()
            )));
        }
        Ok(FileInfo {
            filename: self.filename(),
            modified_time: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            size: meta.len(),
        })
    }

    fn load_to_jail(&self) -> Result<PathBuf> {
        let jail_root = self
            .jail_root
            .as_ref()
            .ok_or_else(|| WsdError::Internal("storage handle has no jail".to_owned()))?;
        let doc_dir = jail_root.join(JAILED_DOCUMENT_ROOT);
        std::fs::create_dir_all(&doc_dir)
            .map_err(|e| WsdError::Storage(format!("cannot create [{}]: {e}", doc_dir.display())))?;

        let dest = doc_dir.join(self.filename());
        std::fs::copy(&self.local_path, &dest)
            .map_err(|e| WsdError::Storage(format!("cannot copy into jail: {e}")))?;
        *self.jailed_path.lock() = Some(dest.clone());
        debug!(src = %self.local_path.display(), dest = %dest.display(), "loaded document into jail");

        // The worker addresses the document relative to its chroot.
        Ok(Path::new("/").join(JAILED_DOCUMENT_ROOT).join(self.filename()))
    }

    fn save_from_jail(&self) -> Result<()> {
        let jailed = self
            .jailed_path
            .lock()
            .clone()
            .ok_or_else(|| WsdError::Internal("document was never loaded".to_owned()))?;
        std::fs::copy(&jailed, &self.local_path)
            .map_err(|e| WsdError::Storage(format!("cannot save [{}]: {e}", self.uri)))?;
        info!(uri = %self.uri, "saved document to storage");
        Ok(())
    }
}

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;
