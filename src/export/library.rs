use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Context as _;

use crate::foundation::error::{FramegraphError, FramegraphResult};

/// Called with `true` when the user granted access.
pub type AuthorizationCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Called once a library write finished.
pub type WriteCallback = Box<dyn FnOnce(FramegraphResult<()>) + Send + 'static>;

/// Media library that accepts finished video files.
///
/// Callbacks may run on any thread, before or after the call returns.
pub trait LibraryWriter: Send + Sync + 'static {
    /// `true` when writes are currently allowed.
    fn is_authorized(&self) -> bool;

    /// Ask for write access.
    fn request_authorization(&self, done: AuthorizationCallback);

    /// Store a copy of `file` in the library.
    fn write_video(&self, file: &Path, done: WriteCallback);
}

/// Library backed by a plain directory.
#[derive(Debug)]
pub struct DirectoryLibrary {
    dir: PathBuf,
    authorized: AtomicBool,
    grant_requests: AtomicBool,
    writes: AtomicUsize,
}

impl DirectoryLibrary {
    /// Library in `dir` that still needs authorization; requests are granted.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            authorized: AtomicBool::new(false),
            grant_requests: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
        }
    }

    /// Library in `dir` that is already authorized.
    pub fn authorized(dir: impl Into<PathBuf>) -> Self {
        let lib = Self::new(dir);
        lib.authorized.store(true, Ordering::Release);
        lib
    }

    /// Refuse every authorization request.
    pub fn deny_requests(self) -> Self {
        self.set_grant_requests(false);
        self
    }

    /// Allow or refuse future authorization requests.
    pub fn set_grant_requests(&self, grant: bool) {
        self.grant_requests.store(grant, Ordering::Release);
    }

    /// Library directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of files stored so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Acquire)
    }

    fn copy_in(&self, file: &Path) -> FramegraphResult<PathBuf> {
        let name = file.file_name().ok_or_else(|| {
            FramegraphError::library(format!("'{}' has no file name", file.display()))
        })?;
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create library '{}'", self.dir.display()))?;
        let dest = self.dir.join(name);
        std::fs::copy(file, &dest).map_err(|e| {
            FramegraphError::library(format!("failed to copy '{}': {e}", file.display()))
        })?;
        Ok(dest)
    }
}

impl LibraryWriter for DirectoryLibrary {
    fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Acquire)
    }

    fn request_authorization(&self, done: AuthorizationCallback) {
        if self.grant_requests.load(Ordering::Acquire) {
            self.authorized.store(true, Ordering::Release);
        }
        done(self.is_authorized());
    }

    fn write_video(&self, file: &Path, done: WriteCallback) {
        if !self.is_authorized() {
            done(Err(FramegraphError::permission_denied(format!(
                "library '{}' is not authorized",
                self.dir.display()
            ))));
            return;
        }
        let result = self.copy_in(file).map(|dest| {
            self.writes.fetch_add(1, Ordering::AcqRel);
            tracing::info!(file = %dest.display(), "video saved to library");
        });
        done(result);
    }
}
