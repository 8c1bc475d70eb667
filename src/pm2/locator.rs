use crate::utils::search_path::{augmented_search_path, common_prefixes, resolve_home, version_manager_bin_dirs};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Finds the PM2 executable and caches the answer until told otherwise.
#[derive(Debug)]
pub struct ExecutableLocator {
    binary_name: String,
    home: Option<PathBuf>,
    extra_dirs: Vec<PathBuf>,
    inherited_path: Option<std::ffi::OsString>,
    cached: RwLock<Option<PathBuf>>,
}

impl ExecutableLocator {
    pub fn new(binary_name: impl Into<String>, extra_dirs: Vec<PathBuf>) -> Self {
        Self::with_environment(
            binary_name,
            extra_dirs,
            resolve_home(std::env::var_os("HOME")),
            std::env::var_os("PATH"),
        )
    }

    /// Explicit home and inherited `PATH`, for callers that do not want the
    /// process environment consulted.
    pub fn with_environment(
        binary_name: impl Into<String>,
        extra_dirs: Vec<PathBuf>,
        home: Option<PathBuf>,
        inherited_path: Option<std::ffi::OsString>,
    ) -> Self {
        Self {
            binary_name: binary_name.into(),
            home,
            extra_dirs,
            inherited_path,
            cached: RwLock::new(None),
        }
    }

    /// The cached path, or a fresh probe whose hit is cached.
    pub fn locate(&self) -> Option<PathBuf> {
        if let Some(path) = self.cached.read().ok().and_then(|guard| guard.clone()) {
            return Some(path);
        }
        let found = self.probe();
        if let Some(path) = &found {
            info!(path = %path.display(), "Located {}", self.binary_name);
            if let Ok(mut guard) = self.cached.write() {
                *guard = Some(path.clone());
            }
        } else {
            warn!(binary = %self.binary_name, "Could not locate executable");
        }
        found
    }

    /// Forget the cached path; the next `locate` probes again.
    pub fn invalidate(&self) {
        if let Ok(mut guard) = self.cached.write() {
            if guard.take().is_some() {
                debug!(binary = %self.binary_name, "Invalidated cached executable path");
            }
        }
    }

    pub fn cached(&self) -> Option<PathBuf> {
        self.cached.read().ok().and_then(|guard| guard.clone())
    }

    fn probe(&self) -> Option<PathBuf> {
        // An explicit path skips the search entirely.
        let as_path = Path::new(&self.binary_name);
        if as_path.is_absolute() {
            return is_executable(as_path).then(|| as_path.to_path_buf());
        }

        self.probe_search_path()
            .or_else(|| self.probe_well_known())
            .or_else(|| self.probe_version_managers())
    }

    fn probe_search_path(&self) -> Option<PathBuf> {
        let search_path = augmented_search_path(
            self.inherited_path.as_deref(),
            self.home.as_deref(),
            &self.binary_name,
            &self.extra_dirs,
        );
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        match which::which_in(&self.binary_name, Some(search_path), cwd) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(error = %e, "Search-path lookup found nothing");
                None
            }
        }
    }

    fn probe_well_known(&self) -> Option<PathBuf> {
        self.extra_dirs
            .iter()
            .cloned()
            .chain(common_prefixes(self.home.as_deref()))
            .map(|dir| dir.join(&self.binary_name))
            .find(|candidate| is_executable(candidate))
    }

    fn probe_version_managers(&self) -> Option<PathBuf> {
        let home = self.home.as_deref()?;
        version_manager_bin_dirs(home, &self.binary_name)
            .into_iter()
            .map(|dir| dir.join(&self.binary_name))
            .find(|candidate| is_executable(candidate))
    }
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
