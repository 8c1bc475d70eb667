//! Search-path synthesis shared by the locator and the invoker's environment.
//!
//! Node version managers install each runtime (and every globally installed
//! package such as pm2) under a per-version directory, so the ambient `PATH`
//! of a desktop process often misses them.

use std::cmp::Ordering;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// `(versions directory relative to home, bin directory relative to a version)`.
const VERSION_MANAGER_LAYOUTS: &[(&str, &str)] = &[
    (".nvm/versions/node", "bin"),
    (".local/share/fnm/node-versions", "installation/bin"),
    ("Library/Application Support/fnm/node-versions", "installation/bin"),
    (".asdf/installs/nodejs", "bin"),
];

const HOME_PREFIXES: &[&str] = &[
    ".volta/bin",
    ".bun/bin",
    ".local/share/pnpm",
    ".yarn/bin",
    ".npm-global/bin",
    ".local/bin",
];

#[cfg(target_arch = "aarch64")]
const SYSTEM_PREFIXES: &[&str] = &["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin", "/bin", "/snap/bin"];
#[cfg(not(target_arch = "aarch64"))]
const SYSTEM_PREFIXES: &[&str] = &["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin", "/bin", "/snap/bin"];

/// `HOME` when set, otherwise the platform's notion of the user's home.
pub fn resolve_home(env_home: Option<OsString>) -> Option<PathBuf> {
    env_home
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
        .or_else(dirs_next::home_dir)
}

/// Numeric-aware version ordering: `v16.2.0 > 14.0.0 > 8.1.0`, `10.0.0 > 9.9.9`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a = tokenize(a.trim_start_matches(['v', 'V']));
    let b = tokenize(b.trim_start_matches(['v', 'V']));
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = match (x, y) {
            (Token::Num(x), Token::Num(y)) => {
                let (x, y) = (x.trim_start_matches('0'), y.trim_start_matches('0'));
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            (Token::Num(_), Token::Text(_)) => Ordering::Greater,
            (Token::Text(_), Token::Num(_)) => Ordering::Less,
            (Token::Text(x), Token::Text(y)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

#[derive(Debug)]
enum Token<'a> {
    Num(&'a str),
    Text(&'a str),
}

fn tokenize(s: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let bytes = s.as_bytes();
    while start < bytes.len() {
        let numeric = bytes[start].is_ascii_digit();
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() == numeric {
            end += 1;
        }
        let chunk = &s[start..end];
        if numeric {
            tokens.push(Token::Num(chunk));
        } else if chunk != "." {
            tokens.push(Token::Text(chunk));
        }
        start = end;
    }
    tokens
}

/// Bin directories of installed runtimes that actually contain `binary`,
/// newest version first within each manager.
pub fn version_manager_bin_dirs(home: &Path, binary: &str) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for (versions_dir, bin_suffix) in VERSION_MANAGER_LAYOUTS {
        let root = home.join(versions_dir);
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        let mut versions: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        versions.sort_by(|a, b| compare_versions(b, a));

        for version in versions {
            let bin_dir = root.join(&version).join(bin_suffix);
            if bin_dir.join(binary).is_file() {
                debug!(dir = %bin_dir.display(), "Found version-manager bin directory");
                found.push(bin_dir);
            }
        }
    }
    found
}

/// Fixed package-manager and system prefixes, home-relative ones first.
pub fn common_prefixes(home: Option<&Path>) -> Vec<PathBuf> {
    let mut prefixes: Vec<PathBuf> = home
        .map(|h| HOME_PREFIXES.iter().map(|p| h.join(p)).collect())
        .unwrap_or_default();
    prefixes.extend(SYSTEM_PREFIXES.iter().map(PathBuf::from));
    prefixes
}

/// Directories to search, highest priority first: explicit extras, version
/// managers, common prefixes. Deduplicated, order preserved.
pub fn priority_dirs(home: Option<&Path>, binary: &str, extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = extra.to_vec();
    if let Some(home) = home {
        dirs.extend(version_manager_bin_dirs(home, binary));
    }
    dirs.extend(common_prefixes(home));
    dedup_preserving_order(dirs)
}

/// `priority_dirs` prepended to an existing search path. Never drops existing entries.
pub fn augmented_search_path(
    existing: Option<&OsStr>,
    home: Option<&Path>,
    binary: &str,
    extra: &[PathBuf],
) -> OsString {
    let mut entries = priority_dirs(home, binary, extra);
    if let Some(existing) = existing {
        entries.extend(std::env::split_paths(existing));
    }
    let entries = dedup_preserving_order(entries);
    match std::env::join_paths(entries.iter()) {
        Ok(joined) => joined,
        Err(e) => {
            warn!(error = %e, "Could not join augmented search path, keeping the inherited one");
            existing.map(OsStr::to_os_string).unwrap_or_default()
        }
    }
}

fn dedup_preserving_order(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut seen = std::collections::HashSet::new();
    paths
        .into_iter()
        .filter(|p| !p.as_os_str().is_empty())
        .filter(|p| seen.insert(p.clone()))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::fake_nvm_install;
    use super::*;

    #[test]
    fn versions_order_numerically_not_lexically() {
        let mut versions = vec!["14.0.0", "16.2.0", "8.1.0", "v10.24.1"];
        versions.sort_by(|a, b| compare_versions(b, a));
        assert_eq!(versions, vec!["16.2.0", "14.0.0", "v10.24.1", "8.1.0"]);
        assert_eq!(compare_versions("18.0.0", "18.0"), Ordering::Greater);
        assert_eq!(compare_versions("v20.1.0", "20.1.0"), Ordering::Equal);
    }

    #[test]
    fn nvm_dirs_are_newest_first_and_must_contain_binary() {
        let home = tempfile::tempdir().unwrap();
        for v in ["14.0.0", "16.2.0", "8.1.0"] {
            fake_nvm_install(home.path(), v, "pm2");
        }
        // A version without pm2 installed is skipped.
        std::fs::create_dir_all(home.path().join(".nvm/versions/node/20.0.0/bin")).unwrap();

        let dirs = version_manager_bin_dirs(home.path(), "pm2");
        let versions: Vec<String> = dirs
            .iter()
            .map(|d| d.parent().unwrap().file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(versions, vec!["16.2.0", "14.0.0", "8.1.0"]);
    }

    #[test]
    fn augmented_path_prepends_and_keeps_existing() {
        let home = tempfile::tempdir().unwrap();
        fake_nvm_install(home.path(), "18.19.0", "pm2");
        let existing = std::env::join_paths(["/custom/bin", "/usr/bin"]).unwrap();
        let extra = vec![PathBuf::from("/first/bin")];

        let joined = augmented_search_path(Some(&existing), Some(home.path()), "pm2", &extra);
        let entries: Vec<PathBuf> = std::env::split_paths(&joined).collect();

        assert_eq!(entries[0], PathBuf::from("/first/bin"));
        assert_eq!(entries[1], home.path().join(".nvm/versions/node/18.19.0/bin"));
        assert!(entries.contains(&PathBuf::from("/custom/bin")));
        assert_eq!(entries.iter().filter(|e| *e == Path::new("/usr/bin")).count(), 1);
    }

    #[test]
    fn home_from_env_wins() {
        assert_eq!(resolve_home(Some(OsString::from("/home/ops"))), Some(PathBuf::from("/home/ops")));
    }
}
