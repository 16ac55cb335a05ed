//! Locating the Chrome binary to launch.
//!
//! A binary named on the command line wins. Otherwise `CHROME_PATH` is
//! tried, then the usual install locations for the platform.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::BrowserError;

/// Environment variable naming a Chrome binary.
pub const CHROME_PATH_ENV: &str = "CHROME_PATH";

#[cfg(target_os = "macos")]
const INSTALL_LOCATIONS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/homebrew/bin/chromium",
];

#[cfg(not(target_os = "macos"))]
const INSTALL_LOCATIONS: &[&str] = &[
    "/usr/bin/google-chrome-stable",
    "/usr/bin/google-chrome",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
];

/// How a Chrome binary was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChromeOrigin {
    /// Passed explicitly by the caller.
    Explicit,
    /// Read from `CHROME_PATH`.
    Environment,
    /// A standard install location.
    Installed,
}

/// Inputs to a Chrome lookup.
#[derive(Clone, Debug, Default)]
pub struct ChromeSearch {
    /// Path the caller insists on. Must be executable.
    pub explicit: Option<PathBuf>,
    /// Value of `CHROME_PATH`, skipped when not executable.
    pub env: Option<PathBuf>,
    /// Install locations tried in order.
    pub install_locations: Vec<PathBuf>,
}

impl ChromeSearch {
    /// Lookup for this system: `explicit`, then `CHROME_PATH`, then the
    /// platform's install locations.
    pub fn system(explicit: Option<&Path>) -> Self {
        Self {
            explicit: explicit.map(Path::to_path_buf),
            env: std::env::var_os(CHROME_PATH_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            install_locations: INSTALL_LOCATIONS.iter().map(PathBuf::from).collect(),
        }
    }

    /// First usable binary.
    ///
    /// An explicit path that is not an executable file is an error rather
    /// than a fallthrough.
    pub fn resolve(&self) -> Result<(PathBuf, ChromeOrigin), BrowserError> {
        if let Some(path) = &self.explicit {
            if is_executable(path) {
                return Ok((path.clone(), ChromeOrigin::Explicit));
            }
            return Err(BrowserError::LaunchFailed {
                context: format!("{} is not an executable file", path.display()),
            });
        }
        if let Some(path) = &self.env {
            if is_executable(path) {
                return Ok((path.clone(), ChromeOrigin::Environment));
            }
            debug!(path = %path.display(), "{CHROME_PATH_ENV} is not executable, ignoring");
        }
        self.install_locations
            .iter()
            .find(|path| is_executable(path))
            .map(|path| (path.clone(), ChromeOrigin::Installed))
            .ok_or(BrowserError::ChromeNotFound)
    }
}

/// Chrome binary for this system, preferring `explicit`.
pub fn resolve_chrome(explicit: Option<&Path>) -> Result<PathBuf, BrowserError> {
    let (path, origin) = ChromeSearch::system(explicit).resolve()?;
    debug!(path = %path.display(), ?origin, "using Chrome binary");
    Ok(path)
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::fs::Permissions;

    fn script(dir: &Path, name: &str, mode: u32) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(mode)).unwrap();
        path
    }

    #[test]
    fn explicit_path_wins_over_env() {
        let dir = tempfile::tempdir().unwrap();
        let flag = script(dir.path(), "flag-chrome", 0o755);
        let env = script(dir.path(), "env-chrome", 0o755);
        let search = ChromeSearch {
            explicit: Some(flag.clone()),
            env: Some(env),
            install_locations: Vec::new(),
        };
        assert_eq!(search.resolve().unwrap(), (flag, ChromeOrigin::Explicit));
    }

    #[test]
    fn unusable_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let plain = script(dir.path(), "chrome.txt", 0o644);
        let installed = script(dir.path(), "installed-chrome", 0o755);
        let search = ChromeSearch {
            explicit: Some(plain),
            env: None,
            install_locations: vec![installed],
        };
        assert_matches!(
            search.resolve(),
            Err(BrowserError::LaunchFailed { ref context }) if context.contains("chrome.txt")
        );
    }

    #[test]
    fn non_executable_env_falls_through_to_install_locations() {
        let dir = tempfile::tempdir().unwrap();
        let env = script(dir.path(), "env-chrome", 0o644);
        let installed = script(dir.path(), "installed-chrome", 0o755);
        let search = ChromeSearch {
            explicit: None,
            env: Some(env),
            install_locations: vec![
                dir.path().join("missing"),
                dir.path().to_path_buf(),
                installed.clone(),
            ],
        };
        assert_eq!(search.resolve().unwrap(), (installed, ChromeOrigin::Installed));
    }

    #[test]
    fn env_is_used_when_executable() {
        let dir = tempfile::tempdir().unwrap();
        let env = script(dir.path(), "env-chrome", 0o700);
        let search = ChromeSearch {
            env: Some(env.clone()),
            ..ChromeSearch::default()
        };
        assert_eq!(search.resolve().unwrap(), (env, ChromeOrigin::Environment));
    }

    #[test]
    fn nothing_usable_is_not_found() {
        let search = ChromeSearch {
            install_locations: vec![PathBuf::from("/nonexistent/chrome")],
            ..ChromeSearch::default()
        };
        assert_matches!(search.resolve(), Err(BrowserError::ChromeNotFound));
    }

    #[test]
    fn install_locations_are_absolute() {
        let search = ChromeSearch::system(None);
        assert!(!search.install_locations.is_empty());
        assert!(search.install_locations.iter().all(|p| p.is_absolute()));
    }
}
