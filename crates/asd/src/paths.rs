use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tracing::warn;

/// Maximum number of ancestors to walk when looking for a project `.asd` dir.
const ANCESTOR_WALK_LIMIT: usize = 50;

/// Workspace subdirectories created on first resolution.
const WORKSPACE_SUBDIRS: &[&str] = &["logs", "network", "caddy", "tunnels"];

static DOUBLED_ASD_WARNED: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinLocation {
    Global,
    Workspace,
}

/// Canonical absolute locations for one invocation. Every path is absolute;
/// writable directories exist by the time `resolve` returns.
#[derive(Debug, Clone)]
pub struct Paths {
    pub asd_home: PathBuf,
    pub project_root: PathBuf,
    pub workspace_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub log_dir: PathBuf,
    pub network_dir: PathBuf,
    pub caddy_dir: PathBuf,
    pub tunnels_dir: PathBuf,
    pub registry_path: PathBuf,
    pub dotenv_path: PathBuf,
    pub credentials_path: PathBuf,
}

impl Paths {
    pub fn resolve(cwd: &Path) -> anyhow::Result<Self> {
        let cwd = absolutize(cwd)?;
        let asd_home = resolve_asd_home();

        // ASD_DIR_PATH pins the whole .asd directory (test sandboxes use it).
        let asd_dir = match env::var("ASD_DIR_PATH") {
            Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
            _ => find_project_asd_dir(&cwd),
        };

        let project_root = asd_dir
            .as_ref()
            .and_then(|d| d.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| cwd.clone());

        let workspace_dir = match env::var("ASD_WORKSPACE_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => match &asd_dir {
                Some(dir) => dir.join("workspace"),
                None => asd_home.join("workspace"),
            },
        };
        warn_on_doubled_asd(&workspace_dir);

        let bin_location = match env::var("ASD_BIN_LOCATION").as_deref() {
            Ok("workspace") => BinLocation::Workspace,
            _ => BinLocation::Global,
        };
        let bin_dir = match env::var("ASD_BIN_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => match bin_location {
                BinLocation::Global => asd_home.join("bin"),
                BinLocation::Workspace => workspace_dir.join("bin"),
            },
        };

        let paths = Self {
            log_dir: workspace_dir.join("logs"),
            network_dir: workspace_dir.join("network"),
            caddy_dir: workspace_dir.join("caddy"),
            tunnels_dir: workspace_dir.join("tunnels"),
            registry_path: workspace_dir.join("network/registry.json"),
            dotenv_path: project_root.join(".env"),
            credentials_path: asd_home.join("credentials.json"),
            asd_home,
            project_root,
            workspace_dir,
            bin_dir,
        };
        paths.ensure_writable_dirs()?;
        Ok(paths)
    }

    fn ensure_writable_dirs(&self) -> anyhow::Result<()> {
        for dir in [&self.asd_home, &self.workspace_dir, &self.bin_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        for sub in WORKSPACE_SUBDIRS {
            let dir = self.workspace_dir.join(sub);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Project config file (`asd.yaml` at the project root).
    pub fn project_config_path(&self) -> PathBuf {
        self.project_root.join("asd.yaml")
    }

    /// Global config file under the ASD home.
    pub fn global_config_path(&self) -> PathBuf {
        self.asd_home.join("config.yaml")
    }
}

/// Walk up from `cwd` looking for an existing `.asd` directory.
fn find_project_asd_dir(cwd: &Path) -> Option<PathBuf> {
    let mut dir = cwd;
    for _ in 0..ANCESTOR_WALK_LIMIT {
        let candidate = dir.join(".asd");
        if candidate.is_dir() {
            return Some(candidate);
        }
        dir = dir.parent()?;
    }
    None
}

fn resolve_asd_home() -> PathBuf {
    if let Ok(dir) = env::var("ASD_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    os_default_home()
}

#[cfg(target_os = "macos")]
fn os_default_home() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join("Library/Application Support/asd")
}

#[cfg(target_os = "windows")]
fn os_default_home() -> PathBuf {
    let base = env::var("LOCALAPPDATA").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(base).join("asd")
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn os_default_home() -> PathBuf {
    let base = env::var("XDG_DATA_HOME").map(PathBuf::from).unwrap_or_else(|_| {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".local/share")
    });
    base.join("asd")
}

/// A `…/.asd/.asd/…` path almost always means a misconfigured override.
/// Known CI layouts nest intentionally, so those stay quiet.
fn warn_on_doubled_asd(path: &Path) {
    let raw = path.to_string_lossy();
    if !raw.contains(".asd/.asd") && !raw.contains(".asd\\.asd") {
        return;
    }
    let in_ci = env::var("CI").map(|v| v == "true").unwrap_or(false) || raw.contains("/ci/");
    if in_ci {
        return;
    }
    if !DOUBLED_ASD_WARNED.swap(true, Ordering::Relaxed) {
        warn!(path = %path.display(), "doubled .asd segment in workspace path, check ASD_* overrides");
    }
}

fn absolutize(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()
            .context("failed to read current dir")?
            .join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("asd-test-paths-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn finds_asd_dir_in_ancestor() {
        let root = temp_dir("ancestor");
        fs::create_dir_all(root.join(".asd")).unwrap();
        let nested = root.join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        let found = find_project_asd_dir(&nested).expect("should find .asd");
        assert_eq!(found, root.join(".asd"));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn no_asd_dir_yields_none() {
        let root = temp_dir("none");
        assert!(find_project_asd_dir(&root).is_none());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn resolve_creates_workspace_tree() {
        let root = temp_dir("create");
        fs::create_dir_all(root.join(".asd")).unwrap();
        // Scope env overrides away from this test: resolution relies purely on
        // the ancestor walk when ASD_DIR_PATH/ASD_WORKSPACE_DIR are unset.
        let paths = Paths::resolve(&root).expect("resolve");
        assert!(paths.workspace_dir.is_absolute());
        for sub in WORKSPACE_SUBDIRS {
            assert!(paths.workspace_dir.join(sub).is_dir(), "missing {sub}");
        }
        assert_eq!(paths.registry_path, paths.workspace_dir.join("network/registry.json"));
        fs::remove_dir_all(&root).ok();
    }
}
