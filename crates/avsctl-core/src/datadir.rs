//! On-disk data directory
//!
//! Owns every durable entity: instance directories under `nodes/`, backup
//! archives under `backup/`, the keyed temp arena under `temp/` and the
//! monitoring stack under `monitoring/`. No other component writes here.
//! Mutations are bracketed by the per-directory lock; `state.json` is
//! always either absent or a complete document.

use crate::locker::DirLock;
use crate::{CoreError, InstanceState, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = "state.json";
pub const LOCK_FILE: &str = ".lock";
pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const ENV_FILE: &str = ".env";

/// Handle on the data directory root
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Open (creating the skeleton if needed) a data directory at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("nodes"))?;
        fs::create_dir_all(root.join("backup"))?;
        fs::create_dir_all(root.join("temp"))?;
        fs::create_dir_all(root.join("monitoring"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.nodes_dir().join(id)
    }

    pub fn instance_lock_path(&self, id: &str) -> PathBuf {
        self.instance_dir(id).join(LOCK_FILE)
    }

    pub fn compose_path(&self, id: &str) -> PathBuf {
        self.instance_dir(id).join(COMPOSE_FILE)
    }

    pub fn env_path(&self, id: &str) -> PathBuf {
        self.instance_dir(id).join(ENV_FILE)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    pub fn monitoring_dir(&self) -> PathBuf {
        self.root.join("monitoring")
    }

    /// Create an instance directory with its lockfile and state document.
    /// Fails with `InstanceExists` when the id is already installed.
    pub fn init_instance(&self, state: &InstanceState) -> Result<()> {
        let id = state.id();
        if self.has_instance(&id) {
            return Err(CoreError::InstanceExists(id));
        }

        let dir = self.instance_dir(&id);
        fs::create_dir_all(&dir)?;
        let lock = DirLock::acquire(&self.instance_lock_path(&id))?;
        self.write_state(&dir, state)?;
        lock.release()
    }

    /// Read an instance's state document under its lock
    pub fn instance(&self, id: &str) -> Result<InstanceState> {
        let dir = self.instance_dir(id);
        if !dir.exists() {
            return Err(CoreError::InstanceNotFound(id.to_string()));
        }

        let _lock = DirLock::acquire(&self.instance_lock_path(id))?;
        let content = fs::read_to_string(dir.join(STATE_FILE))
            .map_err(|_| CoreError::InstanceNotFound(id.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|e| CoreError::StateCorrupted(format!("{}: {}", id, e)))
    }

    /// An instance exists iff its state document parses and its lockfile
    /// is present
    pub fn has_instance(&self, id: &str) -> bool {
        let dir = self.instance_dir(id);
        if !dir.join(LOCK_FILE).exists() {
            return false;
        }
        fs::read_to_string(dir.join(STATE_FILE))
            .ok()
            .and_then(|content| serde_json::from_str::<InstanceState>(&content).ok())
            .is_some()
    }

    /// List every installed instance, skipping entries whose state cannot
    /// be read
    pub fn list_instances(&self) -> Result<Vec<InstanceState>> {
        let mut instances = Vec::new();
        for entry in fs::read_dir(self.nodes_dir())? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.instance(&id) {
                Ok(state) => instances.push(state),
                Err(e) => {
                    tracing::warn!("Skipping unreadable instance {}: {}", id, e);
                }
            }
        }
        instances.sort_by(|a, b| a.id().cmp(&b.id()));
        Ok(instances)
    }

    /// Remove an instance directory under its lock
    pub fn remove_instance(&self, id: &str) -> Result<()> {
        let dir = self.instance_dir(id);
        if !dir.exists() {
            return Err(CoreError::InstanceNotFound(id.to_string()));
        }

        let lock = DirLock::acquire(&self.instance_lock_path(id))?;
        // The open lockfile lives inside the directory; unlinking an open
        // file is fine on Unix.
        fs::remove_dir_all(&dir)?;
        drop(lock);
        Ok(())
    }

    /// Create (or reuse) the temp entry for a key
    pub fn init_temp(&self, key: &str) -> Result<PathBuf> {
        let path = self.temp_dir().join(key);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Path of an existing temp entry
    pub fn temp_path(&self, key: &str) -> Result<PathBuf> {
        let path = self.temp_dir().join(key);
        if !path.exists() {
            return Err(CoreError::TempNotFound(key.to_string()));
        }
        Ok(path)
    }

    pub fn has_temp(&self, key: &str) -> bool {
        self.temp_dir().join(key).exists()
    }

    /// Remove a temp entry; removing a missing entry is a no-op
    pub fn remove_temp(&self, key: &str) -> Result<()> {
        let path = self.temp_dir().join(key);
        if path.exists() {
            fs::remove_dir_all(&path)?;
        }
        Ok(())
    }

    /// Materialize an instance directory's runtime files: the selected
    /// profile's tree under `profile/`, the compose file at the root and
    /// the rendered `.env`
    pub fn setup(
        &self,
        id: &str,
        env: &BTreeMap<String, String>,
        profile_src: &Path,
    ) -> Result<()> {
        let dir = self.instance_dir(id);
        if !dir.exists() {
            return Err(CoreError::InstanceNotFound(id.to_string()));
        }

        let compose_src = profile_src.join(COMPOSE_FILE);
        if !compose_src.exists() {
            return Err(CoreError::PackageFileNotFound(compose_src));
        }

        let _lock = DirLock::acquire(&self.instance_lock_path(id))?;

        copy_dir_recursive(profile_src, &dir.join("profile"))?;
        fs::copy(&compose_src, dir.join(COMPOSE_FILE))?;
        write_env_file(&dir.join(ENV_FILE), env)?;

        Ok(())
    }

    /// Write `state.json` atomically: temp file in the same directory,
    /// then rename over the target
    fn write_state(&self, dir: &Path, state: &InstanceState) -> Result<()> {
        let mut content = serde_json::to_string_pretty(state)?;
        content.push('\n');

        let tmp = dir.join(".state.json.tmp");
        fs::write(&tmp, &content)?;
        fs::rename(&tmp, dir.join(STATE_FILE))?;
        Ok(())
    }
}

/// Render a `KEY=VALUE` env file, one LF-terminated line per entry
fn write_env_file(path: &Path, env: &BTreeMap<String, String>) -> Result<()> {
    let mut content = String::new();
    for (key, value) in env {
        content.push_str(key);
        content.push('=');
        content.push_str(value);
        content.push('\n');
    }
    fs::write(path, content)?;
    Ok(())
}

/// Recursively copy a directory tree
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if path.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use avsctl_config::TargetSpec;

    fn make_state(name: &str) -> InstanceState {
        InstanceState {
            name: name.to_string(),
            tag: "default".to_string(),
            url: format!("https://github.com/acme/{}", name),
            version: "v1.0.0".to_string(),
            commit: "0".repeat(40),
            profile: "mainnet".to_string(),
            monitoring_targets: vec![TargetSpec {
                service: "node".to_string(),
                port: Some(9090),
                path: "/metrics".to_string(),
            }],
            api_target: None,
            plugin: None,
        }
    }

    fn open_datadir() -> (tempfile::TempDir, DataDir) {
        let tmp = tempfile::tempdir().unwrap();
        let datadir = DataDir::open(tmp.path()).unwrap();
        (tmp, datadir)
    }

    #[test]
    fn test_open_creates_skeleton() {
        let (_tmp, datadir) = open_datadir();
        assert!(datadir.nodes_dir().is_dir());
        assert!(datadir.backup_dir().is_dir());
        assert!(datadir.temp_dir().is_dir());
        assert!(datadir.monitoring_dir().is_dir());
    }

    #[test]
    fn test_init_instance_round_trip() {
        let (_tmp, datadir) = open_datadir();
        let state = make_state("mock-avs");
        datadir.init_instance(&state).unwrap();

        assert!(datadir.has_instance("mock-avs-default"));
        assert!(datadir.instance_lock_path("mock-avs-default").exists());

        let loaded = datadir.instance("mock-avs-default").unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_init_instance_twice_fails() {
        let (_tmp, datadir) = open_datadir();
        let state = make_state("mock-avs");
        datadir.init_instance(&state).unwrap();
        assert!(matches!(
            datadir.init_instance(&state),
            Err(CoreError::InstanceExists(_))
        ));
    }

    #[test]
    fn test_state_file_trailing_newline() {
        let (_tmp, datadir) = open_datadir();
        datadir.init_instance(&make_state("mock-avs")).unwrap();
        let content = fs::read_to_string(
            datadir.instance_dir("mock-avs-default").join(STATE_FILE),
        )
        .unwrap();
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn test_has_instance_requires_parsable_state() {
        let (_tmp, datadir) = open_datadir();
        let dir = datadir.instance_dir("broken-default");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(LOCK_FILE), "").unwrap();
        fs::write(dir.join(STATE_FILE), "{ not json").unwrap();
        assert!(!datadir.has_instance("broken-default"));
    }

    #[test]
    fn test_list_skips_unreadable() {
        let (_tmp, datadir) = open_datadir();
        datadir.init_instance(&make_state("good")).unwrap();

        let broken = datadir.instance_dir("broken-default");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join(STATE_FILE), "{ not json").unwrap();

        let instances = datadir.list_instances().unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].name, "good");
    }

    #[test]
    fn test_remove_instance() {
        let (_tmp, datadir) = open_datadir();
        datadir.init_instance(&make_state("mock-avs")).unwrap();
        datadir.remove_instance("mock-avs-default").unwrap();
        assert!(!datadir.has_instance("mock-avs-default"));
        assert!(!datadir.instance_dir("mock-avs-default").exists());
    }

    #[test]
    fn test_remove_missing_instance_fails() {
        let (_tmp, datadir) = open_datadir();
        assert!(matches!(
            datadir.remove_instance("ghost-default"),
            Err(CoreError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_temp_lifecycle() {
        let (_tmp, datadir) = open_datadir();
        let key = "a".repeat(64);

        assert!(!datadir.has_temp(&key));
        assert!(matches!(
            datadir.temp_path(&key),
            Err(CoreError::TempNotFound(_))
        ));

        let path = datadir.init_temp(&key).unwrap();
        assert!(path.is_dir());
        // init is idempotent
        assert_eq!(datadir.init_temp(&key).unwrap(), path);
        assert_eq!(datadir.temp_path(&key).unwrap(), path);

        datadir.remove_temp(&key).unwrap();
        assert!(!datadir.has_temp(&key));
        // removing again is a no-op
        datadir.remove_temp(&key).unwrap();
    }

    #[test]
    fn test_setup_materializes_instance_files() {
        let (_tmp, datadir) = open_datadir();
        datadir.init_instance(&make_state("mock-avs")).unwrap();

        let profile_src = tempfile::tempdir().unwrap();
        fs::write(
            profile_src.path().join(COMPOSE_FILE),
            "services:\n  node:\n    image: busybox\n",
        )
        .unwrap();
        fs::write(profile_src.path().join("profile.yml"), "options: []\n").unwrap();

        let mut env = BTreeMap::new();
        env.insert("MAIN_PORT".to_string(), "8080".to_string());
        env.insert("NETWORK".to_string(), "holesky".to_string());

        datadir
            .setup("mock-avs-default", &env, profile_src.path())
            .unwrap();

        let dir = datadir.instance_dir("mock-avs-default");
        assert!(dir.join(COMPOSE_FILE).exists());
        assert!(dir.join("profile").join("profile.yml").exists());

        let env_content = fs::read_to_string(dir.join(ENV_FILE)).unwrap();
        assert_eq!(env_content, "MAIN_PORT=8080\nNETWORK=holesky\n");
    }

    #[test]
    fn test_setup_requires_compose_file() {
        let (_tmp, datadir) = open_datadir();
        datadir.init_instance(&make_state("mock-avs")).unwrap();
        let profile_src = tempfile::tempdir().unwrap();

        let result = datadir.setup("mock-avs-default", &BTreeMap::new(), profile_src.path());
        assert!(matches!(result, Err(CoreError::PackageFileNotFound(_))));
    }
}
