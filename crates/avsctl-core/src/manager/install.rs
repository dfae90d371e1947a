//! Pull and install operations

use super::NodeManager;
use crate::package::{is_commit_hash, is_version_tag, Package, LOCAL_VERSION};
use crate::{instance_id, name_from_url, temp_key, CoreError, InstanceState, Result};
use avsctl_config::{project_env, NodeOption, Profile};
use std::path::Path;

/// How a pull selects the package revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullRef {
    /// Highest semver tag
    Latest,
    /// A `v<MAJOR>.<MINOR>.<PATCH>` tag
    Version(String),
    /// A 40-hex commit
    Commit(String),
}

impl PullRef {
    /// Classify a user-supplied reference string
    pub fn parse(raw: &str) -> Result<Self> {
        if is_version_tag(raw) {
            Ok(Self::Version(raw.to_string()))
        } else if is_commit_hash(raw) {
            Ok(Self::Commit(raw.to_string()))
        } else {
            Err(CoreError::InvalidRef(raw.to_string()))
        }
    }
}

/// What a pull materialized: the verified package's identity and its
/// typed profiles
#[derive(Debug, Clone)]
pub struct PullResult {
    pub name: String,
    pub version: String,
    pub commit: String,
    pub profiles: Vec<Profile>,
    pub has_plugin: bool,
}

impl PullResult {
    pub fn profile(&self, name: &str) -> Result<&Profile> {
        self.profiles
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| CoreError::ProfileNotFound(name.to_string()))
    }
}

/// Everything an install needs; the temp entry for `url` must already be
/// materialized by a pull
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub url: String,
    pub version: String,
    pub commit: String,
    pub profile: String,
    pub tag: String,
    /// Fully-set options; projection fails on any unset one
    pub options: Vec<NodeOption>,
}

impl NodeManager {
    /// Fetch a package into the temp arena, pin it to the requested
    /// revision and verify it. `force` wipes an existing temp entry;
    /// otherwise a previous pull of the same URL is reused.
    pub async fn pull(&self, url: &str, reference: PullRef, force: bool) -> Result<PullResult> {
        let name = name_from_url(url)?;
        let key = temp_key(url);

        if force && self.datadir().has_temp(&key) {
            self.datadir().remove_temp(&key)?;
        }

        let package = if self.datadir().has_temp(&key) {
            Package::open(self.datadir().temp_path(&key)?)
        } else {
            let dest = self.datadir().init_temp(&key)?;
            match Package::from_url(&dest, url).await {
                Ok(package) => package,
                Err(e) => {
                    let _ = self.datadir().remove_temp(&key);
                    return Err(e);
                }
            }
        };

        match self.pin_and_verify(&package, reference).await {
            Ok(result) => Ok(result),
            Err(e) => {
                let _ = self.datadir().remove_temp(&key);
                Err(e)
            }
        }
    }

    async fn pin_and_verify(&self, package: &Package, reference: PullRef) -> Result<PullResult> {
        let (version, checkout_ref) = match reference {
            PullRef::Latest => {
                let version = package.latest_version().await?;
                (version.clone(), version)
            }
            PullRef::Version(version) => (version.clone(), version),
            // Commits do not map onto a tag; the synthetic version marks
            // the pin as commit-based
            PullRef::Commit(commit) => (LOCAL_VERSION.to_string(), commit),
        };

        if package.is_git() {
            package.checkout(&checkout_ref).await?;
        }
        package.check()?;

        let manifest = package.manifest()?;
        Ok(PullResult {
            name: manifest.name,
            version,
            commit: package.current_commit().await?,
            profiles: package.profiles()?,
            has_plugin: package.has_plugin()?,
        })
    }

    /// Install a pulled package as a new instance.
    ///
    /// 1. The temp entry for the URL must exist
    /// 2. The derived instance id must be free
    /// 3. Re-pin, type the profile, project options to env
    /// 4. Create the instance directory and materialize its files
    /// 5. Create and start the compose stack (with build)
    /// 6. Register monitoring targets
    /// 7. Consume the temp entry
    ///
    /// Any failure after step 4 rolls the world back to the pre-call
    /// state: targets deregistered, instance directory removed, temp
    /// entry removed.
    pub async fn install(&self, request: InstallRequest) -> Result<String> {
        self.require_runtime()?;

        let key = temp_key(&request.url);
        let temp = self
            .datadir()
            .temp_path(&key)
            .map_err(|_| CoreError::TempNotFound(request.url.clone()))?;

        let name = name_from_url(&request.url)?;
        let id = instance_id(&name, &request.tag);
        if self.datadir().has_instance(&id) {
            return Err(CoreError::InstanceExists(id));
        }

        let package = Package::open(&temp);
        if package.is_git() {
            if is_version_tag(&request.version) && package.has_version(&request.version).await? {
                package.checkout(&request.version).await?;
            } else if is_commit_hash(&request.commit) {
                package.checkout(&request.commit).await?;
            } else {
                return Err(CoreError::InvalidRef(request.version.clone()));
            }
        }

        let commit = package.current_commit().await?;
        let profile = self.select_profile(&package, &request.profile)?;
        let env = project_env(&request.options)?;

        let state = InstanceState {
            name,
            tag: request.tag.clone(),
            url: request.url.clone(),
            version: request.version.clone(),
            commit,
            profile: profile.name.clone(),
            monitoring_targets: profile.monitoring_targets.clone(),
            api_target: profile.api.clone(),
            plugin: profile.plugin.clone(),
        };

        self.datadir().init_instance(&state)?;

        let profile_dir = package.profile_dir(&profile.name);
        match self
            .finish_install(&state, &env, &profile_dir, &key)
            .await
        {
            Ok(()) => {
                tracing::info!("installed {} at {}", id, request.version);
                Ok(id)
            }
            Err(e) => {
                tracing::warn!("install of {} failed, cleaning up: {}", id, e);
                self.install_cleanup(&id, &key).await;
                Err(e)
            }
        }
    }

    /// Install a package from a local directory tree. Local installs
    /// carry a synthetic version and a zero commit.
    pub async fn local_install(&self, request: LocalInstallRequest) -> Result<String> {
        self.require_runtime()?;

        let src = std::fs::canonicalize(&request.path)?;
        let key = temp_key(&src.to_string_lossy());

        // Local trees are cheap; always take a fresh copy
        self.datadir().remove_temp(&key)?;
        let dest = self.datadir().init_temp(&key)?;
        let package = match Package::from_local(&dest, &src) {
            Ok(package) => package,
            Err(e) => {
                let _ = self.datadir().remove_temp(&key);
                return Err(e);
            }
        };
        package.check()?;

        let manifest = package.manifest()?;
        let name = request.name.unwrap_or(manifest.name);
        let id = instance_id(&name, &request.tag);
        if self.datadir().has_instance(&id) {
            return Err(CoreError::InstanceExists(id));
        }

        let profile = self.select_profile(&package, &request.profile)?;
        let env = project_env(&request.options)?;

        let state = InstanceState {
            name,
            tag: request.tag.clone(),
            url: src.to_string_lossy().to_string(),
            version: LOCAL_VERSION.to_string(),
            commit: "0".repeat(40),
            profile: profile.name.clone(),
            monitoring_targets: profile.monitoring_targets.clone(),
            api_target: profile.api.clone(),
            plugin: profile.plugin.clone(),
        };

        self.datadir().init_instance(&state)?;

        let profile_dir = package.profile_dir(&profile.name);
        match self
            .finish_install(&state, &env, &profile_dir, &key)
            .await
        {
            Ok(()) => {
                tracing::info!("installed {} from {}", id, src.display());
                Ok(id)
            }
            Err(e) => {
                self.install_cleanup(&id, &key).await;
                Err(e)
            }
        }
    }

    fn select_profile(&self, package: &Package, name: &str) -> Result<Profile> {
        let profile = package
            .profiles()?
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| CoreError::ProfileNotFound(name.to_string()))?;
        if let Some(ref plugin) = profile.plugin {
            plugin.validate()?;
        }
        Ok(profile)
    }

    /// Steps 4b-7 of install; the instance directory already exists
    async fn finish_install(
        &self,
        state: &InstanceState,
        env: &std::collections::BTreeMap<String, String>,
        profile_dir: &Path,
        key: &str,
    ) -> Result<()> {
        let runtime = self.require_runtime()?;
        let id = state.id();

        self.datadir().setup(&id, env, profile_dir)?;

        let compose = self.datadir().compose_path(&id);
        runtime.compose_create(&compose, true).await?;
        runtime.compose_up(&compose).await?;

        self.register_instance_targets(state).await?;

        self.datadir().remove_temp(key)?;
        Ok(())
    }

    /// Compensating cleanup after a failed install: the observable effect
    /// of the failed call must be a no-op on persisted state
    async fn install_cleanup(&self, id: &str, key: &str) {
        self.deregister_instance_targets(id).await;

        if let Ok(runtime) = self.require_runtime() {
            let compose = self.datadir().compose_path(id);
            if compose.exists() {
                if let Err(e) = runtime.compose_down(&compose, true).await {
                    tracing::warn!("compose down during install cleanup of {}: {}", id, e);
                }
            }
        }

        if let Err(e) = self.datadir().remove_instance(id) {
            tracing::warn!("removing instance dir during install cleanup of {}: {}", id, e);
        }
        if let Err(e) = self.datadir().remove_temp(key) {
            tracing::warn!("removing temp entry during install cleanup of {}: {}", id, e);
        }
    }
}

/// Everything a local install needs
#[derive(Debug, Clone)]
pub struct LocalInstallRequest {
    pub path: std::path::PathBuf,
    /// Instance name override; defaults to the manifest name
    pub name: Option<String>,
    pub profile: String,
    pub tag: String,
    pub options: Vec<NodeOption>,
}
