//! Update operations: pull-update, option merging and the compensating
//! rollback path

use super::{InstallRequest, NodeManager, PullRef};
use crate::datadir::ENV_FILE;
use crate::package::PROFILE_FILE;
use crate::{CoreError, InstanceState, Result};
use avsctl_config::{merge_options, MergedOptions, NodeOption, Profile, ProfileSpec};
use std::collections::HashMap;

/// Result of pulling an update target and merging options against the
/// installed instance
#[derive(Debug, Clone)]
pub struct PullUpdateResult {
    pub instance_id: String,
    pub old_version: String,
    pub new_version: String,
    pub commit: String,
    pub merged: MergedOptions,
}

/// Parameters of a full update run
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub instance_id: String,
    pub reference: PullRef,
    /// Take a backup before uninstalling, and restore it if the new
    /// install fails
    pub backup: bool,
    /// Explicit option overrides applied on top of the merge
    pub option_values: Vec<(String, String)>,
    pub run_after: bool,
}

/// What an update did
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub instance_id: String,
    pub old_version: String,
    pub new_version: String,
    pub backup_id: Option<String>,
    /// Names of options that no longer exist in the new version
    pub deprecated: Vec<String>,
}

impl NodeManager {
    /// Pull the target revision of an installed instance's package and
    /// compute the merged option set. Refuses a target identical to what
    /// is already installed.
    pub async fn pull_update(&self, id: &str, reference: PullRef) -> Result<PullUpdateResult> {
        let state = self.datadir().instance(id)?;

        let pulled = self.pull(&state.url, reference.clone(), false).await?;

        // Version-pinned targets compare versions; commit-pinned targets
        // carry a synthetic version and compare commits instead
        let already_installed = match reference {
            PullRef::Commit(_) => pulled.commit == state.commit,
            _ => pulled.version == state.version,
        };
        if already_installed {
            return Err(CoreError::VersionAlreadyInstalled {
                instance: id.to_string(),
                version: state.version,
            });
        }

        self.check_upgrade_path(&state, &pulled.version)?;

        let new_profile = pulled.profile(&state.profile)?;
        let old_options = self.installed_options(&state)?;
        let merged = merge_options(&old_options, &new_profile.options);

        Ok(PullUpdateResult {
            instance_id: id.to_string(),
            old_version: state.version,
            new_version: pulled.version,
            commit: pulled.commit,
            merged,
        })
    }

    /// Full update state machine: pull-update, optional backup,
    /// uninstall, install, optional run. When a backup was taken and the
    /// uninstall or the new install fails, the backup is restored
    /// (stopped) as a best-effort compensation and the original error
    /// surfaces.
    pub async fn update(&self, request: UpdateRequest) -> Result<UpdateOutcome> {
        let pulled = self
            .pull_update(&request.instance_id, request.reference.clone())
            .await?;
        let state = self.datadir().instance(&request.instance_id)?;

        let mut options = pulled.merged.options.clone();
        apply_option_values(&mut options, &request.option_values)?;
        for option in options.iter_mut() {
            if !option.is_set() {
                option.set_default()?;
            }
        }

        let backup_id = if request.backup {
            Some(self.backup(&request.instance_id).await?)
        } else {
            None
        };

        let install_request = InstallRequest {
            url: state.url.clone(),
            version: pulled.new_version.clone(),
            commit: pulled.commit.clone(),
            profile: state.profile.clone(),
            tag: state.tag.clone(),
            options,
        };

        if let Err(e) = self.uninstall(&request.instance_id).await {
            return Err(self.rollback_or(e, backup_id.as_deref()).await);
        }

        let new_id = match self.install(install_request).await {
            Ok(id) => id,
            Err(e) => return Err(self.rollback_or(e, backup_id.as_deref()).await),
        };

        if request.run_after {
            self.run(&new_id).await?;
        }

        Ok(UpdateOutcome {
            instance_id: new_id,
            old_version: pulled.old_version,
            new_version: pulled.new_version,
            backup_id,
            deprecated: pulled
                .merged
                .deprecated
                .iter()
                .map(|o| o.name().to_string())
                .collect(),
        })
    }

    /// Enforce the manifest's upgrade matrix: when the target version has
    /// an entry, the installed version must be listed in it
    fn check_upgrade_path(&self, state: &InstanceState, new_version: &str) -> Result<()> {
        let key = crate::temp_key(&state.url);
        let package = crate::Package::open(self.datadir().temp_path(&key)?);
        let manifest = package.manifest()?;

        if let Some(allowed) = manifest
            .upgrade
            .as_ref()
            .and_then(|matrix| matrix.get(new_version))
        {
            if !allowed.iter().any(|v| v == &state.version) {
                return Err(CoreError::UpgradeNotSupported {
                    from: state.version.clone(),
                    to: new_version.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Restore the pre-update backup if one was taken. The original
    /// error always surfaces; a failed restore is reported alongside it.
    async fn rollback_or(&self, original: CoreError, backup_id: Option<&str>) -> CoreError {
        let Some(backup_id) = backup_id else {
            return original;
        };

        tracing::warn!("update failed, restoring backup {}: {}", backup_id, original);
        match self.restore(backup_id, false).await {
            Ok(_) => original,
            Err(restore) => CoreError::RestoreAfterFailure {
                original: Box::new(original),
                restore: Box::new(restore),
            },
        }
    }

    /// Reconstruct the installed instance's options: the profile
    /// descriptor that was copied into the instance directory, with
    /// values filled in from the rendered `.env`
    pub(crate) fn installed_options(&self, state: &InstanceState) -> Result<Vec<NodeOption>> {
        let id = state.id();
        let dir = self.datadir().instance_dir(&id);

        let spec = ProfileSpec::load(&dir.join("profile").join(PROFILE_FILE))?;
        let profile = Profile::from_spec(&state.profile, spec)?;

        let env = read_env_file(&dir.join(ENV_FILE))?;
        let mut options = profile.options;
        for option in options.iter_mut() {
            if let Some(value) = env.get(option.target()) {
                if let Err(e) = option.set(value) {
                    tracing::debug!("stored value for {} no longer validates: {}", option.name(), e);
                }
            }
        }
        Ok(options)
    }
}

/// Apply explicit `name=value` overrides onto an option list
pub fn apply_option_values(
    options: &mut [NodeOption],
    values: &[(String, String)],
) -> Result<()> {
    for (name, value) in values {
        let option = options
            .iter_mut()
            .find(|o| o.name() == name)
            .ok_or_else(|| CoreError::InvalidState(format!("unknown option '{}'", name)))?;
        option.set(value)?;
    }
    Ok(())
}

/// Parse a rendered `KEY=VALUE` env file
fn read_env_file(path: &std::path::Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    let mut env = HashMap::new();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }
    Ok(env)
}
