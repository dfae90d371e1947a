//! Package acquisition and verification
//!
//! A package is a git repository holding `pkg/manifest.yml`, a checksum
//! file and one directory per profile. It is cloned into the temp arena,
//! pinned to a version tag or commit, verified, and then consumed by
//! install or update.

use crate::datadir::copy_dir_recursive;
use crate::{CoreError, Result};
use avsctl_config::{HardwareRequirements, Manifest, PluginDef, Profile, ProfileSpec};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

pub const PKG_DIR: &str = "pkg";
pub const MANIFEST_FILE: &str = "manifest.yml";
pub const CHECKSUM_FILE: &str = "checksum.txt";
pub const PROFILE_FILE: &str = "profile.yml";

/// Synthetic pin recorded for packages that are not git checkouts
/// (local installs)
pub const LOCAL_VERSION: &str = "v0.0.0";

fn version_tag_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^v\d+\.\d+\.\d+$").unwrap())
}

fn commit_hash_regex() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"^[0-9a-f]{40}$").unwrap())
}

/// `v<MAJOR>.<MINOR>.<PATCH>`
pub fn is_version_tag(candidate: &str) -> bool {
    version_tag_regex().is_match(candidate)
}

/// 40 lowercase hex characters
pub fn is_commit_hash(candidate: &str) -> bool {
    commit_hash_regex().is_match(candidate)
}

/// A checked-out package working tree
#[derive(Debug, Clone)]
pub struct Package {
    root: PathBuf,
}

impl Package {
    /// Wrap an already-materialized working tree
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Clone a remote repository into `dest`
    pub async fn from_url(dest: &Path, url: &str) -> Result<Self> {
        let dest_str = dest.to_string_lossy();
        git(None, &["clone", url, dest_str.as_ref()]).await?;
        Ok(Self::open(dest))
    }

    /// Copy a local package tree into `dest`. Local packages carry no
    /// git history and skip version pinning.
    pub fn from_local(dest: &Path, src: &Path) -> Result<Self> {
        if !src.join(PKG_DIR).is_dir() {
            return Err(CoreError::PackageDirNotFound(src.join(PKG_DIR)));
        }
        copy_dir_recursive(src, dest)?;
        Ok(Self::open(dest))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the tree is a git checkout
    pub fn is_git(&self) -> bool {
        self.root.join(".git").exists()
    }

    /// Switch the working tree to a version tag or a commit hash.
    /// Anything else is rejected.
    pub async fn checkout(&self, reference: &str) -> Result<()> {
        if !is_version_tag(reference) && !is_commit_hash(reference) {
            return Err(CoreError::InvalidRef(reference.to_string()));
        }
        git(Some(&self.root), &["checkout", "--quiet", reference]).await?;
        Ok(())
    }

    /// The highest semantic-version tag in the repository
    pub async fn latest_version(&self) -> Result<String> {
        let raw = git(Some(&self.root), &["tag", "--list"]).await?;
        highest_version(raw.lines()).ok_or(CoreError::NoVersions)
    }

    /// Whether the repository carries the given version tag
    pub async fn has_version(&self, version: &str) -> Result<bool> {
        let raw = git(Some(&self.root), &["tag", "--list"]).await?;
        Ok(raw.lines().any(|tag| tag.trim() == version))
    }

    /// Commit hash of the current checkout; zeros for non-git trees
    pub async fn current_commit(&self) -> Result<String> {
        if !self.is_git() {
            return Ok("0".repeat(40));
        }
        let raw = git(Some(&self.root), &["rev-parse", "HEAD"]).await?;
        Ok(raw.trim().to_string())
    }

    /// Validate the package: required paths exist and, when a checksum
    /// file is present, the recorded hashes cover exactly the `pkg/`
    /// tree and all of them match.
    pub fn check(&self) -> Result<()> {
        let pkg = self.root.join(PKG_DIR);
        if !pkg.is_dir() {
            return Err(CoreError::PackageDirNotFound(pkg));
        }

        let manifest_path = pkg.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(CoreError::PackageFileNotFound(manifest_path));
        }

        let manifest = self.manifest()?;
        for profile in &manifest.profiles {
            let dir = pkg.join(profile);
            if !dir.is_dir() {
                return Err(CoreError::PackageDirNotFound(dir));
            }
            for required in [PROFILE_FILE, "docker-compose.yml"] {
                let file = dir.join(required);
                if !file.is_file() {
                    return Err(CoreError::PackageFileNotFound(file));
                }
            }
        }

        let checksum_path = self.root.join(CHECKSUM_FILE);
        if checksum_path.is_file() {
            self.verify_checksums(&checksum_path)?;
        }

        Ok(())
    }

    fn verify_checksums(&self, checksum_path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(checksum_path)?;
        let mut listed: BTreeMap<String, String> = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((hash, path)) = line.split_once(char::is_whitespace) else {
                return Err(CoreError::InvalidChecksum(format!(
                    "malformed line '{}'",
                    line
                )));
            };
            listed.insert(path.trim().to_string(), hash.to_string());
        }

        let mut present = Vec::new();
        collect_files(&self.root.join(PKG_DIR), &self.root, &mut present)?;

        for path in &present {
            match listed.remove(path) {
                None => {
                    return Err(CoreError::InvalidChecksum(format!(
                        "file '{}' is not listed",
                        path
                    )))
                }
                Some(expected) => {
                    let actual = sha256_file(&self.root.join(path))?;
                    if actual != expected {
                        return Err(CoreError::InvalidChecksum(format!(
                            "hash mismatch for '{}'",
                            path
                        )));
                    }
                }
            }
        }

        if let Some((path, _)) = listed.into_iter().next() {
            return Err(CoreError::InvalidChecksum(format!(
                "listed file '{}' is missing",
                path
            )));
        }

        Ok(())
    }

    /// Parse the package manifest
    pub fn manifest(&self) -> Result<Manifest> {
        Ok(Manifest::load(
            &self.root.join(PKG_DIR).join(MANIFEST_FILE),
        )?)
    }

    /// Directory of a profile's files
    pub fn profile_dir(&self, profile: &str) -> PathBuf {
        self.root.join(PKG_DIR).join(profile)
    }

    /// Parse every profile into its typed form, resolving the plugin and
    /// hardware-requirement fallbacks from the manifest
    pub fn profiles(&self) -> Result<Vec<Profile>> {
        let manifest = self.manifest()?;
        let shared_hardware = self.shared_hardware_requirements(&manifest)?;

        let mut profiles = Vec::with_capacity(manifest.profiles.len());
        for name in &manifest.profiles {
            let spec = ProfileSpec::load(&self.profile_dir(name).join(PROFILE_FILE))?;
            let mut profile = Profile::from_spec(name, spec)?;
            if profile.plugin.is_none() {
                profile.plugin = manifest.plugin.clone();
            }
            if profile.hardware_requirements.is_none() {
                profile.hardware_requirements = shared_hardware.clone();
            }
            profiles.push(profile);
        }
        Ok(profiles)
    }

    /// Package-level plugin declaration, validated
    pub fn plugin(&self) -> Result<Option<PluginDef>> {
        let manifest = self.manifest()?;
        if let Some(ref plugin) = manifest.plugin {
            plugin.validate()?;
        }
        Ok(manifest.plugin)
    }

    pub fn has_plugin(&self) -> Result<bool> {
        Ok(self.plugin()?.is_some())
    }

    fn shared_hardware_requirements(
        &self,
        manifest: &Manifest,
    ) -> Result<Option<HardwareRequirements>> {
        match manifest.hardware_requirements {
            Some(ref src) => {
                let path = self.root.join(src);
                if !path.is_file() {
                    return Err(CoreError::PackageFileNotFound(path));
                }
                Ok(Some(HardwareRequirements::load(&path)?))
            }
            None => Ok(None),
        }
    }
}

/// The highest `v<MAJOR>.<MINOR>.<PATCH>` tag among the candidates,
/// ordered semantically rather than lexically
pub fn highest_version<'a>(tags: impl Iterator<Item = &'a str>) -> Option<String> {
    tags.map(str::trim)
        .filter(|tag| is_version_tag(tag))
        .filter_map(|tag| semver::Version::parse(&tag[1..]).ok())
        .max()
        .map(|v| format!("v{}", v))
}

/// Run a git command and capture stdout
async fn git(dir: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    cmd.args(args);

    let verb = args.first().copied().unwrap_or("git").to_string();
    let output = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CoreError::Git {
            verb: verb.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(CoreError::Git {
            verb,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Collect every file below `dir` as a path relative to `base`, sorted
fn collect_files(dir: &Path, base: &Path, out: &mut Vec<String>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, base, out)?;
        } else {
            let rel = path
                .strip_prefix(base)
                .expect("walked path is below base")
                .to_string_lossy()
                .to_string();
            out.push(rel);
        }
    }
    Ok(())
}

/// SHA-256 of a file's contents, hex-encoded
fn sha256_file(path: &Path) -> Result<String> {
    let content = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(hex::encode(hasher.finalize()))
}
