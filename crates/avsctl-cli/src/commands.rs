//! CLI command implementations

use anyhow::{bail, Context, Result};
use avsctl_core::{
    apply_option_values, InstallRequest, LocalInstallRequest, NodeManager, PluginRunOptions,
    PullRef, PullResult, UpdateRequest,
};
use avsctl_config::NodeOption;
use avsctl_provider::{LogOptions, VolumeBind};
use std::path::PathBuf;
use tokio::sync::watch;

/// Install a package from a repository URL
pub async fn install(
    manager: &NodeManager,
    url: &str,
    version: Option<String>,
    profile: Option<String>,
    tag: &str,
    run: bool,
    option_values: Vec<(String, String)>,
) -> Result<()> {
    let reference = match version {
        Some(ref v) => PullRef::parse(v)?,
        None => PullRef::Latest,
    };

    let pulled = manager.pull(url, reference, true).await?;
    println!("Pulled {} {} ({})", pulled.name, pulled.version, &pulled.commit[..12.min(pulled.commit.len())]);

    let profile_name = select_profile_name(&pulled, profile)?;
    let selected = pulled.profile(&profile_name)?;
    print_hardware_requirements(selected);
    let options = resolve_options(selected.options.clone(), &option_values)?;

    let id = manager
        .install(InstallRequest {
            url: url.to_string(),
            version: pulled.version.clone(),
            commit: pulled.commit.clone(),
            profile: profile_name,
            tag: tag.to_string(),
            options,
        })
        .await?;
    println!("Installed {}", id);

    if run {
        manager.run(&id).await?;
        println!("Started {}", id);
    }
    Ok(())
}

/// Install a package from a local directory
pub async fn local_install(
    manager: &NodeManager,
    path: PathBuf,
    name: Option<String>,
    profile: Option<String>,
    tag: &str,
    option_values: Vec<(String, String)>,
) -> Result<()> {
    let profile_name = profile.context("local-install requires --profile")?;

    // Type the options straight from the source tree so values can be
    // validated before anything is copied
    let package = avsctl_core::Package::open(&path);
    let typed = package
        .profiles()?
        .into_iter()
        .find(|p| p.name == profile_name)
        .with_context(|| format!("profile '{}' not found in {}", profile_name, path.display()))?;
    let options = resolve_options(typed.options, &option_values)?;

    let id = manager
        .local_install(LocalInstallRequest {
            path,
            name,
            profile: profile_name,
            tag: tag.to_string(),
            options,
        })
        .await?;
    println!("Installed {}", id);
    Ok(())
}

/// Update an instance to a new version or commit
pub async fn update(
    manager: &NodeManager,
    instance_id: &str,
    reference: Option<String>,
    backup: bool,
    run: bool,
    option_values: Vec<(String, String)>,
) -> Result<()> {
    let reference = match reference {
        Some(ref raw) => PullRef::parse(raw)?,
        None => PullRef::Latest,
    };

    let outcome = manager
        .update(UpdateRequest {
            instance_id: instance_id.to_string(),
            reference,
            backup,
            option_values,
            run_after: run,
        })
        .await?;

    for name in &outcome.deprecated {
        println!("Option '{}' is deprecated in {}", name, outcome.new_version);
    }
    if let Some(ref backup_id) = outcome.backup_id {
        println!("Backed up as {}", backup_id);
    }
    println!(
        "Updated {} from {} to {}",
        outcome.instance_id, outcome.old_version, outcome.new_version
    );
    Ok(())
}

/// List installed instances
pub async fn ls(manager: &NodeManager) -> Result<()> {
    if let Some(error) = manager.connection_error() {
        tracing::warn!("runtime unavailable, liveness not reported: {}", error);
    }

    let summaries = manager.list_instances().await?;
    println!(
        "{:<28} {:<10} {:<14} {:<16} {:<8} {}",
        "ID", "VERSION", "COMMIT", "PROFILE", "RUNNING", "HEALTH"
    );
    for summary in summaries {
        println!(
            "{:<28} {:<10} {:<14} {:<16} {:<8} {}",
            summary.id,
            summary.version,
            &summary.commit[..12.min(summary.commit.len())],
            summary.profile,
            summary.running,
            summary.health
        );
    }
    Ok(())
}

/// Stream an instance's merged logs
pub async fn logs(
    manager: &NodeManager,
    instance_id: &str,
    follow: bool,
    since: Option<String>,
    until: Option<String>,
    timestamps: bool,
    tail: Option<String>,
) -> Result<()> {
    let opts = LogOptions {
        follow,
        tail,
        since: since.as_deref().map(parse_time).transpose()?,
        until: until.as_deref().map(parse_time).transpose()?,
        timestamps,
    };

    let (tx, cancel) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(true);
    });

    let mut stdout = tokio::io::stdout();
    manager
        .node_logs(&mut stdout, instance_id, &opts, cancel)
        .await?;
    Ok(())
}

/// Run an instance's plugin
pub async fn plugin(
    manager: &NodeManager,
    instance_id: &str,
    args: Vec<String>,
    host: bool,
    no_rm_image: bool,
    volumes: Vec<String>,
) -> Result<()> {
    let binds = volumes
        .iter()
        .map(|v| v.parse::<VolumeBind>().map_err(anyhow::Error::msg))
        .collect::<Result<Vec<_>>>()?;

    let opts = PluginRunOptions {
        host_network: host,
        binds,
        no_destroy_image: no_rm_image,
    };

    let mut stdout = tokio::io::stdout();
    let exit = manager
        .run_plugin(instance_id, args, opts, &mut stdout)
        .await?;
    if exit != 0 {
        std::process::exit(exit as i32);
    }
    Ok(())
}

/// Back up an instance
pub async fn backup(manager: &NodeManager, instance_id: &str) -> Result<()> {
    let backup_id = manager.backup(instance_id).await?;
    println!("Backed up {} as {}", instance_id, backup_id);
    Ok(())
}

/// List backups, newest first
pub fn backup_ls(manager: &NodeManager) -> Result<()> {
    let backups = manager.backup_list()?;
    println!(
        "{:<18} {:<28} {:<10} {:<22} {}",
        "ID", "INSTANCE", "VERSION", "TIMESTAMP", "SIZE"
    );
    for info in backups {
        println!(
            "{:<18} {:<28} {:<10} {:<22} {}",
            info.id,
            info.instance_id,
            info.version,
            info.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            human_size(info.size_bytes)
        );
    }
    Ok(())
}

/// Restore an instance from a backup
pub async fn restore(manager: &NodeManager, backup_id: &str, run: bool) -> Result<()> {
    let instance_id = manager.restore(backup_id, run).await?;
    println!("Restored {}", instance_id);
    Ok(())
}

/// Start an instance
pub async fn run(manager: &NodeManager, instance_id: &str) -> Result<()> {
    manager.run(instance_id).await?;
    println!("Started {}", instance_id);
    Ok(())
}

/// Stop an instance
pub async fn stop(manager: &NodeManager, instance_id: &str) -> Result<()> {
    manager.stop(instance_id).await?;
    println!("Stopped {}", instance_id);
    Ok(())
}

/// Uninstall an instance
pub async fn uninstall(manager: &NodeManager, instance_id: &str) -> Result<()> {
    manager.uninstall(instance_id).await?;
    println!("Uninstalled {}", instance_id);
    Ok(())
}

/// Install and start the monitoring stack
pub async fn init_monitoring(manager: &NodeManager) -> Result<()> {
    manager.init_monitoring(true, true).await?;
    println!("Monitoring stack is up");
    Ok(())
}

/// Tear the monitoring stack down
pub async fn clean_monitoring(manager: &NodeManager) -> Result<()> {
    manager.clean_monitoring().await?;
    println!("Monitoring stack removed");
    Ok(())
}

/// Print the profile's advertised hardware requirements, if any.
/// Informational only; the host is not probed.
fn print_hardware_requirements(profile: &avsctl_config::Profile) {
    let Some(ref hw) = profile.hardware_requirements else {
        return;
    };
    let mut parts = Vec::new();
    if let Some(cores) = hw.cpu_cores {
        parts.push(format!("{} CPU cores", cores));
    }
    if let Some(memory) = hw.memory_mb {
        parts.push(format!("{} MB RAM", memory));
    }
    if let Some(disk) = hw.disk_space_gb {
        parts.push(format!("{} GB disk", disk));
    }
    if !parts.is_empty() {
        println!("Recommended hardware: {}", parts.join(", "));
    }
}

/// Pick the profile: explicit choice, or the package's only one
fn select_profile_name(pulled: &PullResult, explicit: Option<String>) -> Result<String> {
    match explicit {
        Some(name) => Ok(name),
        None => {
            if pulled.profiles.len() == 1 {
                Ok(pulled.profiles[0].name.clone())
            } else {
                let names: Vec<&str> =
                    pulled.profiles.iter().map(|p| p.name.as_str()).collect();
                bail!(
                    "package has {} profiles ({}); pass --profile",
                    pulled.profiles.len(),
                    names.join(", ")
                )
            }
        }
    }
}

/// Apply explicit values, then defaults, and require everything set
fn resolve_options(
    mut options: Vec<NodeOption>,
    values: &[(String, String)],
) -> Result<Vec<NodeOption>> {
    apply_option_values(&mut options, values)?;
    for option in options.iter_mut() {
        if !option.is_set() {
            option.set_default().with_context(|| {
                format!(
                    "option '{}' has no default; pass --option {}=<value>",
                    option.name(),
                    option.name()
                )
            })?;
        }
    }
    Ok(options)
}

/// Parse a unix timestamp or an RFC 3339 time
fn parse_time(raw: &str) -> Result<i64> {
    if let Ok(unix) = raw.parse::<i64>() {
        return Ok(unix);
    }
    let parsed = chrono::DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("'{}' is neither a unix timestamp nor RFC 3339", raw))?;
    Ok(parsed.timestamp())
}

/// Render a byte count for humans
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
