//! Resolution of the on-disk config file path and the `orc init` command
//! (§4.9, §4.10). `KernelConfig` itself already knows how to load a TOML
//! file and overlay environment variables (`orc-core::config`); this
//! module only adds the CLI-flag layer and the one-shot init/write path,
//! mirroring the shape of the teacher's own `config.rs`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use orc_core::config::KernelConfig;

/// Resolve the config file path: `--config` flag, then
/// `KernelConfig::default_path()`.
pub fn config_path(cli_override: Option<&str>) -> PathBuf {
    cli_override
        .map(PathBuf::from)
        .unwrap_or_else(KernelConfig::default_path)
}

/// Load the kernel config through the full chain (CLI flag > env >
/// on-disk TOML > compiled default), then apply the `--data-dir`
/// override last so it always wins regardless of what's on disk.
pub fn resolve(cli_config_path: Option<&str>, cli_data_dir: Option<&str>) -> Result<KernelConfig> {
    let path = config_path(cli_config_path);
    let mut config = KernelConfig::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    if let Some(dir) = cli_data_dir {
        config.data_root = PathBuf::from(dir);
    }
    Ok(config)
}

/// `orc init`: write a fresh config file with a generated secret. Never
/// overwrites an existing file without `force` (§4.10).
pub fn init(path: &Path, data_root: Option<&str>, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut config = KernelConfig::default();
    if let Some(dir) = data_root {
        config.data_root = PathBuf::from(dir);
    }
    config.secret_hex = Some(KernelConfig::generate_secret());

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }

    let contents = toml::to_string_pretty(&config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    println!("Config written to {}", path.display());
    println!("  data_root = {}", config.data_root.display());
    println!("Next: run `orc project create` to register a repository.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        init(&path, Some("/tmp/orc-data"), false).unwrap();
        let err = init(&path, Some("/tmp/orc-data"), false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_force_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        init(&path, Some("/tmp/orc-data"), false).unwrap();
        init(&path, Some("/tmp/orc-data-2"), true).unwrap();
        let loaded = KernelConfig::load(&path).unwrap();
        assert_eq!(loaded.data_root, PathBuf::from("/tmp/orc-data-2"));
    }

    #[test]
    fn init_writes_a_fresh_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        init(&path, None, false).unwrap();
        let loaded = KernelConfig::load(&path).unwrap();
        assert!(loaded.secret_hex.is_some());
    }
}
