//! Host-environment guard: detects and repairs conflicts between this daemon
//! and ambient cloud-SDK configuration (environment variables, `~/.aws/config`,
//! `~/.aws/credentials`) on the user's machine.
//!
//! Grounded in the teacher's `aws_dir`/environment-precedence logic in
//! `run_aws_child_capture` (region/profile env-var precedence) and in the
//! original source's `config.go` `checkActiveAWSConfig` walk, generalized
//! into a priority-ordered check plus a fix/restore pair.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// The first offending ambient condition found, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostConfigConflict {
    ActiveAwsEnvironment,
    ActiveAwsCredentialsFile,
    ActiveAwsConfigFile,
    ForeignFile(PathBuf),
}

impl std::fmt::Display for HostConfigConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostConfigConflict::ActiveAwsEnvironment => write!(f, "active AWS environment variables"),
            HostConfigConflict::ActiveAwsCredentialsFile => write!(f, "active AWS credentials file"),
            HostConfigConflict::ActiveAwsConfigFile => write!(f, "active AWS config file"),
            HostConfigConflict::ForeignFile(p) => write!(f, "file not written by this daemon: {}", p.display()),
        }
    }
}

/// Marker line this daemon stamps at the end of every file it writes, so the
/// guard can tell its own output apart from a user's pre-existing config.
pub const MARKER_LINE: &str = "# written by imsd, do not edit by hand";

const AMBIENT_ENV_VARS: [&str; 3] = ["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY", "AWS_SESSION_TOKEN"];

pub struct HostEnvironmentGuard {
    aws_dir: PathBuf,
}

impl HostEnvironmentGuard {
    pub fn new(aws_dir: PathBuf) -> Self {
        Self { aws_dir }
    }

    pub fn for_home() -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(Self::new(home.join(".aws")))
    }

    fn config_path(&self) -> PathBuf {
        self.aws_dir.join("config")
    }

    fn credentials_path(&self) -> PathBuf {
        self.aws_dir.join("credentials")
    }

    /// Returns the first offending condition, in priority order, or `None` if clean.
    pub fn check(&self) -> Option<HostConfigConflict> {
        if active_aws_environment() {
            return Some(HostConfigConflict::ActiveAwsEnvironment);
        }
        if self.credentials_path().exists() && has_identity_pair(&self.credentials_path()) {
            return Some(HostConfigConflict::ActiveAwsCredentialsFile);
        }
        if self.config_path().exists() && has_identity_pair(&self.config_path()) {
            return Some(HostConfigConflict::ActiveAwsConfigFile);
        }
        for path in [self.config_path(), self.credentials_path()] {
            if path.exists() && !written_by_us(&path) {
                return Some(HostConfigConflict::ForeignFile(path));
            }
        }
        None
    }

    /// Renames conflicting files aside with a fixed prefix and returns the shell
    /// commands the operator should run to unset conflicting environment variables.
    pub fn fix(&self) -> Result<Vec<String>> {
        std::fs::create_dir_all(&self.aws_dir).ok();
        for path in [self.config_path(), self.credentials_path()] {
            if path.exists() && !written_by_us(&path) {
                let backup = backup_path(&path);
                std::fs::rename(&path, &backup)
                    .with_context(|| format!("renaming {} aside", path.display()))?;
            }
        }
        let mut commands = Vec::new();
        for var in AMBIENT_ENV_VARS {
            if std::env::var(var).is_ok() {
                commands.push(format!("unset {var}"));
            }
        }
        Ok(commands)
    }

    /// Reverses `fix`: moves a previously backed-up file back into place, if present.
    pub fn restore(&self) -> Result<()> {
        for path in [self.config_path(), self.credentials_path()] {
            let backup = backup_path(&path);
            if backup.exists() {
                std::fs::rename(&backup, &path)
                    .with_context(|| format!("restoring {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Writes a minimal marker-tagged config/credentials pair containing only
    /// the active region. Called after every successful `assume`; failures here
    /// are non-fatal to the caller.
    pub fn write_region(&self, region: &str) -> Result<()> {
        std::fs::create_dir_all(&self.aws_dir)?;
        let contents = format!("[default]\nregion = {region}\n{MARKER_LINE}\n");
        for path in [self.config_path(), self.credentials_path()] {
            if path.exists() && !written_by_us(&path) {
                anyhow::bail!("refusing to overwrite {}: not written by this daemon", path.display());
            }
            write_with_mode(&path, &contents)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn write_with_mode(path: &Path, contents: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_with_mode(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("opening {}", path.display()))
}

fn backup_path(path: &Path) -> PathBuf {
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!("imsd-backup-{file_name}"))
}

fn active_aws_environment() -> bool {
    AMBIENT_ENV_VARS
        .iter()
        .take(2) // key id + secret key identify "active" per spec; session token alone does not
        .any(|var| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false))
}

fn has_identity_pair(path: &Path) -> bool {
    let Ok(ini) = ini::Ini::load_from_file(path) else {
        return false;
    };
    ini.iter().any(|(_, props)| {
        props.get("aws_access_key_id").is_some() && props.get("aws_secret_access_key").is_some()
    })
}

fn written_by_us(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .map(|content| content.lines().any(|l| l.trim() == MARKER_LINE))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn detects_active_environment_with_no_config_files() {
        std::env::set_var("AWS_ACCESS_KEY_ID", "AKIAFAKE");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "secret");
        let td = tempdir().unwrap();
        let guard = HostEnvironmentGuard::new(td.path().to_path_buf());
        assert_eq!(guard.check(), Some(HostConfigConflict::ActiveAwsEnvironment));
        std::env::remove_var("AWS_ACCESS_KEY_ID");
        std::env::remove_var("AWS_SECRET_ACCESS_KEY");
    }

    #[test]
    #[serial]
    fn clean_directory_has_no_conflict() {
        let td = tempdir().unwrap();
        let guard = HostEnvironmentGuard::new(td.path().to_path_buf());
        assert_eq!(guard.check(), None);
    }

    #[test]
    #[serial]
    fn write_region_then_check_is_clean_and_refuses_foreign_overwrite() {
        let td = tempdir().unwrap();
        let guard = HostEnvironmentGuard::new(td.path().to_path_buf());
        guard.write_region("eu-west-1").unwrap();
        assert_eq!(guard.check(), None);

        let contents = fs::read_to_string(td.path().join("config")).unwrap();
        assert!(contents.contains("region = eu-west-1"));
        assert!(contents.contains(MARKER_LINE));

        // A foreign file without the marker must not be silently overwritten.
        let foreign_dir = tempdir().unwrap();
        fs::write(foreign_dir.path().join("config"), "[default]\nregion = us-east-1\n").unwrap();
        let foreign_guard = HostEnvironmentGuard::new(foreign_dir.path().to_path_buf());
        assert!(foreign_guard.write_region("eu-west-1").is_err());
    }

    #[test]
    #[serial]
    fn fix_renames_foreign_files_and_restore_reverses_it() {
        let td = tempdir().unwrap();
        fs::write(td.path().join("config"), "[default]\nregion = us-east-1\n").unwrap();
        let guard = HostEnvironmentGuard::new(td.path().to_path_buf());

        guard.fix().unwrap();
        assert!(!td.path().join("config").exists());
        assert!(td.path().join("imsd-backup-config").exists());

        guard.restore().unwrap();
        assert!(td.path().join("config").exists());
    }
}
