//! Profile store: an immutable, in-memory view of named profiles loaded from
//! the conventional `~/.aws/config` and `~/.aws/credentials` files.
//!
//! Grounded in the teacher's `load_profiles_from_dir`, generalized to also
//! read a `protected` flag and a `role_session_name`, and to use the `ini`
//! crate instead of a hand-rolled parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ini::Ini;

/// The profile name used when no profile is specified.
pub const DEFAULT_PROFILE: &str = "default";

/// An immutable record describing one named profile.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Profile {
    pub name: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub region: String,
    pub mfa_serial: Option<String>,
    pub role_arn: Option<String>,
    pub source_profile: Option<String>,
    pub role_session_name: String,
    pub protected: bool,
}

impl Profile {
    pub fn is_role(&self) -> bool {
        self.role_arn.is_some()
    }

    pub fn is_static(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }

    pub fn requires_mfa(&self) -> bool {
        self.mfa_serial.is_some()
    }
}

/// Immutable collection of profiles keyed by name.
#[derive(Debug, Default, Clone)]
pub struct ProfileStore {
    profiles: HashMap<String, Profile>,
}

impl ProfileStore {
    pub fn new(profiles: HashMap<String, Profile>) -> Self {
        Self { profiles }
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.profiles.contains_key(name)
    }

    /// Snapshot of profile names, sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Profile)> {
        self.profiles.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }
}

/// Resolves the AWS configuration directory: an explicit override first, then
/// `AWS_SHARED_CREDENTIALS_DIR`, then `~/.aws`.
pub fn resolve_aws_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var("AWS_SHARED_CREDENTIALS_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".aws"))
}

/// Loads profiles from the default `~/.aws` directory.
pub fn load_profiles() -> Result<ProfileStore> {
    load_profiles_from_dir(&resolve_aws_dir(None)?)
}

/// Loads profiles from `config` and `credentials` files under `aws_dir`, merging
/// fields keyed by profile name the way the AWS CLI does.
pub fn load_profiles_from_dir(aws_dir: &Path) -> Result<ProfileStore> {
    let mut profiles: HashMap<String, Profile> = HashMap::new();

    let config_path = aws_dir.join("config");
    if config_path.exists() {
        let ini = Ini::load_from_file(&config_path)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;
        for (section, props) in ini.iter() {
            let Some(section) = section else { continue };
            let profile_name = section
                .strip_prefix("profile ")
                .unwrap_or(section)
                .to_string();
            let entry = profiles.entry(profile_name.clone()).or_insert_with(|| Profile {
                name: profile_name.clone(),
                role_session_name: format!("imsd-{profile_name}"),
                ..Default::default()
            });
            if let Some(v) = props.get("region") {
                entry.region = v.to_string();
            }
            if let Some(v) = props.get("role_arn") {
                entry.role_arn = Some(v.to_string());
            }
            if let Some(v) = props.get("source_profile") {
                entry.source_profile = Some(v.to_string());
            }
            if let Some(v) = props.get("mfa_serial") {
                entry.mfa_serial = Some(v.to_string());
            }
            if let Some(v) = props.get("role_session_name") {
                entry.role_session_name = v.to_string();
            }
            if let Some(v) = props.get("protected") {
                entry.protected = v.eq_ignore_ascii_case("true") || v == "1";
            }
        }
    }

    let creds_path = aws_dir.join("credentials");
    if creds_path.exists() {
        let ini = Ini::load_from_file(&creds_path)
            .with_context(|| format!("failed to parse {}", creds_path.display()))?;
        for (section, props) in ini.iter() {
            let Some(section) = section else { continue };
            let profile_name = section.to_string();
            let entry = profiles.entry(profile_name.clone()).or_insert_with(|| Profile {
                name: profile_name.clone(),
                role_session_name: format!("imsd-{profile_name}"),
                ..Default::default()
            });
            if let Some(v) = props.get("aws_access_key_id") {
                entry.access_key_id = Some(v.to_string());
            }
            if let Some(v) = props.get("aws_secret_access_key") {
                entry.secret_access_key = Some(v.to_string());
            }
            if let Some(v) = props.get("aws_session_token") {
                entry.session_token = Some(v.to_string());
            }
        }
    }

    Ok(ProfileStore::new(profiles))
}
