//! STS adapter: an abstraction over the two remote calls the engine needs,
//! `GetSessionToken` and `AssumeRole`.
//!
//! Grounded in the teacher's `get_session_token`, `assume_role_with_profile`
//! and `assume_role_with_env` functions: the real adapter shells out to the
//! `aws` CLI via `tokio::process::Command` and parses the JSON it prints,
//! exactly the way the teacher's MVP does it, instead of linking a full STS
//! SDK client. Per spec this collaborator is treated as opaque.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::EngineError;
use crate::profile::Profile;

/// A short-lived `(accessKeyId, secretAccessKey, sessionToken, expiresAt, region)` tuple.
///
/// Value type: every field is an owned `String`/`DateTime`, so cloning is a deep
/// copy and callers may hold a snapshot across further engine mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub region: String,
}

#[derive(Debug, Deserialize)]
struct StsCredsWrapper {
    #[serde(rename = "Credentials")]
    credentials: StsCredentials,
}

#[derive(Debug, Deserialize)]
struct StsCredentials {
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "SessionToken")]
    session_token: String,
    #[serde(rename = "Expiration")]
    expiration: DateTime<Utc>,
}

const GET_SESSION_TOKEN_TIMEOUT: Duration = Duration::from_secs(30);
const ASSUME_ROLE_TIMEOUT: Duration = Duration::from_secs(30);
const SOURCE_SESSION_DURATION_SECONDS: &str = "36000";

/// The two STS calls the engine needs, with a uniform error classification:
/// callers pass whether an operator-supplied code was used so the adapter
/// can distinguish `Transient` from `Fatal` failures per spec §7.
#[async_trait]
pub trait StsAdapter: Send + Sync {
    async fn get_session_token(
        &self,
        profile: &Profile,
        code: Option<&str>,
    ) -> Result<SessionCredentials, EngineError>;

    async fn assume_role(
        &self,
        source: &SessionCredentials,
        role_arn: &str,
        session_name: &str,
        mfa_serial: Option<&str>,
        code: Option<&str>,
    ) -> Result<SessionCredentials, EngineError>;
}

/// Real adapter backed by the `aws` CLI binary.
pub struct CliStsAdapter;

impl CliStsAdapter {
    pub fn new() -> Self {
        Self
    }

    fn classify(used_code: bool, err: impl std::fmt::Display) -> EngineError {
        if used_code {
            EngineError::Fatal(err.to_string())
        } else {
            EngineError::Transient(err.to_string())
        }
    }
}

impl Default for CliStsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StsAdapter for CliStsAdapter {
    async fn get_session_token(
        &self,
        profile: &Profile,
        code: Option<&str>,
    ) -> Result<SessionCredentials, EngineError> {
        let used_code = code.map_or(false, |c| !c.is_empty());

        let mut cmd = Command::new("aws");
        cmd.env("AWS_ACCESS_KEY_ID", profile.access_key_id.clone().unwrap_or_default())
            .env("AWS_SECRET_ACCESS_KEY", profile.secret_access_key.clone().unwrap_or_default());
        if let Some(token) = &profile.session_token {
            cmd.env("AWS_SESSION_TOKEN", token);
        }
        cmd.arg("sts")
            .arg("get-session-token")
            .arg("--duration-seconds")
            .arg(SOURCE_SESSION_DURATION_SECONDS)
            .arg("--output")
            .arg("json");
        if let Some(serial) = &profile.mfa_serial {
            cmd.arg("--serial-number").arg(serial);
        }
        if let Some(code) = code.filter(|c| !c.is_empty()) {
            cmd.arg("--token-code").arg(code);
        }

        let output = timeout(GET_SESSION_TOKEN_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Self::classify(used_code, "get-session-token timed out"))?
            .map_err(|e| Self::classify(used_code, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::classify(used_code, stderr));
        }

        parse_creds(&output.stdout, &profile.region).map_err(|e| Self::classify(used_code, e))
    }

    async fn assume_role(
        &self,
        source: &SessionCredentials,
        role_arn: &str,
        session_name: &str,
        mfa_serial: Option<&str>,
        code: Option<&str>,
    ) -> Result<SessionCredentials, EngineError> {
        let used_code = code.map_or(false, |c| !c.is_empty());

        let mut cmd = Command::new("aws");
        cmd.env("AWS_ACCESS_KEY_ID", &source.access_key_id)
            .env("AWS_SECRET_ACCESS_KEY", &source.secret_access_key)
            .env("AWS_SESSION_TOKEN", &source.session_token)
            .arg("sts")
            .arg("assume-role")
            .arg("--role-arn")
            .arg(role_arn)
            .arg("--role-session-name")
            .arg(session_name)
            .arg("--output")
            .arg("json");
        if let Some(serial) = mfa_serial {
            cmd.arg("--serial-number").arg(serial);
            if let Some(code) = code.filter(|c| !c.is_empty()) {
                cmd.arg("--token-code").arg(code);
            }
        }

        let output = timeout(ASSUME_ROLE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Self::classify(used_code, "assume-role timed out"))?
            .map_err(|e| Self::classify(used_code, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::classify(used_code, stderr));
        }

        parse_creds(&output.stdout, &source.region).map_err(|e| Self::classify(used_code, e))
    }
}

fn parse_creds(stdout: &[u8], region: &str) -> Result<SessionCredentials, anyhow::Error> {
    let wrap: StsCredsWrapper = serde_json::from_slice(stdout)
        .map_err(|e| anyhow!("parsing STS JSON response failed: {e}"))?;
    Ok(SessionCredentials {
        access_key_id: wrap.credentials.access_key_id,
        secret_access_key: wrap.credentials.secret_access_key,
        session_token: wrap.credentials.session_token,
        expires_at: wrap.credentials.expiration,
        region: region.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sts_json_response() {
        let body = br#"{"Credentials":{"AccessKeyId":"AKIAFAKE","SecretAccessKey":"SECRET","SessionToken":"TOKEN","Expiration":"2030-01-01T00:00:00Z"}}"#;
        let creds = parse_creds(body, "eu-west-1").unwrap();
        assert_eq!(creds.access_key_id, "AKIAFAKE");
        assert_eq!(creds.region, "eu-west-1");
    }
}
