//! Control-plane handler (§4.E): operator RPC over a local Unix-domain socket,
//! one newline-delimited JSON request per connection.
//!
//! Grounded in the original source's `cli-handler.go`, which exposed the same
//! six operations over gRPC on a Unix socket with mode `0777`. We keep the
//! socket, the mode, and the six operations, substituting a small JSON framing
//! for the protobuf/gRPC wire format per spec §6.2 ("semantic, not bit-exact").

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::engine::CredentialsEngine;
use crate::error::EngineError;
use crate::profile::ProfileStore;

/// Fixed socket mode: the daemon runs with elevated privilege and must let
/// unprivileged local clients connect.
pub const SOCKET_MODE: u32 = 0o777;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "PascalCase")]
enum Request {
    Status,
    Stop,
    AssumeRole { name: String, mfa: Option<String> },
    SetCredentials { name: String, mfa: Option<String> },
    RetrieveRole { name: String, mfa: Option<String> },
    Config,
}

#[derive(Debug, Default, Serialize)]
struct StatusReply {
    role: String,
    #[serde(rename = "accessKeyId")]
    access_key_id: String,
    #[serde(rename = "secretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "sessionToken")]
    session_token: String,
    expiration: String,
    region: String,
    /// Non-empty error description; empty string means success.
    error: String,
    /// Distinguishes an `UnknownProfile`/`MfaRequired` condition from other failures.
    #[serde(rename = "preconditionFailed")]
    precondition_failed: bool,
}

#[derive(Debug, Serialize)]
struct ConfigReply {
    profiles: std::collections::BTreeMap<String, RedactedProfile>,
}

#[derive(Debug, Serialize)]
struct RedactedProfile {
    region: String,
    #[serde(rename = "roleArn")]
    role_arn: Option<String>,
    #[serde(rename = "sourceProfile")]
    source_profile: Option<String>,
    #[serde(rename = "mfaSerial")]
    mfa_serial: Option<String>,
    protected: bool,
}

/// Binds the control-plane socket at `path`, removing any stale file first,
/// and sets the fixed `0777` mode.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    set_socket_mode(path)?;
    Ok(listener)
}

#[cfg(unix)]
fn set_socket_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(SOCKET_MODE);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_socket_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Removes the socket file if present. Idempotent; safe to call on every exit path.
pub fn remove_stale_socket(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("failed to remove control socket {}: {e}", path.display());
        }
    }
}

/// Runs the control-plane listener until `shutdown` is signalled or a client
/// sends `Stop`.
pub async fn serve(
    listener: UnixListener,
    socket_path: PathBuf,
    engine: Arc<dyn CredentialsEngine>,
    profiles: Arc<ProfileStore>,
    stop_tx: watch::Sender<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let engine = Arc::clone(&engine);
                        let profiles = Arc::clone(&profiles);
                        let stop_tx = stop_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, engine, profiles, stop_tx).await {
                                debug!("control connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("control listener accept failed: {e}"),
                }
            }
            _ = shutdown.changed() => {
                debug!("control listener shutting down");
                break;
            }
        }
    }
    remove_stale_socket(&socket_path);
}

async fn handle_connection(
    stream: UnixStream,
    engine: Arc<dyn CredentialsEngine>,
    profiles: Arc<ProfileStore>,
    stop_tx: watch::Sender<bool>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let request: Request = match serde_json::from_str(line.trim()) {
        Ok(r) => r,
        Err(e) => {
            let reply = StatusReply {
                error: format!("malformed request: {e}"),
                ..Default::default()
            };
            return write_reply(&mut write_half, &reply).await;
        }
    };

    match request {
        Request::Status => {
            let reply = status_reply(&*engine).await;
            write_reply(&mut write_half, &reply).await
        }
        Request::Stop => {
            let _ = stop_tx.send(true);
            write_reply(&mut write_half, &StatusReply::default()).await
        }
        Request::AssumeRole { name, mfa } => {
            let reply = match engine.assume(&name, mfa.as_deref()).await {
                Ok(()) => status_reply(&*engine).await,
                Err(e) => error_reply(e),
            };
            write_reply(&mut write_half, &reply).await
        }
        Request::SetCredentials { name, mfa } => {
            let reply = match engine.set_source(&name, mfa.as_deref()).await {
                Ok(()) => status_reply(&*engine).await,
                Err(e) => error_reply(e),
            };
            write_reply(&mut write_half, &reply).await
        }
        Request::RetrieveRole { name, mfa } => {
            let reply = match engine.retrieve(&name, mfa.as_deref()).await {
                Ok(creds) => StatusReply {
                    role: name,
                    access_key_id: creds.access_key_id,
                    secret_access_key: creds.secret_access_key,
                    session_token: creds.session_token,
                    expiration: creds.expires_at.to_rfc3339(),
                    region: creds.region,
                    error: String::new(),
                    precondition_failed: false,
                },
                Err(e) => error_reply(e),
            };
            write_reply(&mut write_half, &reply).await
        }
        Request::Config => {
            let reply = ConfigReply {
                profiles: profiles
                    .iter()
                    .map(|(name, p)| {
                        (
                            name.clone(),
                            RedactedProfile {
                                region: p.region.clone(),
                                role_arn: p.role_arn.clone(),
                                source_profile: p.source_profile.clone(),
                                mfa_serial: p.mfa_serial.clone(),
                                protected: p.protected,
                            },
                        )
                    })
                    .collect(),
            };
            write_reply(&mut write_half, &reply).await
        }
    }
}

async fn status_reply(engine: &dyn CredentialsEngine) -> StatusReply {
    match engine.credentials().await {
        Ok(creds) => StatusReply {
            role: engine.role().await,
            access_key_id: creds.access_key_id,
            secret_access_key: creds.secret_access_key,
            session_token: creds.session_token,
            expiration: creds.expires_at.to_rfc3339(),
            region: creds.region,
            error: String::new(),
            precondition_failed: false,
        },
        Err(e) => error_reply(e),
    }
}

fn error_reply(e: EngineError) -> StatusReply {
    StatusReply {
        error: e.to_string(),
        precondition_failed: e.is_precondition_failed(),
        ..Default::default()
    }
}

async fn write_reply<T: Serialize>(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    reply: &T,
) -> std::io::Result<()> {
    let mut body = serde_json::to_vec(reply).unwrap_or_default();
    body.push(b'\n');
    write_half.write_all(&body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::HostEnvironmentGuard;
    use crate::profile::Profile;
    use crate::sts::{SessionCredentials, StsAdapter};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::HashMap;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt as _;

    struct StubSts;

    #[async_trait]
    impl StsAdapter for StubSts {
        async fn get_session_token(
            &self,
            profile: &Profile,
            _code: Option<&str>,
        ) -> Result<SessionCredentials, EngineError> {
            Ok(SessionCredentials {
                access_key_id: "AKID".into(),
                secret_access_key: "SECRET".into(),
                session_token: "TOKEN".into(),
                expires_at: Utc::now() + ChronoDuration::hours(10),
                region: profile.region.clone(),
            })
        }

        async fn assume_role(
            &self,
            _source: &SessionCredentials,
            _role_arn: &str,
            _session_name: &str,
            _mfa_serial: Option<&str>,
            _code: Option<&str>,
        ) -> Result<SessionCredentials, EngineError> {
            Ok(SessionCredentials {
                access_key_id: "ASSUMED".into(),
                secret_access_key: "ASSUMED_SECRET".into(),
                session_token: "ASSUMED_TOKEN".into(),
                expires_at: Utc::now() + ChronoDuration::minutes(15),
                region: "us-west-2".into(),
            })
        }
    }

    #[tokio::test]
    async fn status_round_trips_over_socket() {
        let mut profiles = HashMap::new();
        profiles.insert(
            "default".to_string(),
            Profile {
                name: "default".into(),
                access_key_id: Some("AKID".into()),
                secret_access_key: Some("SECRET".into()),
                region: "us-east-1".into(),
                role_session_name: "imsd-default".into(),
                ..Default::default()
            },
        );
        let store = Arc::new(ProfileStore::new(profiles.clone()));
        let td = tempdir().unwrap();
        let guard = Arc::new(HostEnvironmentGuard::new(td.path().to_path_buf()));
        let engine: Arc<dyn CredentialsEngine> =
            Arc::new(crate::engine::Engine::new(ProfileStore::new(profiles), Arc::new(StubSts), guard));
        engine.set_source("default", None).await.unwrap();

        let socket_path = td.path().join("imsd.sock");
        let listener = bind(&socket_path).unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let server_engine = Arc::clone(&engine);
        let server_store = Arc::clone(&store);
        let server_path = socket_path.clone();
        tokio::spawn(async move {
            serve(listener, server_path, server_engine, server_store, stop_tx, shutdown_rx).await;
        });
        drop(stop_rx);

        // Give the listener a moment to start accepting.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(b"{\"op\":\"Status\"}\n").await.unwrap();
        let mut reader = BufReader::new(client);
        let mut response = String::new();
        reader.read_line(&mut response).await.unwrap();

        let value: serde_json::Value = serde_json::from_str(response.trim()).unwrap();
        assert_eq!(value["role"], "default");
        assert_eq!(value["error"], "");
    }
}
