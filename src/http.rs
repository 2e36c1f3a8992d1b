//! Metadata HTTP responder (§4.D): a minimal hand-rolled HTTP/1.1 listener
//! serving the five fixed routes under `/latest/meta-data/`.
//!
//! Grounded in the original source's `metadata-service.go`, which is itself a
//! thin `net/http` mux with no framework. We mirror that shape directly over
//! a raw `tokio::net::TcpListener` instead of pulling in a web framework the
//! teacher's stack never needed.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::engine::CredentialsEngine;

/// The role name this daemon enumerates itself as, matching the original's `ims`.
pub const ROLE_NAME: &str = "ims";
const FAKE_INSTANCE_ID: &str = "i-deadbeef";
const FAKE_AVAILABILITY_ZONE: &str = "eu-west-1";
const FAKE_PUBLIC_HOSTNAME: &str = "ec2-0-0-0-0.eu-west-1.compute.amazonaws.com";

#[derive(Serialize)]
struct SecurityCredentialsResponse {
    #[serde(rename = "Code")]
    code: &'static str,
    #[serde(rename = "LastUpdated")]
    last_updated: String,
    #[serde(rename = "Type")]
    kind: &'static str,
    #[serde(rename = "AccessKeyId")]
    access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    secret_access_key: String,
    #[serde(rename = "Token")]
    token: String,
    #[serde(rename = "Expiration")]
    expiration: String,
}

/// Runs the metadata HTTP listener until `shutdown` is signalled. Closing the
/// listener from outside is the normal termination signal, not an error.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<dyn CredentialsEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, engine).await {
                                debug!("metadata connection ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        // Closing the listener during shutdown surfaces here; that is
                        // the normal termination signal and must not be logged as an error.
                        if shutdown.has_changed().unwrap_or(false) {
                            debug!("metadata listener closed for shutdown");
                            break;
                        }
                        warn!("metadata listener accept failed: {e}");
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("metadata listener shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(
    mut stream: tokio::net::TcpStream,
    engine: Arc<dyn CredentialsEngine>,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);
    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();

    let (status, content_type, body) = route(&path, engine).await;
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn route(path: &str, engine: Arc<dyn CredentialsEngine>) -> (&'static str, &'static str, String) {
    match path {
        "/latest/meta-data/iam/security-credentials/" => {
            ("200 OK", "text/plain", ROLE_NAME.to_string())
        }
        p if p == format!("/latest/meta-data/iam/security-credentials/{ROLE_NAME}") => {
            security_credentials_response(engine).await
        }
        "/latest/meta-data/instance-id" => ("200 OK", "text/plain", FAKE_INSTANCE_ID.to_string()),
        "/latest/meta-data/placement/availability-zone" => {
            ("200 OK", "text/plain", FAKE_AVAILABILITY_ZONE.to_string())
        }
        "/latest/meta-data/public-hostname" => ("200 OK", "text/plain", FAKE_PUBLIC_HOSTNAME.to_string()),
        _ => ("404 Not Found", "text/plain", String::new()),
    }
}

async fn security_credentials_response(
    engine: Arc<dyn CredentialsEngine>,
) -> (&'static str, &'static str, String) {
    match engine.credentials().await {
        Ok(creds) => {
            let resp = SecurityCredentialsResponse {
                code: "Success",
                last_updated: Utc::now().to_rfc3339(),
                kind: "AWS-HMAC",
                access_key_id: creds.access_key_id,
                secret_access_key: creds.secret_access_key,
                token: creds.session_token,
                expiration: creds.expires_at.to_rfc3339(),
            };
            match serde_json::to_string(&resp) {
                Ok(body) => ("200 OK", "application/json", body),
                Err(_) => ("500 Internal Server Error", "text/plain", String::new()),
            }
        }
        Err(e) => {
            warn!("metadata credentials lookup failed: {e}");
            ("500 Internal Server Error", "text/plain", String::new())
        }
    }
}
