//! Fake engine: a drop-in substitute for [`crate::engine::Engine`] used for
//! offline demonstrations and as a test double, grounded in the original
//! source's `FakeCredentialsManager`.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use crate::engine::CredentialsEngine;
use crate::error::EngineError;
use crate::sts::SessionCredentials;

const FAKE_ROLE: &str = "dummy-role";
const FAKE_REGION: &str = "eu-foo-1";

/// Returns constant placeholder credentials with a synthetic expiry one hour
/// in the future; never touches the network or the filesystem.
#[derive(Debug, Default)]
pub struct FakeEngine;

impl FakeEngine {
    pub fn new() -> Self {
        Self
    }

    fn placeholder_credentials(&self) -> SessionCredentials {
        SessionCredentials {
            access_key_id: "xxxxxxxxxxxx".into(),
            secret_access_key: "yyyyyyyyyyyyyyyyyyyyyyy".into(),
            session_token: "xxxxxxxxxxx-yyyyyyyyyyy-zzzzzzzzzzzz".into(),
            expires_at: Utc::now() + ChronoDuration::minutes(60),
            region: FAKE_REGION.into(),
        }
    }
}

#[async_trait]
impl CredentialsEngine for FakeEngine {
    async fn set_source(&self, _name: &str, _code: Option<&str>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn assume(&self, _name: &str, _code: Option<&str>) -> Result<(), EngineError> {
        Ok(())
    }

    async fn retrieve(&self, _name: &str, _code: Option<&str>) -> Result<SessionCredentials, EngineError> {
        Ok(self.placeholder_credentials())
    }

    async fn credentials(&self) -> Result<SessionCredentials, EngineError> {
        Ok(self.placeholder_credentials())
    }

    async fn role(&self) -> String {
        FAKE_ROLE.to_string()
    }

    async fn region(&self) -> String {
        FAKE_REGION.to_string()
    }

    async fn profiles(&self) -> Vec<String> {
        vec![FAKE_ROLE.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_constant_placeholder_credentials() {
        let engine = FakeEngine::new();
        let creds = engine.credentials().await.unwrap();
        assert_eq!(creds.access_key_id, "xxxxxxxxxxxx");
        assert_eq!(engine.role().await, FAKE_ROLE);
        assert_eq!(engine.region().await, FAKE_REGION);
        assert!(creds.expires_at > Utc::now());
    }
}
