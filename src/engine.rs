//! Credential lifecycle engine — the core of the core.
//!
//! Holds the current source session and current derived credentials, serializes
//! mutations behind a single mutex, and performs proactive background refresh.
//! Grounded in the original source's `CredentialsExpirationManager`
//! (`SetSourceProfile`, `AssumeRole`, `RetrieveRole`, `Refresher`), re-expressed
//! as an async trait over `tokio::sync::Mutex` the way the teacher's codebase
//! wraps its own blocking AWS CLI calls in async functions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use tokio::sync::{watch, Mutex};
use tokio::time::interval;

use crate::error::EngineError;
use crate::guard::HostEnvironmentGuard;
use crate::profile::{Profile, ProfileStore, DEFAULT_PROFILE};
use crate::sts::{SessionCredentials, StsAdapter};

/// Refresh tick cadence. Contractual default per spec.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10);
/// Pre-expiry threshold: credentials are refreshed once less than this much time remains.
pub const REFRESH_THRESHOLD: chrono::Duration = chrono::Duration::seconds(600);
/// Hard cap on source-profile chain hops, guarding against a misconfigured cycle.
const MAX_CHAIN_HOPS: usize = 8;

/// The mutable heart of the daemon, protected by a single mutex.
#[derive(Default)]
struct EngineState {
    source_profile_name: Option<String>,
    source_profile: Option<Profile>,
    source_credentials: Option<SessionCredentials>,
    active_role_name: Option<String>,
    active_credentials: Option<SessionCredentials>,
    last_error: Option<EngineError>,
}

impl EngineState {
    fn source_expired(&self) -> bool {
        match &self.source_credentials {
            Some(c) => c.expires_at <= Utc::now(),
            None => true,
        }
    }
}

/// Public contract of the credential lifecycle engine (§4.C). The fake engine
/// (4.G) implements the same trait so it is a drop-in substitute for offline use.
#[async_trait]
pub trait CredentialsEngine: Send + Sync {
    async fn set_source(&self, name: &str, code: Option<&str>) -> Result<(), EngineError>;
    async fn assume(&self, name: &str, code: Option<&str>) -> Result<(), EngineError>;
    async fn retrieve(&self, name: &str, code: Option<&str>) -> Result<SessionCredentials, EngineError>;
    async fn credentials(&self) -> Result<SessionCredentials, EngineError>;
    async fn role(&self) -> String;
    async fn region(&self) -> String;
    async fn profiles(&self) -> Vec<String>;
}

/// Real engine implementation, backed by an [`StsAdapter`] and a [`ProfileStore`].
pub struct Engine {
    profiles: ProfileStore,
    sts: Arc<dyn StsAdapter>,
    guard: Arc<HostEnvironmentGuard>,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn new(profiles: ProfileStore, sts: Arc<dyn StsAdapter>, guard: Arc<HostEnvironmentGuard>) -> Self {
        Self {
            profiles,
            sts,
            guard,
            state: Mutex::new(EngineState::default()),
        }
    }

    fn lookup(&self, name: &str) -> Result<Profile, EngineError> {
        self.profiles
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProfile(name.to_string()))
    }

    /// Walks `source_profile` pointers starting at `name`, detecting a cycle
    /// before the hard hop cap. Validation only; does not resolve credentials.
    fn check_no_cycle(&self, name: &str) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        let mut current = name.to_string();
        for _ in 0..MAX_CHAIN_HOPS {
            if !seen.insert(current.clone()) {
                return Err(EngineError::UnknownProfile(name.to_string()));
            }
            match self.profiles.get(&current).and_then(|p| p.source_profile.clone()) {
                Some(next) => current = next,
                None => return Ok(()),
            }
        }
        Err(EngineError::UnknownProfile(name.to_string()))
    }

    /// Spawns the background refresh task. Exits when `shutdown` is signalled.
    pub fn spawn_refresh(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        engine.refresh_tick().await;
                    }
                    _ = shutdown.changed() => {
                        debug!("refresh task shutting down");
                        break;
                    }
                }
            }
        });
    }

    async fn refresh_tick(&self) {
        let (should_refresh, role_name) = {
            let state = self.state.lock().await;
            if state.last_error.is_some() {
                (false, None)
            } else if state.active_role_name == state.source_profile_name {
                (false, None)
            } else {
                let near_expiry = state
                    .active_credentials
                    .as_ref()
                    .map(|c| c.expires_at - Utc::now() <= REFRESH_THRESHOLD)
                    .unwrap_or(false);
                (near_expiry, state.active_role_name.clone())
            }
        };

        if !should_refresh {
            return;
        }
        let Some(role_name) = role_name else { return };
        debug!("refreshing credentials for role {role_name}");
        if let Err(e) = self.assume(&role_name, None).await {
            warn!("refresh of {role_name} failed, will retry next tick: {e}");
        }
    }

    /// Ephemeral source-session derivation: does not read or write engine state.
    async fn ephemeral_source_session(
        &self,
        source_profile: &Profile,
        code: Option<&str>,
    ) -> Result<SessionCredentials, EngineError> {
        if source_profile.mfa_serial.is_some() && code.map_or(true, |c| c.is_empty()) {
            return Err(EngineError::MfaRequired);
        }
        self.sts.get_session_token(source_profile, code).await
    }
}

#[async_trait]
impl CredentialsEngine for Engine {
    async fn set_source(&self, name: &str, code: Option<&str>) -> Result<(), EngineError> {
        let result = self.set_source_inner(name, code).await;
        let mut state = self.state.lock().await;
        match &result {
            Ok(()) => state.last_error = None,
            // A transient failure is recoverable without operator input: leave
            // last_error unset so the refresh tick keeps retrying instead of
            // stalling on a stale network hiccup.
            Err(EngineError::Transient(_)) => {}
            Err(e) => state.last_error = Some(e.clone()),
        }
        result
    }

    async fn assume(&self, name: &str, code: Option<&str>) -> Result<(), EngineError> {
        let profile = self.lookup(name)?;
        if profile.protected {
            return Err(EngineError::ProtectedProfile);
        }

        if !profile.is_role() {
            // A pure source profile: assuming it is equivalent to installing it as source.
            return self.set_source(name, code).await;
        }

        let source_name = profile
            .source_profile
            .clone()
            .ok_or_else(|| EngineError::UnknownProfile(name.to_string()))?;
        self.check_no_cycle(&source_name)?;

        let needs_install = {
            let state = self.state.lock().await;
            state.source_profile_name.as_deref() != Some(source_name.as_str()) || state.source_expired()
        };
        if needs_install {
            self.set_source(&source_name, code).await?;
        }

        if profile.mfa_serial.is_some() && code.map_or(true, |c| c.is_empty()) {
            return Err(EngineError::MfaRequired);
        }

        let source_session = {
            let state = self.state.lock().await;
            state
                .source_credentials
                .clone()
                .ok_or_else(|| EngineError::UnknownProfile(source_name.clone()))?
        };

        let role_arn = profile
            .role_arn
            .clone()
            .ok_or_else(|| EngineError::UnknownProfile(name.to_string()))?;
        let new_creds = self
            .sts
            .assume_role(
                &source_session,
                &role_arn,
                &profile.role_session_name,
                profile.mfa_serial.as_deref(),
                code,
            )
            .await?;

        {
            let mut state = self.state.lock().await;
            state.active_credentials = Some(new_creds.clone());
            state.active_role_name = Some(name.to_string());
            state.last_error = None;
        }

        if let Err(e) = self.guard.write_region(&profile.region) {
            warn!("host-environment guard write failed after assume: {e}");
        }

        Ok(())
    }

    async fn retrieve(&self, name: &str, code: Option<&str>) -> Result<SessionCredentials, EngineError> {
        let profile = self.lookup(name)?;
        if profile.protected {
            return Err(EngineError::ProtectedProfile);
        }

        if !profile.is_role() {
            let can_reuse = {
                let state = self.state.lock().await;
                state.source_profile_name.as_deref() == Some(name) && !state.source_expired()
            };
            if can_reuse {
                let state = self.state.lock().await;
                return state
                    .source_credentials
                    .clone()
                    .ok_or_else(|| EngineError::UnknownProfile(name.to_string()));
            }
            return self.ephemeral_source_session(&profile, code).await;
        }

        let source_name = profile
            .source_profile
            .clone()
            .ok_or_else(|| EngineError::UnknownProfile(name.to_string()))?;
        self.check_no_cycle(&source_name)?;

        if profile.mfa_serial.is_some() && code.map_or(true, |c| c.is_empty()) {
            return Err(EngineError::MfaRequired);
        }

        let reuse = {
            let state = self.state.lock().await;
            if state.source_profile_name.as_deref() == Some(source_name.as_str()) && !state.source_expired() {
                state.source_credentials.clone()
            } else {
                None
            }
        };

        let source_session = match reuse {
            Some(s) => s,
            None => {
                let source_profile = self.lookup(&source_name)?;
                self.ephemeral_source_session(&source_profile, code).await?
            }
        };

        let role_arn = profile
            .role_arn
            .clone()
            .ok_or_else(|| EngineError::UnknownProfile(name.to_string()))?;
        self.sts
            .assume_role(
                &source_session,
                &role_arn,
                &profile.role_session_name,
                profile.mfa_serial.as_deref(),
                code,
            )
            .await
    }

    async fn credentials(&self) -> Result<SessionCredentials, EngineError> {
        let state = self.state.lock().await;
        if let Some(err) = &state.last_error {
            return Err(err.clone());
        }
        state
            .active_credentials
            .clone()
            .ok_or_else(|| EngineError::UnknownProfile(String::new()))
    }

    async fn role(&self) -> String {
        let state = self.state.lock().await;
        state.active_role_name.clone().unwrap_or_default()
    }

    async fn region(&self) -> String {
        let state = self.state.lock().await;
        let role = state.active_role_name.clone();
        drop(state);
        match role {
            Some(r) => self.profiles.get(&r).map(|p| p.region.clone()).unwrap_or_default(),
            None => String::new(),
        }
    }

    async fn profiles(&self) -> Vec<String> {
        self.profiles.names()
    }
}

impl Engine {
    async fn set_source_inner(&self, name: &str, code: Option<&str>) -> Result<(), EngineError> {
        let profile = self.lookup(name)?;

        if profile.mfa_serial.is_some() && code.map_or(true, |c| c.is_empty()) {
            return Err(EngineError::MfaRequired);
        }

        let creds = self.sts.get_session_token(&profile, code).await?;

        let mut state = self.state.lock().await;
        state.source_profile_name = Some(name.to_string());
        state.source_profile = Some(profile.clone());
        state.source_credentials = Some(creds.clone());
        state.active_credentials = Some(creds);
        state.active_role_name = Some(name.to_string());
        Ok(())
    }
}

/// Bootstraps a profile name at startup, falling back to [`DEFAULT_PROFILE`]
/// when the caller did not specify one, matching the teacher's precedence
/// (CLI flag, then `AWS_PROFILE`, then `default`).
pub fn resolve_initial_profile(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var("AWS_PROFILE").ok())
        .unwrap_or_else(|| DEFAULT_PROFILE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::HostEnvironmentGuard;
    use crate::sts::SessionCredentials;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct ScriptedSts {
        session_expiry: StdMutex<chrono::DateTime<Utc>>,
        assume_calls: AtomicUsize,
        fail_with_code: StdMutex<Option<String>>,
    }

    impl ScriptedSts {
        fn new() -> Self {
            Self {
                session_expiry: StdMutex::new(Utc::now() + ChronoDuration::hours(10)),
                assume_calls: AtomicUsize::new(0),
                fail_with_code: StdMutex::new(None),
            }
        }
    }

    #[async_trait]
    impl StsAdapter for ScriptedSts {
        async fn get_session_token(
            &self,
            profile: &Profile,
            code: Option<&str>,
        ) -> Result<SessionCredentials, EngineError> {
            if let Some(msg) = self.fail_with_code.lock().unwrap().clone() {
                let used_code = code.map_or(false, |c| !c.is_empty());
                return Err(if used_code {
                    EngineError::Fatal(msg)
                } else {
                    EngineError::Transient(msg)
                });
            }
            Ok(SessionCredentials {
                access_key_id: format!("{}-source-key", profile.name),
                secret_access_key: "secret".into(),
                session_token: "token".into(),
                expires_at: *self.session_expiry.lock().unwrap(),
                region: profile.region.clone(),
            })
        }

        async fn assume_role(
            &self,
            _source: &SessionCredentials,
            role_arn: &str,
            _session_name: &str,
            _mfa_serial: Option<&str>,
            _code: Option<&str>,
        ) -> Result<SessionCredentials, EngineError> {
            let n = self.assume_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SessionCredentials {
                access_key_id: format!("assumed-{role_arn}-{n}"),
                secret_access_key: "assumed-secret".into(),
                session_token: "assumed-token".into(),
                expires_at: Utc::now() + ChronoDuration::minutes(15),
                region: "us-west-2".into(),
            })
        }
    }

    fn build_store() -> ProfileStore {
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
        profiles.insert(
            "admin".to_string(),
            Profile {
                name: "admin".into(),
                role_arn: Some("arn:aws:iam::000000000000:role/Admin".into()),
                source_profile: Some("default".into()),
                mfa_serial: Some("arn:aws:iam::000000000000:mfa/u1".into()),
                region: "us-west-2".into(),
                role_session_name: "imsd-admin".into(),
                ..Default::default()
            },
        );
        profiles.insert(
            "locked".to_string(),
            Profile {
                name: "locked".into(),
                role_arn: Some("arn:aws:iam::000000000000:role/Locked".into()),
                source_profile: Some("default".into()),
                protected: true,
                region: "us-west-2".into(),
                role_session_name: "imsd-locked".into(),
                ..Default::default()
            },
        );
        ProfileStore::new(profiles)
    }

    fn build_engine(sts: Arc<ScriptedSts>) -> Engine {
        let td = tempdir().unwrap();
        let guard = Arc::new(HostEnvironmentGuard::new(td.path().to_path_buf()));
        Engine::new(build_store(), sts, guard)
    }

    #[tokio::test]
    async fn assume_without_mfa_code_is_mfa_required_then_succeeds_with_code() {
        let sts = Arc::new(ScriptedSts::new());
        let engine = build_engine(sts);

        engine.set_source("default", None).await.unwrap();

        let err = engine.assume("admin", None).await.unwrap_err();
        assert!(matches!(err, EngineError::MfaRequired));

        engine.assume("admin", Some("123456")).await.unwrap();
        assert_eq!(engine.role().await, "admin");

        let creds = engine.credentials().await.unwrap();
        assert_ne!(creds.access_key_id, "default-source-key");
    }

    #[tokio::test]
    async fn protected_profile_always_rejected() {
        let sts = Arc::new(ScriptedSts::new());
        let engine = build_engine(sts);
        engine.set_source("default", None).await.unwrap();

        let err = engine.assume("locked", Some("000000")).await.unwrap_err();
        assert!(matches!(err, EngineError::ProtectedProfile));
        assert_eq!(engine.role().await, "default");
    }

    #[tokio::test]
    async fn unknown_profile_is_non_sticky() {
        let sts = Arc::new(ScriptedSts::new());
        let engine = build_engine(sts);
        engine.set_source("default", None).await.unwrap();

        let err = engine.assume("ghost", None).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownProfile(_)));
        // Engine should still be able to serve credentials; the failure was not sticky.
        assert!(engine.credentials().await.is_ok());
    }

    #[tokio::test]
    async fn fatal_set_source_stalls_until_next_success() {
        let sts = Arc::new(ScriptedSts::new());
        *sts.fail_with_code.lock().unwrap() = Some("bad code".into());
        let engine = build_engine(sts.clone());

        let err = engine.set_source("default", Some("badcode")).await.unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
        assert!(matches!(engine.credentials().await.unwrap_err(), EngineError::Fatal(_)));

        *sts.fail_with_code.lock().unwrap() = None;
        engine.set_source("default", Some("goodcode")).await.unwrap();
        assert!(engine.credentials().await.is_ok());
    }

    #[tokio::test]
    async fn transient_set_source_failure_is_not_sticky() {
        let sts = Arc::new(ScriptedSts::new());
        let engine = build_engine(sts.clone());
        engine.set_source("default", None).await.unwrap();

        *sts.fail_with_code.lock().unwrap() = Some("network blip".into());
        let err = engine.set_source("default", None).await.unwrap_err();
        assert!(matches!(err, EngineError::Transient(_)));

        // A transient, no-code failure must not stall the engine: the previously
        // installed credentials keep being served and a refresh tick can still run.
        assert!(engine.credentials().await.is_ok());

        *sts.fail_with_code.lock().unwrap() = None;
        engine.set_source("default", None).await.unwrap();
        assert!(engine.credentials().await.is_ok());
    }

    #[tokio::test]
    async fn refresh_tick_advances_expiry_once_near_threshold() {
        let sts = Arc::new(ScriptedSts::new());
        let engine = build_engine(sts);
        engine.set_source("default", None).await.unwrap();
        engine.assume("admin", Some("123456")).await.unwrap();

        let before = engine.credentials().await.unwrap();

        // Manufacture near-expiry by forcing active_credentials into the threshold window.
        {
            let mut state = engine.state.lock().await;
            let mut stale = state.active_credentials.clone().unwrap();
            stale.expires_at = Utc::now() + ChronoDuration::seconds(30);
            state.active_credentials = Some(stale);
        }

        engine.refresh_tick().await;

        let after = engine.credentials().await.unwrap();
        assert!(after.expires_at > before.expires_at);
    }

    #[tokio::test]
    async fn refresh_tick_skips_when_active_role_is_source() {
        let sts = Arc::new(ScriptedSts::new());
        let engine = build_engine(sts);
        engine.set_source("default", None).await.unwrap();

        engine.refresh_tick().await;
        // No panic, no change; source role is never auto-refreshed.
        assert_eq!(engine.role().await, "default");
    }
}
