//! Lifecycle of the bearer token that authorizes uploads.
//!
//! A [`CredentialManager`] owns the single live [`Credential`] for one linked
//! identity. Reads share a lock; refresh and bootstrap take it exclusively, so
//! the background refresher and foreground callers never race each other.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tidevault_core::task::{shutdown_requested, BackgroundTask};
use tidevault_core::{Error, Result};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Tokens with less validity left than this are refreshed.
pub const REFRESH_MARGIN_SECS: i64 = 5 * 60;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub user_id: String,
}

impl Credential {
    pub fn expires_within(&self, margin: ChronoDuration, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= margin
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Tokens returned by the provider's token endpoint.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Out-of-band notification from whatever relays the authorization callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    NewCode(String),
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The current token was still valid beyond the margin.
    Fresh,
    Refreshed,
}

#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// URL the user opens to grant access.
    fn authorization_url(&self) -> Result<String>;

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load_credential(&self) -> Result<Option<Credential>>;

    /// Inserts or replaces the credential with the same user id.
    async fn save_credential(&self, credential: &Credential) -> Result<()>;
}

/// Anything that can hand out a token good for the next request.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn fresh_token(&self) -> Result<String>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    /// Most recently saved last.
    credentials: Vec<Credential>,
}

fn upsert(credentials: &mut Vec<Credential>, credential: &Credential) {
    credentials.retain(|c| c.user_id != credential.user_id);
    credentials.push(credential.clone());
}

/// Credentials kept in a JSON file.
#[derive(Debug)]
pub struct JsonCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<CredentialFile> {
        match tokio::fs::read(&self.path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CredentialFile::default()),
            Err(e) => Err(Error::path(&self.path, e)),
        }
    }
}

#[async_trait]
impl CredentialStore for JsonCredentialStore {
    async fn load_credential(&self) -> Result<Option<Credential>> {
        Ok(self.read_file().await?.credentials.pop())
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.read_file().await?;
        upsert(&mut file.credentials, credential);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::path(parent, e))?;
        }
        let data = serde_json::to_vec_pretty(&file)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await.map_err(|e| Error::path(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::path(&self.path, e))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<Vec<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn saved(&self) -> Vec<Credential> {
        self.credentials.lock().await.clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_credential(&self) -> Result<Option<Credential>> {
        Ok(self.credentials.lock().await.last().cloned())
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        upsert(&mut *self.credentials.lock().await, credential);
        Ok(())
    }
}

pub struct CredentialManager {
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn CredentialStore>,
    current: RwLock<Option<Credential>>,
    margin: ChronoDuration,
}

impl CredentialManager {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            endpoint,
            store,
            current: RwLock::new(None),
            margin: ChronoDuration::seconds(REFRESH_MARGIN_SECS),
        }
    }

    /// Loads the stored credential, if any. Returns whether one was found.
    pub async fn load(&self) -> Result<bool> {
        let stored = self.store.load_credential().await?;
        let found = stored.is_some();
        if let Some(credential) = &stored {
            debug!(user_id = %credential.user_id, expires_at = %credential.expires_at, "Loaded stored credential");
        }
        *self.current.write().await = stored;
        Ok(found)
    }

    pub async fn has_credential(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Current access token. Never refreshes; call
    /// [`refresh_access_token`](Self::refresh_access_token) first when freshness matters.
    pub async fn access_token(&self) -> Result<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|c| c.access_token.clone())
            .ok_or_else(|| Error::Auth("no credential, authorization required".to_string()))
    }

    /// Refreshes the token unless it is valid for longer than the safety margin.
    pub async fn refresh_access_token(&self) -> Result<RefreshOutcome> {
        let mut current = self.current.write().await;
        let Some(credential) = current.as_ref() else {
            return Err(Error::Auth("no credential to refresh".to_string()));
        };

        if !credential.expires_within(self.margin, Utc::now()) {
            debug!(expires_at = %credential.expires_at, "Access token still fresh");
            return Ok(RefreshOutcome::Fresh);
        }

        let grant = self.endpoint.refresh(&credential.refresh_token).await?;
        let refreshed = credential_from_grant(grant, Some(credential));
        self.store.save_credential(&refreshed).await?;
        info!(user_id = %refreshed.user_id, expires_at = %refreshed.expires_at, "Access token refreshed");
        *current = Some(refreshed);
        Ok(RefreshOutcome::Refreshed)
    }

    /// Exchanges an authorization code and replaces the current credential.
    pub async fn authorize_with_code(&self, code: &str) -> Result<()> {
        let mut current = self.current.write().await;
        let grant = self.endpoint.exchange_code(code).await?;
        let credential = credential_from_grant(grant, current.as_ref());
        self.store.save_credential(&credential).await?;
        info!(user_id = %credential.user_id, expires_at = %credential.expires_at, "Authorization code exchanged");
        *current = Some(credential);
        Ok(())
    }

    /// Prints the authorization URL and waits for a code on `events`.
    ///
    /// A code that fails to exchange is logged and the wait continues.
    pub async fn bootstrap(&self, events: &mut mpsc::Receiver<AuthEvent>) -> Result<()> {
        let url = self.endpoint.authorization_url()?;
        info!(url = %url, "No stored credential, open this URL to authorize");

        loop {
            match events.recv().await {
                Some(AuthEvent::NewCode(code)) => match self.authorize_with_code(&code).await {
                    Ok(()) => return Ok(()),
                    Err(e) => warn!(error = %e, "Authorization code rejected, waiting for another"),
                },
                Some(AuthEvent::Refresh) => debug!("Refresh requested before authorization, ignoring"),
                None => {
                    return Err(Error::Auth(
                        "authorization channel closed before a code arrived".to_string(),
                    ));
                }
            }
        }
    }

    /// Makes sure a usable credential exists, bootstrapping if needed.
    ///
    /// `timeout` bounds the wait for an authorization code; `None` waits forever.
    pub async fn ensure_authorized(
        &self,
        events: &mut mpsc::Receiver<AuthEvent>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if self.load().await? {
            match self.refresh_access_token().await {
                Ok(outcome) => {
                    debug!(?outcome, "Stored credential is usable");
                    return Ok(());
                }
                Err(e) => warn!(error = %e, "Stored credential could not be refreshed, authorization required"),
            }
        }

        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.bootstrap(events))
                .await
                .map_err(|_| Error::Auth(format!("no authorization code within {}s", limit.as_secs())))?,
            None => self.bootstrap(events).await,
        }
    }

    pub async fn handle_event(&self, event: AuthEvent) -> Result<()> {
        match event {
            AuthEvent::NewCode(code) => self.authorize_with_code(&code).await,
            AuthEvent::Refresh => self.refresh_access_token().await.map(|_| ()),
        }
    }

    /// Refreshes on a fixed interval until shutdown. The first tick fires one
    /// interval from now.
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> BackgroundTask {
        let manager = self.clone();
        BackgroundTask::spawn("token-refresher", async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match manager.refresh_access_token().await {
                            Ok(outcome) => debug!(?outcome, "Periodic token check"),
                            Err(e) => error!(error = %e, "Periodic token refresh failed"),
                        }
                    }
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        })
    }

    /// Applies incoming auth events until shutdown or until the sender goes away.
    pub fn spawn_listener(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<AuthEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BackgroundTask {
        let manager = self.clone();
        BackgroundTask::spawn("auth-listener", async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        if let Err(e) = manager.handle_event(event).await {
                            error!(error = %e, "Failed to apply auth event");
                        }
                    }
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        })
    }
}

#[async_trait]
impl AccessTokenSource for CredentialManager {
    async fn fresh_token(&self) -> Result<String> {
        self.refresh_access_token().await?;
        self.access_token().await
    }
}

fn credential_from_grant(grant: TokenGrant, previous: Option<&Credential>) -> Credential {
    let refresh_token = grant
        .refresh_token
        .or_else(|| previous.map(|c| c.refresh_token.clone()))
        .unwrap_or_default();
    let user_id = grant
        .user_id
        .filter(|id| !id.is_empty())
        .or_else(|| previous.map(|c| c.user_id.clone()))
        .unwrap_or_default();

    Credential {
        access_token: grant.access_token,
        refresh_token,
        expires_at: Utc::now() + ChronoDuration::seconds(grant.expires_in as i64),
        user_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeEndpoint {
        exchanges: AtomicU32,
        refreshes: AtomicU32,
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        fn authorization_url(&self) -> Result<String> {
            Ok("https://login.example/authorize?client_id=test".to_string())
        }

        async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if code == "bad" {
                return Err(Error::UnexpectedStatus {
                    context: "code exchange".to_string(),
                    status: 400,
                    body: "invalid_grant".to_string(),
                });
            }
            Ok(TokenGrant {
                access_token: format!("access-{}", code),
                refresh_token: Some("refresh-1".to_string()),
                expires_in: 3600,
                user_id: Some("user-1".to_string()),
            })
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            assert!(refresh_token.starts_with("refresh-"));
            Ok(TokenGrant {
                access_token: format!("access-r{}", n),
                refresh_token: Some(format!("refresh-{}", n + 1)),
                expires_in: 3600,
                user_id: None,
            })
        }
    }

    fn credential(expires_in_secs: i64) -> Credential {
        Credential {
            access_token: "access-0".to_string(),
            refresh_token: "refresh-0".to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(expires_in_secs),
            user_id: "user-1".to_string(),
        }
    }

    async fn manager_with(stored: Option<Credential>) -> (Arc<CredentialManager>, Arc<FakeEndpoint>, Arc<MemoryCredentialStore>) {
        let endpoint = Arc::new(FakeEndpoint::default());
        let store = Arc::new(MemoryCredentialStore::new());
        if let Some(c) = stored {
            store.save_credential(&c).await.unwrap();
        }
        let manager = Arc::new(CredentialManager::new(endpoint.clone(), store.clone()));
        manager.load().await.unwrap();
        (manager, endpoint, store)
    }

    #[tokio::test]
    async fn test_refresh_is_noop_when_fresh() {
        let (manager, endpoint, _) = manager_with(Some(credential(3600))).await;

        assert_eq!(manager.refresh_access_token().await.unwrap(), RefreshOutcome::Fresh);
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(manager.access_token().await.unwrap(), "access-0");
    }

    #[tokio::test]
    async fn test_refresh_near_expiry_persists_new_pair() {
        let (manager, endpoint, store) = manager_with(Some(credential(60))).await;

        assert_eq!(manager.refresh_access_token().await.unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.access_token().await.unwrap(), "access-r1");

        let saved = store.saved().await;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].refresh_token, "refresh-2");
        assert_eq!(saved[0].user_id, "user-1");

        // Now fresh again, so a second call does nothing.
        assert_eq!(manager.refresh_access_token().await.unwrap(), RefreshOutcome::Fresh);
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_exchange_once() {
        let (manager, endpoint, _) = manager_with(Some(credential(10))).await;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = manager.clone();
                tokio::spawn(async move { m.fresh_token().await })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "access-r1");
        }
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_waits_for_a_valid_code() {
        let (manager, endpoint, store) = manager_with(None).await;
        assert!(manager.access_token().await.is_err());

        let (tx, mut rx) = mpsc::channel(4);
        tx.send(AuthEvent::Refresh).await.unwrap();
        tx.send(AuthEvent::NewCode("bad".to_string())).await.unwrap();
        tx.send(AuthEvent::NewCode("good".to_string())).await.unwrap();

        manager.ensure_authorized(&mut rx, None).await.unwrap();
        assert_eq!(manager.access_token().await.unwrap(), "access-good");
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 2);
        assert_eq!(store.saved().await.len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_fails_when_channel_closes() {
        let (manager, _, _) = manager_with(None).await;
        let (tx, mut rx) = mpsc::channel::<AuthEvent>(1);
        drop(tx);

        let err = manager.ensure_authorized(&mut rx, None).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_bootstrap_timeout() {
        let (manager, _, _) = manager_with(None).await;
        let (_tx, mut rx) = mpsc::channel::<AuthEvent>(1);

        let err = manager
            .ensure_authorized(&mut rx, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_listener_applies_events_until_shutdown() {
        let (manager, endpoint, _) = manager_with(Some(credential(3600))).await;
        let (tx, rx) = mpsc::channel(4);
        let shutdown = tidevault_core::ShutdownSignal::new();
        let task = manager.spawn_listener(rx, shutdown.subscribe());

        tx.send(AuthEvent::NewCode("second".to_string())).await.unwrap();
        tx.send(AuthEvent::Refresh).await.unwrap();
        drop(tx);
        task.wait(Duration::from_secs(5)).await;

        assert_eq!(manager.access_token().await.unwrap(), "access-second");
        assert_eq!(endpoint.exchanges.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_ticks_and_stops() {
        let (manager, endpoint, _) = manager_with(Some(credential(60))).await;
        let shutdown = tidevault_core::ShutdownSignal::new();
        let task = manager.spawn_refresher(Duration::from_secs(1800), shutdown.subscribe());

        tokio::time::sleep(Duration::from_secs(1801)).await;
        assert_eq!(endpoint.refreshes.load(Ordering::SeqCst), 1);

        shutdown.trigger();
        task.wait(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_json_store_upserts_by_user() {
        let dir = TempDir::new().unwrap();
        let store = JsonCredentialStore::new(dir.path().join("auth/credentials.json"));
        assert!(store.load_credential().await.unwrap().is_none());

        let mut first = credential(3600);
        store.save_credential(&first).await.unwrap();
        first.access_token = "access-updated".to_string();
        store.save_credential(&first).await.unwrap();

        let loaded = store.load_credential().await.unwrap().unwrap();
        assert_eq!(loaded.access_token, "access-updated");

        let file: CredentialFile =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(file.credentials.len(), 1);
    }

    #[test]
    fn test_debug_hides_tokens() {
        let rendered = format!("{:?}", credential(10));
        assert!(!rendered.contains("access-0"));
        assert!(!rendered.contains("refresh-0"));
    }
}
