use std::sync::Arc;

use tokio::{
    sync::{Mutex, RwLock},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ExpiringToken, TokenProvider, TransientError};

/// Tokens with less than this left to live are refreshed before use.
pub const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// What to do with a cached token when refreshing it failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StalePolicy {
    /// Fail the call.
    #[default]
    Reject,
    /// Keep handing out the cached token while it has not actually expired,
    /// as long as the failure is transient.
    AllowOnTransient,
}

/// Caches one access token and serializes refreshes of it.
///
/// Clones share the same cache.
pub struct TokenManager<Provider>
where
    Provider: TokenProvider,
{
    inner: Arc<Inner<Provider>>,
}

impl<Provider: TokenProvider> Clone for TokenManager<Provider> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<Provider>
where
    Provider: TokenProvider,
{
    provider: Provider,
    state: RwLock<State<Provider::Error>>,
    // Held for the whole duration of a refresh.
    refresh_lock: Arc<Mutex<()>>,
    expiry_margin: Duration,
    stale_policy: StalePolicy,
}

struct State<E> {
    token: Option<Record>,
    // Bumped every time a refresh completes, successfully or not.
    generation: u64,
    last_refresh: Option<Result<Record, Arc<E>>>,
}

impl<E> State<E> {
    fn completed_since(&self, generation: u64) -> Option<Result<Record, Arc<E>>> {
        if self.generation == generation {
            return None;
        }
        self.last_refresh.clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error<RenewalError> {
    #[error("unable to refresh access token: {0}")]
    Unrefreshable(#[source] Arc<RenewalError>),
    #[error("cancelled while waiting for an access token")]
    Cancelled,
    #[error("refresh task: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    pub access_token: String,
    pub expires_at: Instant,
    pub account: Option<String>,
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("access_token", &"[censored]")
            .field("expires_at", &self.expires_at)
            .field("account", &self.account)
            .finish()
    }
}

impl Record {
    pub fn from_expiring_token<T: ExpiringToken>(token: T) -> Self {
        Self {
            access_token: token.access_token().to_owned(),
            expires_at: token.expires_at(),
            account: token.account().map(str::to_owned),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }

    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at <= Instant::now() + margin
    }
}

impl<Provider> Inner<Provider>
where
    Provider: TokenProvider,
    Provider::Token: ExpiringToken,
    Provider::Error: std::error::Error,
{
    async fn refresh(&self) -> Result<Record, Arc<Provider::Error>> {
        let result = self
            .provider
            .get_auth_token()
            .await
            .map(Record::from_expiring_token)
            .map_err(Arc::new);

        let mut state = self.state.write().await;
        state.generation = state.generation.wrapping_add(1);
        match &result {
            Ok(record) => {
                debug!(message = "Got new token", token_expires_at = ?record.expires_at);
                state.token = Some(record.clone());
            }
            Err(err) => {
                warn!(
                    message = "Token refresh failed",
                    error = %err,
                    token_is_stale = state.token.is_some(),
                );
            }
        }
        state.last_refresh = Some(result.clone());

        result
    }
}

impl<Provider> TokenManager<Provider>
where
    Provider: TokenProvider + 'static,
    Provider::Token: ExpiringToken,
    Provider::Error: std::error::Error + TransientError + 'static,
{
    pub fn new(provider: Provider) -> Self {
        Self::with_options(provider, DEFAULT_EXPIRY_MARGIN, StalePolicy::default())
    }

    pub fn with_options(
        provider: Provider,
        expiry_margin: Duration,
        stale_policy: StalePolicy,
    ) -> Self {
        let state = RwLock::new(State {
            token: None,
            generation: 0,
            last_refresh: None,
        });
        let inner = Inner {
            provider,
            state,
            refresh_lock: Arc::new(Mutex::new(())),
            expiry_margin,
            stale_policy,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The cached token, fresh or not. Never refreshes.
    pub async fn cached(&self) -> Option<Record> {
        self.inner.state.read().await.token.clone()
    }

    /// Returns the cached token, refreshing it first when it is missing or
    /// about to expire.
    pub async fn get_token(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Record, Error<Provider::Error>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (cached, generation) = {
            let state = self.inner.state.read().await;
            (state.token.clone(), state.generation)
        };

        match &cached {
            Some(record) if !record.expires_within(self.inner.expiry_margin) => {
                debug!(message = "Using preexisting token", token_expires_at = ?record.expires_at);
                return Ok(record.clone());
            }
            Some(record) => {
                debug!(message = "Existing token expiring, refreshing", token_expires_at = ?record.expires_at);
            }
            None => {
                info!(message = "No token cached yet, about to get a new one");
            }
        }

        match self.refresh_after(generation, cancel).await {
            Err(Error::Unrefreshable(err)) => self.fall_back(cached, err),
            result => result,
        }
    }

    /// Fetches a new token regardless of the cached one.
    pub async fn refresh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Record, Error<Provider::Error>> {
        let generation = self.inner.state.read().await.generation;
        self.refresh_after(generation, cancel).await
    }

    // Refreshes unless a refresh completed after `seen_generation` was read,
    // in which case that outcome is returned instead.
    async fn refresh_after(
        &self,
        seen_generation: u64,
        cancel: &CancellationToken,
    ) -> Result<Record, Error<Provider::Error>> {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = Arc::clone(&self.inner.refresh_lock).lock_owned() => guard,
        };

        if let Some(outcome) = self
            .inner
            .state
            .read()
            .await
            .completed_since(seen_generation)
        {
            debug!(message = "Reusing refresh completed while waiting");
            return outcome.map_err(Error::Unrefreshable);
        }

        // The refresh outlives a cancelled caller and releases the lock itself.
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.refresh().await;
            drop(guard);
            result
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(message = "Caller cancelled, refresh continues in the background");
                Err(Error::Cancelled)
            }
            joined = task => joined?.map_err(Error::Unrefreshable),
        }
    }

    fn fall_back(
        &self,
        cached: Option<Record>,
        err: Arc<Provider::Error>,
    ) -> Result<Record, Error<Provider::Error>> {
        if self.inner.stale_policy == StalePolicy::AllowOnTransient && err.is_transient() {
            if let Some(record) = cached.filter(|record| !record.is_expired()) {
                warn!(
                    message = "Using existing token despite transient refresh failure",
                    token_expires_at = ?record.expires_at,
                );
                return Ok(record);
            }
        }
        Err(Error::Unrefreshable(err))
    }
}
