//! Authentication Controller
//!
//! Owns the session state, the local store and the user's remote link, and
//! mediates every transition between them:
//!
//! ```text
//! Loading -> Unauthenticated(Login | SignUp) -> Authenticating -> Authenticated
//! ```
//!
//! Actions never return errors. Each one ends by updating the session state,
//! which views read through [`Authentication::context`] or
//! [`Authentication::subscribe`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthContext, RenderState, Route, SessionState, User};
use crate::client::{ApiError, Reply, SessionClient, UserDoc};
use crate::config::{AuthConfig, ConfigError};
use crate::provision;
use crate::storage::{CredentialStore, Credentials, NoRemember, SecureStorage};
use crate::store::{DefaultStores, DocumentStore, StoreFactory};
use crate::sync::{ChangesSync, SyncEngine, SyncEvent, SyncHandle, SyncOptions};
use crate::view::{AppProps, Screens};

pub const INVALID_LOGIN: &str = "Invalid login";
pub const REQUIRED_FIELDS: &str = "Username, password and email are required fields.";
pub const UNKNOWN_ERROR: &str = "An unknown error has occurred";
pub const SIGNUP_FAILED: &str = "An error occurred while signing up";
pub const USER_DB_NOT_READY: &str = "Your user database is not setup yet, please try again later.";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The user's remote database and the replication feeding it.
struct RemoteLink {
    db: Arc<dyn DocumentStore>,
    sync: Option<SyncHandle>,
}

impl RemoteLink {
    async fn release(mut self) {
        if let Some(sync) = self.sync.take() {
            sync.cancel();
        }
        if let Err(e) = self.db.close().await {
            error!("Failed to close remote database: {}", e);
        }
    }
}

struct Inner {
    config: AuthConfig,
    base_url: String,
    client: SessionClient,
    stores: Arc<dyn StoreFactory>,
    sync_engine: Arc<dyn SyncEngine>,
    credentials: Arc<dyn CredentialStore>,
    screens: Screens,
    state: Mutex<SessionState>,
    local_db: Mutex<Arc<dyn DocumentStore>>,
    remote: Mutex<Option<RemoteLink>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    updates: watch::Sender<AuthContext>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Builder for [`Authentication`] with injectable collaborators.
pub struct AuthenticationBuilder {
    config: AuthConfig,
    screens: Option<Screens>,
    stores: Option<Arc<dyn StoreFactory>>,
    sync_engine: Option<Arc<dyn SyncEngine>>,
    credentials: Option<Arc<dyn CredentialStore>>,
}

impl AuthenticationBuilder {
    pub fn screens(mut self, screens: Screens) -> Self {
        self.screens = Some(screens);
        self
    }

    pub fn stores(mut self, stores: Arc<dyn StoreFactory>) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn sync_engine(mut self, engine: Arc<dyn SyncEngine>) -> Self {
        self.sync_engine = Some(engine);
        self
    }

    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Validate the configuration and open the local store.
    pub fn build(self) -> Result<Authentication, ConfigError> {
        let base_url = self.config.base_url()?;
        let client = SessionClient::new(&base_url).map_err(|e| ConfigError::Client(e.to_string()))?;

        let stores: Arc<dyn StoreFactory> = match self.stores {
            Some(stores) => stores,
            None => Arc::new(DefaultStores::new(client.http().clone())),
        };
        let sync_engine: Arc<dyn SyncEngine> = match self.sync_engine {
            Some(engine) => engine,
            None => Arc::new(ChangesSync),
        };
        let credentials: Arc<dyn CredentialStore> = match self.credentials {
            Some(store) => store,
            None if self.config.remember => Arc::new(SecureStorage::new()),
            None => Arc::new(NoRemember),
        };

        let local_db = stores
            .open_local(self.config.adapter, &self.config.local_db_name)
            .map_err(|e| ConfigError::LocalStore(e.to_string()))?;

        let state = SessionState::new();
        let (updates, _) = watch::channel(state.context());

        Ok(Authentication {
            inner: Arc::new(Inner {
                config: self.config,
                base_url,
                client,
                stores,
                sync_engine,
                credentials,
                screens: self.screens.unwrap_or_default(),
                state: Mutex::new(state),
                local_db: Mutex::new(local_db),
                remote: Mutex::new(None),
                timer: Mutex::new(None),
                shutdown: CancellationToken::new(),
                updates,
            }),
        })
    }
}

/// Wraps an application behind CouchDB authentication and keeps the user's
/// database replicated locally.
#[derive(Clone)]
pub struct Authentication {
    inner: Arc<Inner>,
}

impl Authentication {
    /// Controller with the stock stores, sync engine and screens.
    pub fn new(config: AuthConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build()
    }

    pub fn builder(config: AuthConfig) -> AuthenticationBuilder {
        AuthenticationBuilder {
            config,
            screens: None,
            stores: None,
            sync_engine: None,
            credentials: None,
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.inner.config
    }

    fn is_live(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    fn update<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let (result, context) = {
            let mut state = lock(&self.inner.state);
            let result = f(&mut state);
            (result, state.context())
        };
        self.inner.updates.send_replace(context);
        result
    }

    // Lifecycle

    /// Run the initial session check, log back in with remembered
    /// credentials if needed, then start the periodic re-check.
    pub async fn mount(&self) {
        self.check_session().await;
        if !self.is_live() {
            return;
        }

        if !self.context().authenticated {
            self.login_remembered().await;
        }

        self.start_timer();
    }

    fn start_timer(&self) {
        let period = self.inner.config.session_interval;
        if period.is_zero() {
            debug!("Periodic session check disabled");
            return;
        }

        let mut timer = lock(&self.inner.timer);
        if timer.is_some() || !self.is_live() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        *timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Authentication { inner }.check_session().await;
            }
            debug!("Session check timer stopped");
        }));
    }

    /// Stop the timer, cancel replication and close the remote database.
    ///
    /// Every step runs even if an earlier one fails. Actions still in flight
    /// finish, but their results are discarded.
    pub async fn unmount(&self) {
        self.inner.shutdown.cancel();

        let timer = lock(&self.inner.timer).take();
        if let Some(timer) = timer {
            timer.abort();
        }

        let link = lock(&self.inner.remote).take();
        if let Some(link) = link {
            link.release().await;
        }

        info!("Authentication unmounted");
    }

    // Session

    /// Ask the server who is logged in and reconcile local state.
    pub async fn check_session(&self) {
        if !self.is_live() {
            return;
        }

        match self.grab_session().await {
            Ok(user) => {
                if !self.is_live() {
                    debug!("Discarding session check after teardown");
                    return;
                }
                debug!("User session {:?}", user);

                let logged_in = user.is_some();
                self.update(|state| state.set_checked(user));

                if logged_in && !self.has_remote() {
                    info!("User is already logged in, setting up db.");
                    self.setup_db(None);

                    // Load the full user document now that the remote exists.
                    if let Ok(Some(user)) = self.grab_session().await {
                        if self.is_live() {
                            self.update(|state| state.set_checked(Some(user)));
                        }
                    }
                } else if !logged_in {
                    self.release_remote().await;
                }
            }
            Err(e) => {
                warn!("Session check failed: {}", e);
                if self.is_live() {
                    self.update(|state| state.set_check_failed());
                }
            }
        }
    }

    /// Current identity: the user document when a remote link exists,
    /// otherwise (or if that fails) the session endpoint.
    async fn grab_session(&self) -> Result<Option<User>, ApiError> {
        let known = if self.has_remote() {
            lock(&self.inner.state).user().map(|user| user.name.clone())
        } else {
            None
        };

        if let Some(name) = known {
            match self.inner.client.get_user(&name).await {
                Ok(Reply::Success(user)) => return Ok(Some(user)),
                Ok(Reply::Failure(e)) => debug!("User document unavailable ({}), using _session", e),
                Err(e) => debug!("User document unavailable ({}), using _session", e),
            }
        }

        match self.inner.client.get_session().await? {
            Reply::Success(session) => Ok(session.user_ctx.into_user()),
            Reply::Failure(e) => Err(ApiError::Server(e.to_string())),
        }
    }

    async fn login_remembered(&self) {
        match self.inner.credentials.credentials() {
            Ok(Some(creds)) => {
                info!("Logging in with remembered credentials for {}", creds.username);
                self.login(&creds.username, &creds.password).await;
            }
            Ok(None) => {}
            Err(e) => warn!("Could not read remembered credentials: {}", e),
        }
    }

    // Actions

    /// Exchange credentials for a session and set up the user's database.
    pub async fn login(&self, username: &str, password: &str) {
        if username.is_empty() || password.is_empty() {
            self.update(|state| state.set_error(INVALID_LOGIN));
            return;
        }

        self.update(|state| state.set_authenticating(true));
        let result = self.inner.client.post_session(username, password).await;
        if !self.is_live() {
            return;
        }

        match result {
            Ok(Reply::Success(user)) => {
                self.update(|state| {
                    state.set_authenticating(false);
                    state.set_session(user);
                });

                let creds = Credentials::new(username, password);
                if let Err(e) = self.inner.credentials.set_credentials(&creds) {
                    error!("Could not store credentials: {}", e);
                }

                // Inline credentials keep replication working where session
                // cookies are not sent cross-origin.
                self.setup_db(Some(creds));
            }
            Ok(Reply::Failure(err)) => {
                info!("Login rejected: {}", err.error);
                self.update(|state| {
                    state.set_authenticating(false);
                    state.set_rejected(Some(err.message().to_string()));
                });
            }
            Err(e) => {
                error!("Login failed: {}", e);
                self.update(|state| {
                    state.set_authenticating(false);
                    state.set_signed_out();
                });
            }
        }
    }

    /// End the session. A failed request is logged and changes nothing.
    pub async fn logout(&self) {
        info!("Logging out...");

        match self.inner.client.delete_session().await {
            Ok(reply) => {
                if let Some(err) = reply.failure() {
                    warn!("Server reported an error ending the session: {}", err);
                }
            }
            Err(e) => {
                error!("Unable to logout: {}", e);
                return;
            }
        }
        if !self.is_live() {
            return;
        }

        self.update(|state| state.clear_session());

        if let Err(e) = self.inner.credentials.clear_credentials() {
            error!("Could not reset credentials: {}", e);
        }

        self.release_remote().await;

        if self.inner.config.reset_local_on_logout {
            self.reset_local().await;
        }
    }

    /// Create an account, wait for its database, then log in.
    pub async fn sign_up(&self, username: &str, password: &str, email: &str) {
        if username.is_empty() || password.is_empty() || email.is_empty() {
            self.update(|state| state.set_error(REQUIRED_FIELDS));
            return;
        }

        info!("Signing up user {}", username);
        self.update(|state| state.set_authenticating(true));

        let result = self.inner.client.put_user(&UserDoc::new(username, password, email)).await;
        if !self.is_live() {
            return;
        }

        let failure = match result {
            Ok(Reply::Success(response)) if response.ok => None,
            Ok(Reply::Success(_)) => Some(UNKNOWN_ERROR.to_string()),
            Ok(Reply::Failure(err)) => {
                info!("Signup rejected: {}", err);
                Some(err.reason.unwrap_or_else(|| SIGNUP_FAILED.to_string()))
            }
            Err(e) => {
                error!("An error occurred signing up: {}", e);
                Some(SIGNUP_FAILED.to_string())
            }
        };
        if let Some(message) = failure {
            self.update(|state| {
                state.set_authenticating(false);
                state.set_error(message);
            });
            return;
        }

        let policy = self.inner.config.user_db_retry_policy();
        let waited = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return,
            waited = provision::wait_for_user_db(&self.inner.client, username, &policy) => waited,
        };

        if let Err(e) = waited {
            error!("Stopping signup for {}: {}", username, e);
            self.update(|state| {
                state.set_authenticating(false);
                state.navigate(Route::Login);
                state.set_error(USER_DB_NOT_READY);
            });
            return;
        }

        self.login(username, password).await;
    }

    /// Switch to the login screen and clear any error.
    pub fn navigate_to_login(&self) {
        self.update(|state| state.navigate(Route::Login));
    }

    /// Switch to the signup screen and clear any error.
    pub fn navigate_to_sign_up(&self) {
        self.update(|state| state.navigate(Route::SignUp));
    }

    // Databases

    fn has_remote(&self) -> bool {
        lock(&self.inner.remote).is_some()
    }

    /// Open the user's remote database and start replication. Does nothing
    /// if a remote link already exists.
    fn setup_db(&self, credentials: Option<Credentials>) {
        let Some(name) = lock(&self.inner.state).user().map(|user| user.name.clone()) else {
            return;
        };
        let Some(url) = provision::user_db_url(&self.inner.base_url, &name) else {
            return;
        };

        // unmount cancels before taking this lock
        let mut remote = lock(&self.inner.remote);
        if !self.is_live() {
            debug!("Skipping database setup after teardown");
            return;
        }
        if remote.is_some() {
            debug!("Remote database already set up");
            return;
        }

        let db = match self.inner.stores.open_remote(&url, credentials.as_ref()) {
            Ok(db) => db,
            Err(e) => {
                error!("Could not open remote database {}: {}", url, e);
                return;
            }
        };

        let sync = if self.inner.config.sync {
            let local = lock(&self.inner.local_db).clone();
            let mut handle = self.inner.sync_engine.sync(local, db.clone(), SyncOptions::default());
            if let Some(events) = handle.take_events() {
                tokio::spawn(log_sync_events(events));
            }
            info!("Syncing local database with {}", url);
            Some(handle)
        } else {
            info!("Sync is disabled");
            None
        };

        *remote = Some(RemoteLink { db, sync });
    }

    async fn release_remote(&self) {
        let link = lock(&self.inner.remote).take();
        if let Some(link) = link {
            info!("Releasing remote database {}", link.db.name());
            link.release().await;
        }
    }

    async fn reset_local(&self) {
        let old = lock(&self.inner.local_db).clone();
        if let Err(e) = old.destroy().await {
            error!("Could not destroy local database: {}", e);
            return;
        }

        match self
            .inner
            .stores
            .open_local(self.inner.config.adapter, &self.inner.config.local_db_name)
        {
            Ok(db) => *lock(&self.inner.local_db) = db,
            Err(e) => error!("Could not recreate local database: {}", e),
        }
    }

    // Views

    pub fn context(&self) -> AuthContext {
        lock(&self.inner.state).context()
    }

    pub fn render_state(&self) -> RenderState {
        lock(&self.inner.state).render_state()
    }

    /// Receive a snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<AuthContext> {
        self.inner.updates.subscribe()
    }

    /// The local store.
    pub fn db(&self) -> Arc<dyn DocumentStore> {
        lock(&self.inner.local_db).clone()
    }

    /// The user's remote database, once set up.
    pub fn remote_db(&self) -> Option<Arc<dyn DocumentStore>> {
        lock(&self.inner.remote).as_ref().map(|link| link.db.clone())
    }

    pub fn is_syncing(&self) -> bool {
        lock(&self.inner.remote)
            .as_ref()
            .and_then(|link| link.sync.as_ref())
            .is_some_and(SyncHandle::is_active)
    }

    /// Databases and user for an authenticated application.
    pub fn props(&self) -> Option<AppProps> {
        let user = lock(&self.inner.state).user().cloned()?;
        Some(AppProps {
            db: self.db(),
            remote_db: self.remote_db(),
            user,
        })
    }

    /// Draw the screen for the current state.
    pub fn render(&self) -> String {
        let context = self.context();
        let screens = &self.inner.screens;

        let screen = match context.render_state() {
            RenderState::Loading => (screens.loading)(),
            _ if !self.inner.config.scaffold => (screens.children)(),
            RenderState::Authenticated => (screens.children)(),
            RenderState::Authenticating | RenderState::Unauthenticated(_) => match context.route {
                Route::Login => (screens.login)(),
                Route::SignUp => (screens.sign_up)(),
            },
        };
        screen.render(&context)
    }
}

async fn log_sync_events(mut events: mpsc::UnboundedReceiver<SyncEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            SyncEvent::Change { direction, docs } => debug!("Change: {:?} {} docs", direction, docs),
            SyncEvent::Paused => debug!("Syncing paused"),
            SyncEvent::Complete => info!("Sync complete"),
            SyncEvent::Error(e) => error!("Sync error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        let mut config = AuthConfig::new("http://localhost:5984");
        config.session_interval = std::time::Duration::ZERO;
        config.sync = false;
        config
    }

    #[tokio::test]
    async fn setup_db_opens_remote_while_live() {
        let auth = Authentication::new(config()).unwrap();
        auth.update(|state| state.set_session(User::named("alice")));

        auth.setup_db(None);
        let remote = auth.remote_db().unwrap();
        assert_eq!(remote.name(), "http://localhost:5984/userdb-616c696365");
        assert!(!auth.is_syncing());

        auth.unmount().await;
        assert!(auth.remote_db().is_none());
    }

    #[tokio::test]
    async fn setup_db_after_unmount_opens_nothing() {
        let auth = Authentication::new(config()).unwrap();
        auth.update(|state| state.set_session(User::named("alice")));

        auth.unmount().await;
        auth.setup_db(Some(Credentials::new("alice", "secret")));

        assert!(auth.remote_db().is_none());
        assert!(!auth.is_syncing());
    }
}
