//! Authentication Module
//!
//! Session data model: who is logged in, which screen is showing, and the
//! snapshot handed to views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Prefix of user documents in the `_users` database.
pub const USER_ID_PREFIX: &str = "org.couchdb.user:";

/// Document id of a user record.
pub fn user_doc_id(username: &str) -> String {
    format!("{}{}", USER_ID_PREFIX, username)
}

/// Extra fields stored on the user record at signup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Authenticated user as reported by CouchDB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<UserMetadata>,
}

impl User {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
            metadata: None,
        }
    }

    pub fn email(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.email.as_deref())
    }
}

/// Which unauthenticated screen is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    #[default]
    Login,
    SignUp,
}

/// What the controller should currently draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    /// The initial session check has not finished.
    Loading,
    Unauthenticated(Route),
    /// A login or signup is in flight.
    Authenticating,
    Authenticated,
}

/// Mutable session state owned by the controller.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    loaded: bool,
    authenticated: bool,
    authenticating: bool,
    user: Option<User>,
    error: Option<String>,
    route: Route,
    last_checked: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a session check.
    pub fn set_checked(&mut self, user: Option<User>) {
        self.loaded = true;
        self.authenticated = user.is_some();
        self.user = user;
        self.last_checked = Some(Utc::now());
    }

    /// Record a background check that could not reach the server.
    pub fn set_check_failed(&mut self) {
        self.loaded = true;
        self.authenticated = false;
        self.user = None;
        self.last_checked = Some(Utc::now());
    }

    /// Set the current session after a successful login.
    pub fn set_session(&mut self, user: User) {
        info!("Session set for user: {}", user.name);
        self.loaded = true;
        self.authenticated = true;
        self.user = Some(user);
        self.error = None;
    }

    /// Mark a failed login without touching the user.
    pub fn set_rejected(&mut self, error: Option<String>) {
        self.authenticated = false;
        self.error = error;
    }

    /// Forget the user after a login that never reached the server.
    pub fn set_signed_out(&mut self) {
        self.authenticated = false;
        self.user = None;
    }

    /// Clear the current session and return to the login screen.
    pub fn clear_session(&mut self) {
        info!("Session cleared");
        self.authenticated = false;
        self.user = None;
        self.route = Route::Login;
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
    }

    pub fn set_authenticating(&mut self, authenticating: bool) {
        self.authenticating = authenticating;
    }

    /// Switch screens; any visible error belongs to the old screen.
    pub fn navigate(&mut self, route: Route) {
        self.route = route;
        self.error = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn render_state(&self) -> RenderState {
        render_state(self.loaded, self.authenticated, self.authenticating, self.route)
    }

    /// Snapshot for views.
    pub fn context(&self) -> AuthContext {
        AuthContext {
            loaded: self.loaded,
            authenticated: self.authenticated,
            authenticating: self.authenticating,
            user: self.user.clone(),
            error: self.error.clone(),
            route: self.route,
            last_checked: self.last_checked,
        }
    }
}

/// Read-only view of the session handed to screens.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub loaded: bool,
    pub authenticated: bool,
    pub authenticating: bool,
    pub user: Option<User>,
    pub error: Option<String>,
    pub route: Route,
    pub last_checked: Option<DateTime<Utc>>,
}

impl AuthContext {
    pub fn render_state(&self) -> RenderState {
        render_state(self.loaded, self.authenticated, self.authenticating, self.route)
    }
}

fn render_state(loaded: bool, authenticated: bool, authenticating: bool, route: Route) -> RenderState {
    if !loaded {
        RenderState::Loading
    } else if authenticated {
        RenderState::Authenticated
    } else if authenticating {
        RenderState::Authenticating
    } else {
        RenderState::Unauthenticated(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_loading_on_login_route() {
        let state = SessionState::new();
        assert_eq!(state.render_state(), RenderState::Loading);
        assert_eq!(state.route(), Route::Login);
        assert!(!state.is_authenticated());
    }

    #[test]
    fn check_without_user_lands_on_login() {
        let mut state = SessionState::new();
        state.set_checked(None);
        assert_eq!(state.render_state(), RenderState::Unauthenticated(Route::Login));
    }

    #[test]
    fn navigation_clears_error() {
        let mut state = SessionState::new();
        state.set_checked(None);
        state.set_error("Invalid login");

        state.navigate(Route::SignUp);
        assert_eq!(state.context().error, None);
        assert_eq!(state.render_state(), RenderState::Unauthenticated(Route::SignUp));

        state.set_error("Username, password and email are required fields.");
        state.navigate(Route::Login);
        assert_eq!(state.context().error, None);
    }

    #[test]
    fn clear_session_resets_route() {
        let mut state = SessionState::new();
        state.navigate(Route::SignUp);
        state.set_session(User::named("alice"));
        assert_eq!(state.render_state(), RenderState::Authenticated);

        state.clear_session();
        assert_eq!(state.route(), Route::Login);
        assert!(state.user().is_none());
    }

    #[test]
    fn authenticating_only_shows_once_loaded() {
        let mut state = SessionState::new();
        state.set_authenticating(true);
        assert_eq!(state.render_state(), RenderState::Loading);

        state.set_checked(None);
        assert_eq!(state.render_state(), RenderState::Authenticating);
    }

    #[test]
    fn user_doc_id_uses_couch_prefix() {
        assert_eq!(user_doc_id("alice"), "org.couchdb.user:alice");
    }
}
