//! Presentation contract.
//!
//! Screens are pure: they turn an [`AuthContext`] into output and never talk
//! to the network or a store. Forms own only their field values and hand
//! submission to the controller.

use std::sync::Arc;

use crate::auth::{AuthContext, User};
use crate::controller::Authentication;
use crate::store::DocumentStore;

/// Something that can draw itself from the current session.
pub trait Screen: Send {
    fn render(&self, context: &AuthContext) -> String;
}

/// Builds a fresh screen each time one is shown.
pub type ScreenFactory = Arc<dyn Fn() -> Box<dyn Screen> + Send + Sync>;

/// Wrap a constructor as a [`ScreenFactory`].
pub fn factory<S, F>(make: F) -> ScreenFactory
where
    S: Screen + 'static,
    F: Fn() -> S + Send + Sync + 'static,
{
    Arc::new(move || Box::new(make()) as Box<dyn Screen>)
}

/// The screens the controller switches between.
#[derive(Clone)]
pub struct Screens {
    pub login: ScreenFactory,
    pub sign_up: ScreenFactory,
    pub loading: ScreenFactory,
    /// The application shown once authenticated.
    pub children: ScreenFactory,
}

impl Default for Screens {
    fn default() -> Self {
        Self {
            login: factory(|| LoginScreen),
            sign_up: factory(|| SignUpScreen),
            loading: factory(|| LoadingScreen),
            children: factory(|| HomeScreen),
        }
    }
}

pub struct LoadingScreen;

impl Screen for LoadingScreen {
    fn render(&self, _context: &AuthContext) -> String {
        "Loading...".to_string()
    }
}

fn with_error(mut out: String, context: &AuthContext) -> String {
    if let Some(error) = &context.error {
        out.push_str(&format!("\n  error: {}", error));
    }
    if context.authenticating {
        out.push_str("\n  working...");
    }
    out
}

pub struct LoginScreen;

impl Screen for LoginScreen {
    fn render(&self, context: &AuthContext) -> String {
        with_error(
            "== Login ==\n  login <username> <password>\n  goto signup".to_string(),
            context,
        )
    }
}

pub struct SignUpScreen;

impl Screen for SignUpScreen {
    fn render(&self, context: &AuthContext) -> String {
        with_error(
            "== Sign Up ==\n  signup <username> <password> <email>\n  goto login".to_string(),
            context,
        )
    }
}

pub struct HomeScreen;

impl Screen for HomeScreen {
    fn render(&self, context: &AuthContext) -> String {
        match &context.user {
            Some(user) => format!("Logged in as {}\n  logout", user.name),
            None => String::new(),
        }
    }
}

/// Run `f` only while authenticated.
pub fn authenticated<T>(context: &AuthContext, f: impl FnOnce() -> T) -> Option<T> {
    context.authenticated.then(f)
}

/// Run `f` only while unauthenticated.
pub fn unauthenticated<T>(context: &AuthContext, f: impl FnOnce() -> T) -> Option<T> {
    (!context.authenticated).then(f)
}

/// What an authenticated application gets handed.
#[derive(Clone)]
pub struct AppProps {
    pub db: Arc<dyn DocumentStore>,
    pub remote_db: Option<Arc<dyn DocumentStore>>,
    pub user: User,
}

/// Controlled login form.
#[derive(Debug, Default, Clone)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

impl LoginForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    pub async fn submit(&self, auth: &Authentication) {
        auth.login(&self.username, &self.password).await;
    }
}

/// Controlled signup form.
#[derive(Debug, Default, Clone)]
pub struct SignUpForm {
    pub username: String,
    pub password: String,
    pub email: String,
}

impl SignUpForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    pub fn set_email(&mut self, email: impl Into<String>) {
        self.email = email.into();
    }

    pub async fn submit(&self, auth: &Authentication) {
        auth.sign_up(&self.username, &self.password, &self.email).await;
    }
}
