//! Commands Module
//!
//! Line commands driving the controller from a terminal.

use std::str::FromStr;

use thiserror::Error;
use tracing::debug;

use crate::auth::Route;
use crate::controller::Authentication;
use crate::view::{LoginForm, SignUpForm};

pub const HELP: &str = "\
commands:
  login <username> <password>
  signup <username> <password> <email>
  logout
  goto login | goto signup
  status
  help
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { username: String, password: String },
    SignUp { username: String, password: String, email: String },
    Logout,
    Goto(Route),
    Status,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Err(CommandError::Empty);
        };
        let args: Vec<String> = words.map(str::to_string).collect();

        // Missing fields are passed through empty so the controller can
        // report them the same way a blank form would.
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();

        match name.to_ascii_lowercase().as_str() {
            "login" if args.len() <= 2 => Ok(Command::Login {
                username: arg(0),
                password: arg(1),
            }),
            "login" => Err(CommandError::Usage("login <username> <password>")),
            "signup" | "sign-up" if args.len() <= 3 => Ok(Command::SignUp {
                username: arg(0),
                password: arg(1),
                email: arg(2),
            }),
            "signup" | "sign-up" => Err(CommandError::Usage("signup <username> <password> <email>")),
            "logout" => Ok(Command::Logout),
            "goto" => match args.first().map(|s| s.to_ascii_lowercase()).as_deref() {
                Some("login") => Ok(Command::Goto(Route::Login)),
                Some("signup") | Some("sign-up") => Ok(Command::Goto(Route::SignUp)),
                _ => Err(CommandError::Usage("goto login | goto signup")),
            },
            "status" => Ok(Command::Status),
            "help" | "?" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

/// What the terminal should do after a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Redraw the current screen.
    Render,
    Print(String),
    Quit,
}

pub async fn dispatch(auth: &Authentication, command: Command) -> Flow {
    debug!("Dispatching {:?}", redacted(&command));

    match command {
        Command::Login { username, password } => {
            let mut form = LoginForm::new();
            form.set_username(username);
            form.set_password(password);
            form.submit(auth).await;
            Flow::Render
        }
        Command::SignUp {
            username,
            password,
            email,
        } => {
            let mut form = SignUpForm::new();
            form.set_username(username);
            form.set_password(password);
            form.set_email(email);
            form.submit(auth).await;
            Flow::Render
        }
        Command::Logout => {
            auth.logout().await;
            Flow::Render
        }
        Command::Goto(Route::Login) => {
            auth.navigate_to_login();
            Flow::Render
        }
        Command::Goto(Route::SignUp) => {
            auth.navigate_to_sign_up();
            Flow::Render
        }
        Command::Status => Flow::Print(status(auth)),
        Command::Help => Flow::Print(HELP.to_string()),
        Command::Quit => Flow::Quit,
    }
}

fn status(auth: &Authentication) -> String {
    let context = auth.context();
    let mut lines = vec![format!("state: {:?}", context.render_state())];

    if let Some(user) = &context.user {
        lines.push(format!("user: {}", user.name));
        if !user.roles.is_empty() {
            lines.push(format!("roles: {}", user.roles.join(", ")));
        }
    }
    if let Some(remote) = auth.remote_db() {
        lines.push(format!("remote: {}", remote.name()));
    }
    lines.push(format!("syncing: {}", auth.is_syncing()));
    if let Some(checked) = context.last_checked {
        lines.push(format!("last checked: {}", checked.to_rfc3339()));
    }
    lines.join("\n")
}

fn redacted(command: &Command) -> Command {
    match command {
        Command::Login { username, .. } => Command::Login {
            username: username.clone(),
            password: "***".into(),
        },
        Command::SignUp { username, email, .. } => Command::SignUp {
            username: username.clone(),
            password: "***".into(),
            email: email.clone(),
        },
        other => other.clone(),
    }
}
