//! CouchDB Auth - Terminal Entry Point
//!
//! Wraps a small terminal app behind CouchDB authentication and keeps the
//! user's database replicated locally.

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use couch_auth::{
    commands::{self, Command, Flow},
    config::AuthConfig,
    controller::Authentication,
    logging,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AuthConfig::from_env().context("Invalid configuration")?;

    logging::init(config.debug);
    info!("CouchDB Auth starting...");

    let auth = Authentication::new(config).context("Could not start authentication")?;

    println!("{}", auth.render());
    auth.mount().await;
    println!("{}", auth.render());

    // Session changes from the periodic check land between commands.
    let watcher = {
        let auth = auth.clone();
        let mut updates = auth.subscribe();
        tokio::spawn(async move {
            let mut authenticated = updates.borrow().authenticated;
            while updates.changed().await.is_ok() {
                let now = updates.borrow_and_update().authenticated;
                if now != authenticated {
                    authenticated = now;
                    println!("{}", auth.render());
                }
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read input: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        match commands::dispatch(&auth, command).await {
            Flow::Render => println!("{}", auth.render()),
            Flow::Print(text) => println!("{}", text),
            Flow::Quit => break,
        }
    }

    watcher.abort();
    auth.unmount().await;
    info!("CouchDB Auth stopped");
    Ok(())
}
