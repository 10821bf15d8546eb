//! Database Provisioning
//!
//! CouchDB's `couch_peruser` creates a database per user some time after the
//! user record is written. This module derives that database's name and waits
//! for it to show up.

use tracing::{debug, info, warn};

use crate::client::{ApiError, Reply, SessionClient};
use crate::retry::{retry, RetryError, RetryPolicy};

pub const USER_DB_PREFIX: &str = "userdb-";

/// Reasons CouchDB gives while a per-user database exists but its security
/// object has not been written yet.
const PENDING_FORBIDDEN_REASONS: [&str; 2] = [
    "You are not allowed to access this db.",
    "_reader access is required for this request",
];

/// Name of the per-user database: `userdb-` followed by the hex-encoded UTF-8 username.
pub fn user_db_name(username: &str) -> Option<String> {
    if username.is_empty() {
        return None;
    }
    Some(format!("{}{}", USER_DB_PREFIX, hex::encode(username.as_bytes())))
}

/// Absolute URL of the per-user database under `base_url` (which ends with `/`).
pub fn user_db_url(base_url: &str, username: &str) -> Option<String> {
    user_db_name(username).map(|name| format!("{}{}", base_url, name))
}

/// Result of probing a user database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStatus {
    /// The server has not finished creating the database.
    Provisioning,
    Ready,
}

/// Classify a database info response.
pub fn classify<T>(reply: &Reply<T>) -> DbStatus {
    let Some(err) = reply.failure() else {
        return DbStatus::Ready;
    };

    let pending = match err.error.as_str() {
        "not_found" => true,
        "forbidden" => err
            .reason
            .as_deref()
            .is_some_and(|reason| PENDING_FORBIDDEN_REASONS.contains(&reason)),
        _ => false,
    };

    if pending {
        DbStatus::Provisioning
    } else {
        DbStatus::Ready
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Cannot derive a user database for an empty username")]
    NoUsername,

    #[error("User database {db} was not ready after {attempts} attempts")]
    NotReady { db: String, attempts: u32 },
}

#[derive(Debug, thiserror::Error)]
enum CheckError {
    #[error("database is still being provisioned")]
    Pending,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Poll the user's database until it is ready or the policy gives up.
pub async fn wait_for_user_db(
    client: &SessionClient,
    username: &str,
    policy: &RetryPolicy,
) -> Result<(), ProvisionError> {
    let url = user_db_url(client.base_url(), username).ok_or(ProvisionError::NoUsername)?;

    let result = retry(policy, |attempt| {
        let url = url.as_str();
        async move {
            debug!("Checking for user database (attempt {}): {}", attempt, url);
            let reply = client.db_info(url).await?;
            match classify(&reply) {
                DbStatus::Ready => Ok::<(), CheckError>(()),
                DbStatus::Provisioning => Err(CheckError::Pending),
            }
        }
    })
    .await;

    match result {
        Ok(()) => {
            info!("User database for {} is ready", username);
            Ok(())
        }
        Err(RetryError::Exhausted { attempts, last }) => {
            warn!("Reached maximum number of checks for the user database: {}", last);
            Err(ProvisionError::NotReady {
                db: user_db_name(username).unwrap_or_default(),
                attempts,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CouchError;
    use crate::retry::Backoff;
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn failure(error: &str, reason: Option<&str>) -> Reply<Value> {
        Reply::Failure(CouchError {
            error: error.to_string(),
            reason: reason.map(str::to_string),
        })
    }

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Backoff::Fixed(Duration::from_millis(5)))
    }

    #[test]
    fn user_db_name_is_hex_of_username() {
        assert_eq!(user_db_name("alice").as_deref(), Some("userdb-616c696365"));
        assert_eq!(user_db_name("é").as_deref(), Some("userdb-c3a9"));
        assert_eq!(user_db_name(""), None);
    }

    #[test]
    fn user_db_url_appends_to_base() {
        assert_eq!(
            user_db_url("http://localhost:5984/", "bob").as_deref(),
            Some("http://localhost:5984/userdb-626f62")
        );
    }

    #[test]
    fn not_found_and_pending_forbidden_are_retryable() {
        assert_eq!(classify(&failure("not_found", None)), DbStatus::Provisioning);
        assert_eq!(
            classify(&failure("forbidden", Some("You are not allowed to access this db."))),
            DbStatus::Provisioning
        );
        assert_eq!(
            classify(&failure(
                "forbidden",
                Some("_reader access is required for this request")
            )),
            DbStatus::Provisioning
        );
    }

    #[test]
    fn everything_else_is_ready() {
        assert_eq!(classify(&failure("forbidden", Some("nope"))), DbStatus::Ready);
        assert_eq!(classify(&failure("forbidden", None)), DbStatus::Ready);
        assert_eq!(classify(&failure("unauthorized", None)), DbStatus::Ready);
        assert_eq!(
            classify(&Reply::Success(json!({"db_name": "userdb-616c696365"}))),
            DbStatus::Ready
        );
    }

    #[tokio::test]
    async fn waits_until_database_appears() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userdb-616c696365"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": "not_found", "reason": "Database does not exist."
            })))
            .up_to_n_times(2)
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/userdb-616c696365"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"db_name": "userdb-616c696365"})),
            )
            .mount(&mock)
            .await;

        let client = SessionClient::new(&format!("{}/", mock.uri())).unwrap();
        wait_for_user_db(&client, "alice", &quick(5)).await.unwrap();

        let requests = mock.received_requests().await.unwrap();
        assert_eq!(requests.len(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/userdb-616c696365"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": "forbidden", "reason": "You are not allowed to access this db."
            })))
            .expect(3)
            .mount(&mock)
            .await;

        let client = SessionClient::new(&format!("{}/", mock.uri())).unwrap();
        let err = wait_for_user_db(&client, "alice", &quick(3)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NotReady { attempts: 3, .. }));
    }
}
