//! Credential resolution
//!
//! The model only carries credential handles. Resolution happens here, at
//! connect time, so secrets never enter the model or the logs.

use std::collections::HashMap;
use std::fmt;

use ydp_common::model::{Credential, CredentialType};

use super::ConnectorError;

/// Resolved secret material
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    UserPassword { user: String, password: String },
    Token(String),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Secret::UserPassword { user, .. } => f
                .debug_struct("UserPassword")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            Secret::Token(_) => f.write_str("Token(***)"),
        }
    }
}

pub trait CredentialStore: Send + Sync {
    fn resolve(&self, credential: &Credential) -> Result<Secret, ConnectorError>;
}

/// Resolves credentials from `<NAME>_USER` / `<NAME>_PASSWORD` or
/// `<NAME>_TOKEN` environment variables
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialStore;

impl EnvCredentialStore {
    pub fn new() -> Self {
        Self
    }

    /// Environment variable name for `suffix` of credential `name`
    pub fn var_name(name: &str, suffix: &str) -> String {
        let stem: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("{}_{}", stem, suffix)
    }

    fn read(name: &str, suffix: &str) -> Result<String, ConnectorError> {
        let var = Self::var_name(name, suffix);
        std::env::var(&var)
            .map_err(|_| ConnectorError::Auth(format!("credential {}: {} is not set", name, var)))
    }
}

impl CredentialStore for EnvCredentialStore {
    fn resolve(&self, credential: &Credential) -> Result<Secret, ConnectorError> {
        match credential.kind {
            CredentialType::UserPassword => Ok(Secret::UserPassword {
                user: Self::read(&credential.name, "USER")?,
                password: Self::read(&credential.name, "PASSWORD")?,
            }),
            CredentialType::ApiToken => Ok(Secret::Token(Self::read(&credential.name, "TOKEN")?)),
        }
    }
}

/// Fixed credentials, keyed by handle name
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    secrets: HashMap<String, Secret>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, secret: Secret) -> Self {
        self.secrets.insert(name.into(), secret);
        self
    }
}

impl CredentialStore for StaticCredentialStore {
    fn resolve(&self, credential: &Credential) -> Result<Secret, ConnectorError> {
        self.secrets
            .get(&credential.name)
            .cloned()
            .ok_or_else(|| ConnectorError::Auth(format!("unknown credential {}", credential.name)))
    }
}

/// User and password of a resolved secret, rejecting tokens
pub fn user_password(
    credential: &Credential,
    secret: Secret,
) -> Result<(String, String), ConnectorError> {
    match secret {
        Secret::UserPassword { user, password } => Ok((user, password)),
        Secret::Token(_) => Err(ConnectorError::Auth(format!(
            "credential {} is a token; a user/password is required",
            credential.name
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn handle(name: &str, kind: CredentialType) -> Credential {
        Credential {
            name: name.to_string(),
            kind,
        }
    }

    #[test]
    fn test_var_name_normalises_handle() {
        assert_eq!(EnvCredentialStore::var_name("postgres", "USER"), "POSTGRES_USER");
        assert_eq!(EnvCredentialStore::var_name("sql-server.1", "PASSWORD"), "SQL_SERVER_1_PASSWORD");
    }

    #[test]
    #[serial]
    fn test_env_store_resolves_user_password() {
        std::env::set_var("YDPTESTSRC_USER", "reader");
        std::env::set_var("YDPTESTSRC_PASSWORD", "s3cret");

        let secret = EnvCredentialStore::new()
            .resolve(&handle("ydptestsrc", CredentialType::UserPassword))
            .unwrap();
        assert_eq!(
            secret,
            Secret::UserPassword {
                user: "reader".to_string(),
                password: "s3cret".to_string()
            }
        );
        assert!(!format!("{:?}", secret).contains("s3cret"));

        std::env::remove_var("YDPTESTSRC_PASSWORD");
        let err = EnvCredentialStore::new()
            .resolve(&handle("ydptestsrc", CredentialType::UserPassword))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Auth(msg) if msg.contains("YDPTESTSRC_PASSWORD")));

        std::env::remove_var("YDPTESTSRC_USER");
    }

    #[test]
    fn test_token_is_not_a_login() {
        let credential = handle("api", CredentialType::ApiToken);
        let store = StaticCredentialStore::new().with("api", Secret::Token("t".to_string()));
        let secret = store.resolve(&credential).unwrap();
        assert!(user_password(&credential, secret).is_err());
        assert!(store.resolve(&handle("other", CredentialType::ApiToken)).is_err());
    }
}
