//! Authentication configuration and OAuth token acquisition.
//!
//! The backend never reads credentials from ambient process environment; it
//! receives an explicit [`AuthConfig`] at construction time and obtains
//! bearer tokens through a [`TokenSource`]. The default source drives the
//! `gcloud` CLI via [`CommandRunner`], which keeps the token plumbing out of
//! the core and easy to fake in tests.

use std::ffi::OsString;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{AppConfig, expand_tilde};
use crate::process::{CommandRunner, ProcessError};

/// How long a fetched access token is reused before asking `gcloud` again.
/// GCP access tokens live for an hour; refreshing a little early avoids
/// racing the expiry during a long operation wait.
const TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

/// Credential selection passed explicitly into the backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AuthConfig {
    /// Application Default Credentials.
    Adc,
    /// A service account key file.
    SaKey {
        /// Path to the JSON key file.
        key_path: String,
    },
    /// ADC with service account impersonation.
    Impersonation {
        /// Email of the service account to impersonate.
        email: String,
    },
}

impl AuthConfig {
    /// Resolves the effective authentication method from CLI flags and
    /// configuration, in that order of precedence, defaulting to ADC.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::IncompleteSelection`] when a method is selected
    /// without its required companion value (impersonation email or key
    /// path).
    pub fn resolve(
        adc_flag: bool,
        impersonate_flag: Option<Option<String>>,
        sa_key_flag: Option<String>,
        config: &AppConfig,
    ) -> Result<Self, AuthError> {
        if adc_flag {
            return Ok(Self::Adc);
        }
        if let Some(email_arg) = impersonate_flag {
            let email = email_arg
                .or_else(|| config.service_account_email.clone())
                .ok_or_else(|| AuthError::IncompleteSelection {
                    message: String::from(
                        "impersonation requires a service account email (flag value or \
                         service_account_email in configuration)",
                    ),
                })?;
            return Ok(Self::Impersonation { email });
        }
        if let Some(key_path) = sa_key_flag {
            return Ok(Self::SaKey { key_path });
        }

        match config.auth_method.as_deref() {
            Some("sa_key") => {
                let key_path = config.service_account_key_path.clone().ok_or_else(|| {
                    AuthError::IncompleteSelection {
                        message: String::from(
                            "auth_method is sa_key but service_account_key_path is not set",
                        ),
                    }
                })?;
                Ok(Self::SaKey { key_path })
            }
            Some("impersonation") => {
                let email = config.service_account_email.clone().ok_or_else(|| {
                    AuthError::IncompleteSelection {
                        message: String::from(
                            "auth_method is impersonation but service_account_email is not set",
                        ),
                    }
                })?;
                Ok(Self::Impersonation { email })
            }
            Some("adc") | None => Ok(Self::Adc),
            Some(other) => Err(AuthError::IncompleteSelection {
                message: format!("unrecognised auth_method '{other}'"),
            }),
        }
    }
}

/// Errors raised while acquiring credentials.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AuthError {
    /// Raised when the selected method is missing a required value.
    #[error("invalid authentication selection: {message}")]
    IncompleteSelection {
        /// Description of what is missing.
        message: String,
    },
    /// Raised when a service account key file does not exist.
    #[error("service account key not found: {path}")]
    MissingKeyFile {
        /// Path that was checked.
        path: String,
    },
    /// Raised when the token command cannot be spawned.
    #[error(transparent)]
    Spawn(#[from] ProcessError),
    /// Raised when `gcloud` exits non-zero or prints no token.
    #[error("failed to obtain an access token: {message}")]
    TokenCommand {
        /// Stderr (or a summary) from the token command.
        message: String,
    },
}

/// Classifies whether a failure message indicates missing or expired
/// credentials, as opposed to a transient or unrelated error.
///
/// Recovery orchestration (for example offering to run
/// `gcloud auth application-default login`) lives with the caller; this is
/// only the classification.
#[must_use]
pub fn is_credential_error(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("could not find default credentials")
        || lowered.contains("reauthentication")
        || lowered.contains("credential")
        || lowered.contains("oauth")
}

/// Produces OAuth bearer tokens for Compute Engine API calls.
pub trait TokenSource: Send + Sync {
    /// Returns a bearer token, fetching or refreshing as needed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when no token can be obtained.
    fn token(&self) -> Result<String, AuthError>;
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

/// Token source that shells out to the `gcloud` CLI.
pub struct GcloudTokenSource<R> {
    gcloud_bin: String,
    auth: AuthConfig,
    runner: R,
    cache: Mutex<Option<CachedToken>>,
}

impl<R: CommandRunner> GcloudTokenSource<R> {
    /// Creates a token source for the given auth selection.
    pub fn new(gcloud_bin: impl Into<String>, auth: AuthConfig, runner: R) -> Self {
        Self {
            gcloud_bin: gcloud_bin.into(),
            auth,
            runner,
            cache: Mutex::new(None),
        }
    }

    fn command(&self) -> Result<(Vec<OsString>, Vec<(String, String)>), AuthError> {
        match &self.auth {
            AuthConfig::Adc => Ok((
                vec![
                    OsString::from("auth"),
                    OsString::from("application-default"),
                    OsString::from("print-access-token"),
                ],
                Vec::new(),
            )),
            AuthConfig::Impersonation { email } => Ok((
                vec![
                    OsString::from("auth"),
                    OsString::from("print-access-token"),
                    OsString::from(format!("--impersonate-service-account={email}")),
                ],
                Vec::new(),
            )),
            AuthConfig::SaKey { key_path } => {
                let expanded = expand_tilde(key_path);
                if !std::path::Path::new(&expanded).exists() {
                    return Err(AuthError::MissingKeyFile { path: expanded });
                }
                Ok((
                    vec![
                        OsString::from("auth"),
                        OsString::from("application-default"),
                        OsString::from("print-access-token"),
                    ],
                    vec![(String::from("GOOGLE_APPLICATION_CREDENTIALS"), expanded)],
                ))
            }
        }
    }

    fn fetch(&self) -> Result<String, AuthError> {
        let (args, envs) = self.command()?;
        let output = self.runner.run_with_env(&self.gcloud_bin, &args, &envs)?;
        if !output.is_success() {
            return Err(AuthError::TokenCommand {
                message: summarise_failure(&output.stderr, output.code),
            });
        }

        let token = output.stdout.trim().to_owned();
        if token.is_empty() {
            return Err(AuthError::TokenCommand {
                message: String::from("gcloud printed an empty access token"),
            });
        }
        Ok(token)
    }
}

impl<R: CommandRunner + Send + Sync> TokenSource for GcloudTokenSource<R> {
    fn token(&self) -> Result<String, AuthError> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(cached) = cache.as_ref()
            && cached.fetched_at.elapsed() < TOKEN_TTL
        {
            return Ok(cached.value.clone());
        }

        let token = self.fetch()?;
        *cache = Some(CachedToken {
            value: token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token)
    }
}

fn summarise_failure(stderr: &str, code: Option<i32>) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        code.map_or_else(
            || String::from("gcloud terminated without an exit status"),
            |status| format!("gcloud exited with status {status}"),
        )
    } else {
        trimmed.to_owned()
    }
}
