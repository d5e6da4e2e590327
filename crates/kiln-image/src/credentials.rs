//! Registry credentials and their retrieval.
//!
//! Credentials are looked up per registry host through [`CredentialRetriever`]
//! implementations:
//! - [`DockerConfigRetriever`] reads `auths` from a Docker `config.json`
//! - [`EnvCredentialRetriever`] reads `KILN_REGISTRY_<HOST>_USERNAME/_PASSWORD`
//! - [`StaticCredentialRetriever`] serves credentials given on the command line or build file
//!
//! [`CredentialChain`] tries several retrievers in order.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use kiln_common::{KilnError, KilnPaths, KilnResult};
use serde::{Deserialize, Serialize};

/// Username used by registries to mark an OAuth2 refresh token in the password.
pub const OAUTH2_TOKEN_USERNAME: &str = "<token>";

/// Registry credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl Credential {
    /// Create a new credential.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Whether the password is an OAuth2 refresh token rather than a password.
    #[must_use]
    pub fn is_oauth2_refresh_token(&self) -> bool {
        self.username == OAUTH2_TOKEN_USERNAME
    }

    /// Encode as base64 auth string (Docker format).
    #[must_use]
    pub fn to_docker_auth(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.password))
    }

    /// Decode from base64 auth string (Docker format).
    ///
    /// # Errors
    ///
    /// Returns a configuration error for malformed auth strings.
    pub fn from_docker_auth(auth: &str) -> KilnResult<Self> {
        let decoded = BASE64
            .decode(auth.trim())
            .map_err(|e| KilnError::config(format!("Invalid base64 auth: {e}")))?;
        let auth_str = String::from_utf8(decoded)
            .map_err(|e| KilnError::config(format!("Invalid auth string: {e}")))?;
        let (username, password) = auth_str
            .split_once(':')
            .ok_or_else(|| KilnError::config("Auth string is missing the ':' separator"))?;
        Ok(Self::new(username, password))
    }
}

// Keep secrets out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Source of registry credentials.
pub trait CredentialRetriever: Send + Sync {
    /// Credential for `registry`, or `None` for anonymous access.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing source exists but is unreadable.
    fn retrieve(&self, registry: &str) -> KilnResult<Option<Credential>>;

    /// Backend name, for logging.
    fn name(&self) -> &'static str;
}

/// Docker config.json format.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfig {
    /// Authentication entries.
    #[serde(default)]
    pub auths: HashMap<String, DockerAuthEntry>,
}

/// Docker auth entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerAuthEntry {
    /// Base64-encoded auth string.
    #[serde(default)]
    pub auth: Option<String>,
    /// Username.
    #[serde(default)]
    pub username: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
    /// Identity token.
    #[serde(default, rename = "identitytoken")]
    pub identity_token: Option<String>,
}

impl DockerAuthEntry {
    fn credential(&self) -> KilnResult<Option<Credential>> {
        if let Some(token) = &self.identity_token {
            return Ok(Some(Credential::new(OAUTH2_TOKEN_USERNAME, token.clone())));
        }
        if let Some(auth) = &self.auth {
            return Credential::from_docker_auth(auth).map(Some);
        }
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                Ok(Some(Credential::new(username.clone(), password.clone())))
            }
            _ => Ok(None),
        }
    }
}

/// Reads credentials from a Docker `config.json`.
#[derive(Debug, Clone)]
pub struct DockerConfigRetriever {
    path: PathBuf,
}

impl DockerConfigRetriever {
    /// Read from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Keys under which Docker may have stored credentials for `registry`.
    fn candidate_keys(registry: &str) -> Vec<String> {
        let mut keys = vec![
            registry.to_string(),
            format!("https://{registry}"),
            format!("https://{registry}/v1/"),
            format!("https://{registry}/v2/"),
            format!("http://{registry}"),
        ];
        if matches!(registry, "docker.io" | "registry-1.docker.io" | "index.docker.io") {
            keys.push("https://index.docker.io/v1/".to_string());
            keys.push("index.docker.io".to_string());
        }
        keys
    }
}

impl Default for DockerConfigRetriever {
    fn default() -> Self {
        Self::new(KilnPaths::docker_config())
    }
}

impl CredentialRetriever for DockerConfigRetriever {
    fn retrieve(&self, registry: &str) -> KilnResult<Option<Credential>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config: DockerConfig = serde_json::from_str(&content).map_err(|e| {
            KilnError::config(format!(
                "Failed to parse Docker config {}: {e}",
                self.path.display()
            ))
        })?;

        for key in Self::candidate_keys(registry) {
            if let Some(entry) = config.auths.get(&key) {
                if let Some(credential) = entry.credential()? {
                    tracing::debug!(registry, key = %key, "Using credential from Docker config");
                    return Ok(Some(credential));
                }
            }
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "docker-config"
    }
}

/// Reads `KILN_REGISTRY_<HOST>_USERNAME` and `KILN_REGISTRY_<HOST>_PASSWORD`.
///
/// `<HOST>` is the registry upper-cased with `.`, `:`, `/` and `-` replaced by `_`.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialRetriever {
    vars: Option<HashMap<String, String>>,
}

impl EnvCredentialRetriever {
    /// Read from the process environment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from a fixed set of variables instead of the process environment.
    #[must_use]
    pub const fn from_vars(vars: HashMap<String, String>) -> Self {
        Self { vars: Some(vars) }
    }

    fn env_key(registry: &str, suffix: &str) -> String {
        let safe_registry: String = registry
            .to_uppercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("KILN_REGISTRY_{safe_registry}{suffix}")
    }

    fn var(&self, key: &str) -> Option<String> {
        match &self.vars {
            Some(vars) => vars.get(key).cloned(),
            None => std::env::var(key).ok(),
        }
    }
}

impl CredentialRetriever for EnvCredentialRetriever {
    fn retrieve(&self, registry: &str) -> KilnResult<Option<Credential>> {
        let username = self.var(&Self::env_key(registry, "_USERNAME"));
        let password = self.var(&Self::env_key(registry, "_PASSWORD"));
        Ok(match (username, password) {
            (Some(username), Some(password)) => Some(Credential::new(username, password)),
            _ => None,
        })
    }

    fn name(&self) -> &'static str {
        "env"
    }
}

/// Fixed credentials keyed by registry.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialRetriever {
    credentials: HashMap<String, Credential>,
}

impl StaticCredentialRetriever {
    /// Create an empty retriever.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a credential for `registry`.
    #[must_use]
    pub fn with(mut self, registry: impl Into<String>, credential: Credential) -> Self {
        self.credentials.insert(registry.into(), credential);
        self
    }
}

impl CredentialRetriever for StaticCredentialRetriever {
    fn retrieve(&self, registry: &str) -> KilnResult<Option<Credential>> {
        Ok(self.credentials.get(registry).cloned())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Retrievers consulted in order; the first credential found wins.
#[derive(Default)]
pub struct CredentialChain {
    retrievers: Vec<Box<dyn CredentialRetriever>>,
}

impl CredentialChain {
    /// Create an empty chain (always anonymous).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Environment variables, then the Docker config file.
    #[must_use]
    pub fn standard() -> Self {
        Self::new()
            .with(EnvCredentialRetriever::new())
            .with(DockerConfigRetriever::default())
    }

    /// Append a retriever.
    #[must_use]
    pub fn with(mut self, retriever: impl CredentialRetriever + 'static) -> Self {
        self.retrievers.push(Box::new(retriever));
        self
    }
}

impl CredentialRetriever for CredentialChain {
    fn retrieve(&self, registry: &str) -> KilnResult<Option<Credential>> {
        for retriever in &self.retrievers {
            if let Some(credential) = retriever.retrieve(registry)? {
                tracing::debug!(registry, source = retriever.name(), "Found registry credential");
                return Ok(Some(credential));
            }
        }
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
