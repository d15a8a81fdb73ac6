//! Registry credentials.
//!
//! Registry pulls resolve credentials per host through a [`CredentialResolver`]. The default
//! resolver reads the docker client configuration (`$DOCKER_CONFIG/config.json` or
//! `~/.docker/config.json`) and the containers auth file (`$REGISTRY_AUTH_FILE` or
//! `$XDG_RUNTIME_DIR/containers/auth.json`), including `credHelpers` and `credsStore` entries that
//! delegate to `docker-credential-<helper>` programs.

use std::{
    collections::HashMap,
    fmt, io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use log::debug;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command};

/// The server URL docker uses for Docker Hub credentials.
const DOCKER_HUB_SERVER: &str = "https://index.docker.io/v1/";

/// Credentials for one registry.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { username: String, password: String },
    IdentityToken(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::IdentityToken(_) => f.write_str("IdentityToken(..)"),
        }
    }
}

/// Errors from resolving credentials.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("credential helper {helper}: {message}")]
    Helper { helper: String, message: String },
}

/// Resolves credentials for a registry host.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Returns the credentials for `host`, or `None` to pull anonymously.
    async fn resolve(&self, host: &str) -> Result<Option<Credentials>, CredentialError>;
}

/// Always pulls anonymously.
#[derive(Debug, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialResolver for NoCredentials {
    async fn resolve(&self, _host: &str) -> Result<Option<Credentials>, CredentialError> {
        Ok(None)
    }
}

#[derive(Debug, Default, Deserialize)]
struct AuthConfig {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthConfig>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: HashMap<String, String>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperResponse {
    username: String,
    secret: String,
}

/// Reads credentials from docker and containers auth files.
#[derive(Debug, Clone)]
pub struct DockerConfigCredentials {
    paths: Vec<PathBuf>,
    helper_dir: Option<PathBuf>,
}

impl DockerConfigCredentials {
    /// Uses the given auth files, earlier files taking precedence.
    pub fn new(paths: Vec<PathBuf>) -> Self {
        DockerConfigCredentials {
            paths,
            helper_dir: None,
        }
    }

    /// Uses the auth files docker and podman would use.
    pub fn from_env() -> Self {
        let mut paths = Vec::new();
        if let Some(path) = std::env::var_os("REGISTRY_AUTH_FILE") {
            paths.push(PathBuf::from(path));
        }
        if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
            paths.push(Path::new(&dir).join("containers/auth.json"));
        }
        match std::env::var_os("DOCKER_CONFIG") {
            Some(dir) => paths.push(Path::new(&dir).join("config.json")),
            None => {
                if let Some(home) = dirs::home_dir() {
                    paths.push(home.join(".docker/config.json"));
                }
            }
        }
        Self::new(paths)
    }

    /// Looks up `docker-credential-*` helpers in `dir` instead of `$PATH`.
    pub fn with_helper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.helper_dir = Some(dir.into());
        self
    }

    async fn load(path: &Path) -> Result<Option<ConfigFile>, CredentialError> {
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CredentialError::Read {
                    path: path.to_path_buf(),
                    source: Arc::new(err),
                })
            }
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| CredentialError::Parse {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
    }

    async fn run_helper(
        &self,
        helper: &str,
        host: &str,
    ) -> Result<Option<Credentials>, CredentialError> {
        let program = format!("docker-credential-{helper}");
        let program = match &self.helper_dir {
            Some(dir) => dir.join(program),
            None => PathBuf::from(program),
        };
        let helper_err = |message: String| CredentialError::Helper {
            helper: helper.to_string(),
            message,
        };
        let server = if host == "docker.io" {
            DOCKER_HUB_SERVER
        } else {
            host
        };

        debug!("Resolving credentials for {host} via {}", program.display());
        let mut child = Command::new(&program)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| helper_err(format!("failed to run {}: {err}", program.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(server.as_bytes())
                .await
                .map_err(|err| helper_err(err.to_string()))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| helper_err(err.to_string()))?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains("credentials not found") {
                return Ok(None);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(helper_err(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let response: HelperResponse =
            serde_json::from_slice(&output.stdout).map_err(|err| helper_err(err.to_string()))?;
        Ok(Some(if response.username == "<token>" {
            Credentials::IdentityToken(response.secret)
        } else {
            Credentials::Basic {
                username: response.username,
                password: response.secret,
            }
        }))
    }
}

/// Normalizes a host or an auth file key to a bare registry host.
///
/// `https://index.docker.io/v1/`, `index.docker.io` and `docker.io` all become `docker.io`.
fn normalize_host(key: &str) -> String {
    let key = key.trim();
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = key.split('/').next().unwrap_or(key).to_lowercase();
    match host.as_str() {
        "index.docker.io" | "registry-1.docker.io" => "docker.io".to_string(),
        _ => host,
    }
}

/// Finds the entry for a normalized `host`.
///
/// Keys spelled the way docker writes them win over other spellings of the same host; among
/// those, the smallest key wins.
fn find_entry<'a, V>(entries: &'a HashMap<String, V>, host: &str) -> Option<&'a V> {
    let server = if host == "docker.io" {
        DOCKER_HUB_SERVER
    } else {
        host
    };
    entries
        .get(server)
        .or_else(|| entries.get(host))
        .or_else(|| {
            entries
                .iter()
                .filter(|(key, _)| normalize_host(key) == host)
                .min_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(_, value)| value)
        })
}

fn decode_auth(path: &Path, entry: &AuthConfig) -> Result<Option<Credentials>, CredentialError> {
    if let Some(token) = entry.identity_token.as_ref().filter(|t| !t.is_empty()) {
        return Ok(Some(Credentials::IdentityToken(token.clone())));
    }
    if let Some(auth) = entry.auth.as_ref().filter(|a| !a.is_empty()) {
        let parse_err = |message: &str| CredentialError::Parse {
            path: path.to_path_buf(),
            message: message.to_string(),
        };
        let decoded = STANDARD
            .decode(auth.trim())
            .map_err(|_| parse_err("invalid base64 in auth"))?;
        let decoded = String::from_utf8(decoded).map_err(|_| parse_err("invalid utf-8 in auth"))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| parse_err("auth is not username:password"))?;
        return Ok(Some(Credentials::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }));
    }
    match (&entry.username, &entry.password) {
        (Some(username), Some(password)) if !username.is_empty() => Ok(Some(Credentials::Basic {
            username: username.clone(),
            password: password.clone(),
        })),
        _ => Ok(None),
    }
}

#[async_trait]
impl CredentialResolver for DockerConfigCredentials {
    async fn resolve(&self, host: &str) -> Result<Option<Credentials>, CredentialError> {
        let host = normalize_host(host);
        for path in &self.paths {
            let Some(config) = Self::load(path).await? else {
                continue;
            };

            if let Some(helper) = find_entry(&config.cred_helpers, &host) {
                return self.run_helper(helper, &host).await;
            }

            if let Some(entry) = find_entry(&config.auths, &host) {
                if let Some(credentials) = decode_auth(path, entry)? {
                    return Ok(Some(credentials));
                }
            }

            if let Some(store) = &config.creds_store {
                if let Some(credentials) = self.run_helper(store, &host).await? {
                    return Ok(Some(credentials));
                }
            }
        }
        Ok(None)
    }
}
