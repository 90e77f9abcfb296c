//! Ambient options for resolution and launching

use crate::registry::ResourceId;
use crate::Result;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;
use sshio_transport::{MethodKind, Methods, PtySize, TermUnit};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Terminal type used when none is given
pub const DEFAULT_TERMINAL: &str = "vanilla";

/// Default terminal width
pub const DEFAULT_TERM_WIDTH: u32 = 80;

/// Default terminal height
pub const DEFAULT_TERM_HEIGHT: u32 = 25;

/// Options a caller supplies alongside an identifier
#[derive(Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Context {
    /// Login name
    pub username: Option<String>,
    /// Password, also used as the private key passphrase
    pub password: Option<String>,
    /// Public key file
    pub pubkey_file: Option<PathBuf>,
    /// Private key file
    pub privkey_file: Option<PathBuf>,
    /// Algorithm preferences handed to the transport
    pub methods: Methods,
    /// Callback names handed to the transport
    pub callbacks: BTreeMap<String, String>,
    /// Session handle to reuse when the identifier has no host
    pub session: Option<ResourceId>,
    /// SFTP handle to reuse when the identifier has no host
    pub sftp: Option<ResourceId>,
    /// Remote environment
    pub env: Option<Environment>,
    /// Terminal type
    pub term: Option<String>,
    /// Terminal width
    pub term_width: Option<u32>,
    /// Terminal height
    pub term_height: Option<u32>,
    /// Unit of width and height
    pub term_units: Option<TermUnit>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("pubkey_file", &self.pubkey_file)
            .field("privkey_file", &self.privkey_file)
            .field("methods", &self.methods)
            .field("callbacks", &self.callbacks)
            .field("session", &self.session)
            .field("sftp", &self.sftp)
            .field("env", &self.env)
            .field("term", &self.term)
            .field("term_width", &self.term_width)
            .field("term_height", &self.term_height)
            .field("term_units", &self.term_units)
            .finish()
    }
}

impl Context {
    /// Empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a context from JSON; unknown keys are rejected
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the login name
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the key pair used for public key authentication
    pub fn with_key_pair(mut self, pubkey: impl Into<PathBuf>, privkey: impl Into<PathBuf>) -> Self {
        self.pubkey_file = Some(pubkey.into());
        self.privkey_file = Some(privkey.into());
        self
    }

    /// Add an algorithm preference
    pub fn with_method(mut self, kind: MethodKind, prefs: impl Into<String>) -> Self {
        self.methods.insert(kind, prefs.into());
        self
    }

    /// Add a transport callback
    pub fn with_callback(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.callbacks.insert(name.into(), target.into());
        self
    }

    /// Reuse a registered session
    pub fn with_session(mut self, id: ResourceId) -> Self {
        self.session = Some(id);
        self
    }

    /// Reuse a registered SFTP sub-session
    pub fn with_sftp(mut self, id: ResourceId) -> Self {
        self.sftp = Some(id);
        self
    }

    /// Add a remote environment variable
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(Environment::new)
            .push(EnvKey::Name(name.into()), value);
        self
    }

    /// Replace the whole environment
    pub fn with_environment(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    /// Set the terminal type
    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }

    /// Set the terminal size
    pub fn with_term_size(mut self, width: u32, height: u32) -> Self {
        self.term_width = Some(width);
        self.term_height = Some(height);
        self
    }

    /// Set the unit of the terminal size
    pub fn with_term_units(mut self, unit: TermUnit) -> Self {
        self.term_units = Some(unit);
        self
    }

    /// Terminal size with defaults filled in
    pub fn pty_size(&self) -> PtySize {
        PtySize {
            width: self.term_width.unwrap_or(DEFAULT_TERM_WIDTH),
            height: self.term_height.unwrap_or(DEFAULT_TERM_HEIGHT),
            unit: self.term_units.unwrap_or_default(),
        }
    }

    /// Whether a key pair is configured
    pub fn has_key_pair(&self) -> bool {
        self.pubkey_file.is_some() && self.privkey_file.is_some()
    }
}

/// Key of an environment entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvKey {
    /// Variable name
    Name(String),
    /// Positional entry; has no name and is never sent
    Index(usize),
}

/// Ordered remote environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    entries: Vec<(EnvKey, String)>,
}

impl Environment {
    /// Empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&mut self, key: EnvKey, value: impl Into<String>) {
        self.entries.push((key, value.into()));
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&EnvKey, &str)> {
        self.entries.iter().map(|(k, v)| (k, v.as_str()))
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn from_value(value: Value) -> std::result::Result<Self, String> {
        let mut env = Self::new();
        match value {
            Value::Object(map) => {
                for (name, value) in map {
                    env.push(EnvKey::Name(name), scalar_to_string(value)?);
                }
            }
            Value::Array(items) => {
                for (index, value) in items.into_iter().enumerate() {
                    env.push(EnvKey::Index(index), scalar_to_string(value)?);
                }
            }
            other => return Err(format!("environment must be an object, got {}", other)),
        }
        Ok(env)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (EnvKey::Name(k.into()), v.into()))
                .collect(),
        }
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(de::Error::custom)
    }
}

fn scalar_to_string(value: Value) -> std::result::Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(true) => Ok("1".to_string()),
        Value::Bool(false) | Value::Null => Ok(String::new()),
        other => Err(format!("environment values must be scalars, got {}", other)),
    }
}
