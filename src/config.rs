use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rustls_pki_types::CertificateDer;
use thiserror::Error;

/// Capabilities this client knows how to take advantage of; the default
/// negotiation policy requests whichever of these the server advertises.
pub const SUPPORTED_CAPS: &[&str] = &[
    "account-notify",
    "away-notify",
    "chghost",
    "extended-join",
    "multi-prefix",
    "userhost-in-names",
];

/// Default spacing between paced outbound lines.
pub const DEFAULT_MESSAGE_DELAY_MS: u64 = 1200;

/// Caller-supplied decision on whether to accept a server certificate chain
/// (leaf first). Replaces the built-in webpki verification wholesale.
pub trait TrustDecider: Send + Sync {
    fn verify(&self, chain: &[CertificateDer<'_>]) -> bool;
}

/// Chooses which of the server's advertised capabilities to request.
pub trait CapPolicy: Send + Sync {
    fn select(&self, offered: &[String]) -> Vec<String>;
}

/// Default policy: request every advertised capability the client supports.
/// Advertised tokens may carry a `=value` suffix; only the name is matched
/// and only the name is requested.
pub struct RequestKnown;

impl CapPolicy for RequestKnown {
    fn select(&self, offered: &[String]) -> Vec<String> {
        offered
            .iter()
            .map(|token| token.split('=').next().unwrap_or(token))
            .filter(|name| SUPPORTED_CAPS.contains(name))
            .map(str::to_owned)
            .collect()
    }
}

/// Produces the next nick to attempt after a collision.
pub trait NickStrategy: Send + Sync {
    fn next(&self, taken: &str) -> String;
}

/// Default collision strategy: append one underscore per attempt.
pub struct AppendUnderscore;

impl NickStrategy for AppendUnderscore {
    fn next(&self, taken: &str) -> String {
        format!("{}_", taken)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("nick must be non-empty and contain no spaces")]
    InvalidNick,
    #[error("user must be non-empty and contain no spaces")]
    InvalidUser,
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificate found in {0:?}")]
    EmptyCertChain(PathBuf),
    #[error("no private key found in {0:?}")]
    MissingKey(PathBuf),
    #[error("cannot decrypt private key: {0}")]
    KeyDecrypt(String),
    #[error("invalid TLS material: {0}")]
    Tls(String),
}

/// Frozen bag of connection options. Built once via [`Config::builder`] and
/// shared read-only by the engine and the reactor.
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub bind_address: Option<SocketAddr>,
    pub ssl: bool,
    /// PEM file holding the client certificate chain, leaf first.
    pub ssl_key_cert_chain: Option<PathBuf>,
    /// PEM file holding the client private key.
    pub ssl_key: Option<PathBuf>,
    /// Passphrase for an encrypted PKCS#8 client key.
    pub ssl_key_password: Option<String>,
    pub nick: String,
    pub user: String,
    pub real_name: String,
    pub server_password: Option<String>,
    /// Pacer period in milliseconds.
    pub message_delay: u64,
    /// Diagnostic label used in logs.
    pub name: String,
    /// `None` verifies against the bundled webpki roots.
    pub trust: Option<Arc<dyn TrustDecider>>,
    pub caps: Arc<dyn CapPolicy>,
    pub nicks: Arc<dyn NickStrategy>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("bind_address", &self.bind_address)
            .field("ssl", &self.ssl)
            .field("ssl_key_cert_chain", &self.ssl_key_cert_chain)
            .field("ssl_key", &self.ssl_key)
            .field("ssl_key_password", &self.ssl_key_password)
            .field("nick", &self.nick)
            .field("user", &self.user)
            .field("real_name", &self.real_name)
            .field("server_password", &self.server_password)
            .field("message_delay", &self.message_delay)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn builder(host: impl Into<String>, port: u16) -> ConfigBuilder {
        ConfigBuilder {
            server_host: host.into(),
            server_port: port,
            bind_address: None,
            ssl: false,
            ssl_key_cert_chain: None,
            ssl_key: None,
            ssl_key_password: None,
            nick: String::new(),
            user: "tether".to_owned(),
            real_name: "tether".to_owned(),
            server_password: None,
            message_delay: DEFAULT_MESSAGE_DELAY_MS,
            name: None,
            trust: None,
            caps: None,
            nicks: None,
        }
    }
}

pub struct ConfigBuilder {
    server_host: String,
    server_port: u16,
    bind_address: Option<SocketAddr>,
    ssl: bool,
    ssl_key_cert_chain: Option<PathBuf>,
    ssl_key: Option<PathBuf>,
    ssl_key_password: Option<String>,
    nick: String,
    user: String,
    real_name: String,
    server_password: Option<String>,
    message_delay: u64,
    name: Option<String>,
    trust: Option<Arc<dyn TrustDecider>>,
    caps: Option<Arc<dyn CapPolicy>>,
    nicks: Option<Arc<dyn NickStrategy>>,
}

impl ConfigBuilder {
    pub fn nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = nick.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn real_name(mut self, real_name: impl Into<String>) -> Self {
        self.real_name = real_name.into();
        self
    }

    pub fn server_password(mut self, password: impl Into<String>) -> Self {
        self.server_password = Some(password.into());
        self
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Client certificate chain and key files, with an optional passphrase
    /// for an encrypted PKCS#8 key.
    pub fn ssl_client_cert(
        mut self,
        cert_chain: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
        password: Option<String>,
    ) -> Self {
        self.ssl_key_cert_chain = Some(cert_chain.into());
        self.ssl_key = Some(key.into());
        self.ssl_key_password = password;
        self
    }

    pub fn message_delay(mut self, millis: u64) -> Self {
        self.message_delay = millis.max(1);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn trust(mut self, trust: Arc<dyn TrustDecider>) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn cap_policy(mut self, caps: Arc<dyn CapPolicy>) -> Self {
        self.caps = Some(caps);
        self
    }

    pub fn nick_strategy(mut self, nicks: Arc<dyn NickStrategy>) -> Self {
        self.nicks = Some(nicks);
        self
    }

    pub fn build(self) -> Result<Config, ConfigError> {
        if self.nick.is_empty() || self.nick.contains(' ') {
            return Err(ConfigError::InvalidNick);
        }
        if self.user.is_empty() || self.user.contains(' ') {
            return Err(ConfigError::InvalidUser);
        }
        let name = self
            .name
            .unwrap_or_else(|| format!("{}:{}", self.server_host, self.server_port));
        Ok(Config {
            server_host: self.server_host,
            server_port: self.server_port,
            bind_address: self.bind_address,
            ssl: self.ssl,
            ssl_key_cert_chain: self.ssl_key_cert_chain,
            ssl_key: self.ssl_key,
            ssl_key_password: self.ssl_key_password,
            nick: self.nick,
            user: self.user,
            real_name: self.real_name,
            server_password: self.server_password,
            message_delay: self.message_delay,
            name,
            trust: self.trust,
            caps: self.caps.unwrap_or_else(|| Arc::new(RequestKnown)),
            nicks: self.nicks.unwrap_or_else(|| Arc::new(AppendUnderscore)),
        })
    }
}
