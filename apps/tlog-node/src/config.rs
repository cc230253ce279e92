//! TOML configuration for a Tamperlog node.
//!
//! Every section is optional. A missing file yields the defaults, which are
//! enough for `keygen` but not for anything that touches the chain: those
//! commands need at least `[trust]`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;
use tlog_chain::{
    decode_hex, public_key_from_hex, signing_key_from_hex, Hash, MemoryCredentialStore,
    SigningIdentity,
};
use tlog_exchange::ExchangeConfig;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Storage location and listen address.
    pub node: NodeSection,
    /// The local user of this device.
    pub identity: IdentitySection,
    /// The certificate authority every device trusts.
    pub trust: TrustSection,
    /// Exchange tuning and known peers.
    pub exchange: ExchangeSection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory holding the block store.
    pub data_dir: PathBuf,
    /// Address `listen` binds to.
    pub listen_addr: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".tamperlog"),
            listen_addr: "0.0.0.0:4870".to_string(),
        }
    }
}

/// `[identity]` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    pub user_id: String,
    /// Free-form device location stamped on every block.
    pub location: String,
    /// Ed25519 secret key, hex.
    pub signing_key: String,
    /// Salt for `password_hash`, hex.
    pub password_salt: String,
    /// `SHA256(password || salt)`, hex.
    pub password_hash: String,
}

/// `[trust]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TrustSection {
    pub admin_id: String,
    /// Ed25519 public key of the admin, hex.
    pub admin_public_key: String,
}

impl Default for TrustSection {
    fn default() -> Self {
        Self {
            admin_id: "ca".to_string(),
            admin_public_key: String::new(),
        }
    }
}

/// `[exchange]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ExchangeSection {
    pub round_trip_timeout_secs: u64,
    pub teardown_grace_secs: u64,
    /// Pause between exchanges when listening.
    pub cooldown_secs: u64,
    pub max_frame_size: usize,
    /// Peers to try in turn when `connect` is given no address.
    pub peers: Vec<String>,
}

impl Default for ExchangeSection {
    fn default() -> Self {
        let defaults = ExchangeConfig::default();
        Self {
            round_trip_timeout_secs: defaults.round_trip_timeout.as_secs(),
            teardown_grace_secs: defaults.teardown_grace.as_secs(),
            cooldown_secs: defaults.cooldown.as_secs(),
            max_frame_size: defaults.max_frame_size,
            peers: Vec::new(),
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load config from a TOML file, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("reading config {}", p.display()))?;
                Self::from_toml(&content).with_context(|| format!("parsing config {}", p.display()))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig::builder()
            .round_trip_timeout(Duration::from_secs(self.exchange.round_trip_timeout_secs))
            .teardown_grace(Duration::from_secs(self.exchange.teardown_grace_secs))
            .cooldown(Duration::from_secs(self.exchange.cooldown_secs))
            .max_frame_size(self.exchange.max_frame_size)
            .build()
    }

    /// The configured identity, if one is set up.
    pub fn identity(&self) -> anyhow::Result<Option<SigningIdentity>> {
        let section = &self.identity;
        if section.user_id.is_empty() {
            return Ok(None);
        }
        let key = signing_key_from_hex(&section.signing_key)
            .with_context(|| format!("[identity] signing_key for {}", section.user_id))?;
        Ok(Some(SigningIdentity::new(
            section.user_id.clone(),
            section.location.clone(),
            key,
        )))
    }

    /// Trust anchor plus the sealed local identity.
    pub fn credentials(&self) -> anyhow::Result<MemoryCredentialStore> {
        if self.trust.admin_public_key.is_empty() {
            bail!("[trust] admin_public_key is not configured");
        }
        let admin_key = public_key_from_hex(&self.trust.admin_public_key)
            .context("[trust] admin_public_key")?;
        let store = MemoryCredentialStore::new(self.trust.admin_id.clone(), admin_key);

        let Some(identity) = self.identity()? else {
            return Ok(store);
        };
        let salt = decode_hex(&self.identity.password_salt).context("[identity] password_salt is not hex")?;
        let digest = Hash::from_hex(&self.identity.password_hash)
            .context("[identity] password_hash is not a 32-byte hex digest")?;
        Ok(store.with_user_digest(identity, salt, digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tlog_chain::{encode_hex, password_digest, public_key_hex, CredentialStore};

    fn admin_pub() -> String {
        public_key_hex(&SigningIdentity::generate("ca", "Origin").public_key())
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = NodeConfig::from_toml("").unwrap();
        assert_eq!(config.node.listen_addr, "0.0.0.0:4870");
        assert_eq!(config.trust.admin_id, "ca");
        assert_eq!(config.log.level, "info");
        let exchange = config.exchange_config();
        assert_eq!(exchange.cooldown, Duration::from_secs(120));
        assert_eq!(exchange.round_trip_timeout, Duration::from_secs(30));
        assert!(config.identity().unwrap().is_none());
        assert!(config.credentials().is_err());
    }

    #[test]
    fn sections_override_defaults() {
        let config = NodeConfig::from_toml(
            r#"
            [node]
            data_dir = "/var/lib/tamperlog"

            [exchange]
            cooldown_secs = 5
            peers = ["10.0.0.2:4870"]

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/tamperlog"));
        assert_eq!(config.node.listen_addr, "0.0.0.0:4870");
        assert_eq!(config.exchange_config().cooldown, Duration::from_secs(5));
        assert_eq!(config.exchange.peers, vec!["10.0.0.2:4870".to_string()]);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn identity_unlocks_with_its_password() {
        let salt = [7u8; 16];
        let digest = password_digest("hunter2", &salt);
        let toml = format!(
            r#"
            [identity]
            user_id = "alice"
            location = "ward-3"
            signing_key = "{}"
            password_salt = "{}"
            password_hash = "{}"

            [trust]
            admin_public_key = "{}"
            "#,
            encode_hex(&[2u8; 32]),
            encode_hex(&salt),
            digest.to_hex(),
            admin_pub(),
        );
        let config = NodeConfig::from_toml(&toml).unwrap();
        let credentials = config.credentials().unwrap();

        assert_eq!(credentials.local_user_id(), Some("alice"));
        let alice = credentials.unlock_user("hunter2").unwrap();
        assert_eq!(alice.location(), "ward-3");
        assert!(credentials.unlock_user("wrong").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nlisten_addr = \"127.0.0.1:9000\"").unwrap();
        let config = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.node.listen_addr, "127.0.0.1:9000");

        assert!(NodeConfig::load(Some(Path::new("/nonexistent/tamperlog.toml"))).is_err());
    }
}
