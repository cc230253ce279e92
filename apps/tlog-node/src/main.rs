//! # tlog-node
//!
//! Command-line front end for a single Tamperlog device.
//!
//! ```text
//! tlog-node keygen --user alice --password hunter2   # new identity + config snippet
//! tlog-node -c node.toml init --admin-key <hex> --certify alice=<pubhex>
//! tlog-node -c node.toml append --record chart-7 --reason "ward round"
//! tlog-node -c node.toml revoke --user bob --admin-key <hex>
//! tlog-node -c node.toml listen                      # serve exchanges over TCP
//! tlog-node -c node.toml connect 10.0.0.2:4870       # one exchange
//! tlog-node -c node.toml status
//! tlog-node -c node.toml witnesses <block-hash>
//! ```

mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::*;
use tlog_chain::{
    encode_hex, password_digest, public_key_from_hex, public_key_hex, signing_key_from_hex,
    FileBlobStore, Hash, Repository, SigningIdentity, Transaction,
};
use tlog_exchange::{run_exchange, Connector, ExchangeConfig, Exchanger, FrameChannel, StreamChannel};
use tokio::net::TcpListener;
use tracing::{info, warn};

use config::NodeConfig;

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "tlog-node")]
#[command(about = "Tamper-evident signed log node")]
#[command(version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true, env = "TLOG_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a signing key and print a matching [identity] section
    Keygen {
        /// User id for the new identity
        #[arg(short, long, default_value = "user")]
        user: String,
        /// Device location stamped on blocks
        #[arg(short, long, default_value = "")]
        location: String,
        /// Password sealing the identity
        #[arg(long, env = "TLOG_PASSWORD")]
        password: Option<String>,
    },
    /// Create the genesis block in an empty store
    Init {
        /// Admin secret key, hex
        #[arg(long, env = "TLOG_ADMIN_KEY")]
        admin_key: String,
        /// Founding users as user=pubhex; repeatable
        #[arg(long)]
        certify: Vec<String>,
    },
    /// Show the root, size and active users
    Status,
    /// Append a record block signed by the local user
    Append {
        #[arg(long)]
        record: String,
        #[arg(long, default_value = "")]
        reason: String,
        /// Log an access instead of a request
        #[arg(long)]
        access: bool,
        #[arg(long, env = "TLOG_PASSWORD")]
        password: String,
    },
    /// Revoke a user's certificate (admin only)
    Revoke {
        #[arg(long)]
        user: String,
        #[arg(long, env = "TLOG_ADMIN_KEY")]
        admin_key: String,
    },
    /// Accept exchanges over TCP until interrupted
    Listen {
        #[arg(long, env = "TLOG_PASSWORD")]
        password: String,
    },
    /// Run one exchange with a peer
    Connect {
        /// host:port; defaults to the first configured peer
        addr: Option<String>,
        #[arg(long, env = "TLOG_PASSWORD")]
        password: String,
    },
    /// List users who witnessed a block
    Witnesses { hash: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig::load(cli.config.as_deref())?;
    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Keygen {
            user,
            location,
            password,
        } => keygen(&user, &location, password.as_deref()),
        Commands::Init { admin_key, certify } => init(&config, &admin_key, &certify),
        Commands::Status => status(&config),
        Commands::Append {
            record,
            reason,
            access,
            password,
        } => append(&config, &record, &reason, access, &password),
        Commands::Revoke { user, admin_key } => revoke(&config, &user, &admin_key),
        Commands::Listen { password } => listen(&config, &password).await,
        Commands::Connect { addr, password } => connect(&config, addr, &password).await,
        Commands::Witnesses { hash } => witnesses(&config, &hash),
    }
}

// ─── Helpers ───────────────────────────────────────────────────────────────

fn header(text: &str) {
    let bar = "═".repeat(60);
    println!("\n{}", bar.bright_cyan());
    println!("  {}", text.bold().bright_white());
    println!("{}", bar.bright_cyan());
}

fn field(name: &str, value: impl std::fmt::Display) {
    println!("  {} {:<14} {}", "•".bright_green(), name, value);
}

fn open_repository(config: &NodeConfig) -> Result<Arc<Repository>> {
    let credentials = config.credentials()?;
    let store = FileBlobStore::new(config.node.data_dir.join("blocks"))
        .with_context(|| format!("opening store in {}", config.node.data_dir.display()))?;
    let repository = Repository::open(Arc::new(store), Arc::new(credentials))
        .context("loading local chain")?;
    Ok(Arc::new(repository))
}

fn unlock(repository: &Repository, password: &str) -> Result<SigningIdentity> {
    repository
        .credentials()
        .unlock_user(password)
        .context("unlocking local identity")
}

/// The admin identity from a raw secret key, checked against the trust anchor.
fn admin_identity(config: &NodeConfig, admin_key: &str) -> Result<SigningIdentity> {
    let key = signing_key_from_hex(admin_key).context("--admin-key")?;
    let admin = SigningIdentity::new(config.trust.admin_id.clone(), "Origin", key);
    let anchor = public_key_from_hex(&config.trust.admin_public_key).context("[trust] admin_public_key")?;
    if admin.public_key() != anchor {
        bail!("--admin-key does not match [trust] admin_public_key");
    }
    Ok(admin)
}

fn parse_hash(s: &str) -> Result<Hash> {
    Hash::from_hex(s).ok_or_else(|| anyhow!("{:?} is not a 64-character block hash", s))
}

// ─── Commands ──────────────────────────────────────────────────────────────

fn keygen(user: &str, location: &str, password: Option<&str>) -> Result<()> {
    let identity = SigningIdentity::generate(user, location);
    header(&format!("New identity: {}", user));
    field("public key", public_key_hex(&identity.public_key()));
    field("certify as", format!("{}={}", user, public_key_hex(&identity.public_key())));

    println!("\n[identity]");
    println!("user_id = {:?}", user);
    println!("location = {:?}", location);
    println!("signing_key = {:?}", identity.secret_hex());
    if let Some(password) = password {
        let salt: [u8; 16] = rand::random();
        println!("password_salt = {:?}", encode_hex(&salt));
        println!("password_hash = {:?}", password_digest(password, &salt).to_hex());
    }
    Ok(())
}

fn init(config: &NodeConfig, admin_key: &str, certify: &[String]) -> Result<()> {
    let admin = admin_identity(config, admin_key)?;
    let mut founders = Vec::new();
    for entry in certify {
        let (user, key) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("--certify expects user=pubhex, got {:?}", entry))?;
        let key = public_key_from_hex(key).with_context(|| format!("public key for {}", user))?;
        founders.push(Transaction::certificate(user, &key));
    }

    let repository = open_repository(config)?;
    let genesis = admin.genesis(founders);
    repository.bootstrap(genesis.clone()).context("bootstrapping")?;

    header("Genesis created");
    field("hash", genesis.hash());
    field("founders", certify.len());
    Ok(())
}

fn status(config: &NodeConfig) -> Result<()> {
    let repository = open_repository(config)?;
    header("Node status");
    match repository.root_hash() {
        Some(root) => field("root", root),
        None => field("root", "(not bootstrapped)".dimmed()),
    }
    field("blocks", repository.len());
    field("admin", repository.admin_id());
    field(
        "local user",
        repository.credentials().local_user_id().unwrap_or("(none)"),
    );
    let ledger = repository.ledger();
    let users: Vec<&str> = ledger.active_users().map(String::as_str).collect();
    field("active users", users.join(", "));
    field("witnesses", ledger.witness_blocks().count());
    Ok(())
}

fn append(config: &NodeConfig, record: &str, reason: &str, access: bool, password: &str) -> Result<()> {
    let repository = open_repository(config)?;
    let identity = unlock(&repository, password)?;
    let tx = if access {
        Transaction::record_access(record, reason)
    } else {
        Transaction::record_request(record, reason)
    };
    let block = repository.add_user_block(vec![tx], &identity)?;
    println!("  {} appended {}", "✓".bright_green().bold(), block.hash());
    Ok(())
}

fn revoke(config: &NodeConfig, user: &str, admin_key: &str) -> Result<()> {
    let admin = admin_identity(config, admin_key)?;
    let repository = open_repository(config)?;
    if !repository.is_active(user) {
        bail!("{} holds no active certificate", user);
    }
    let block = repository.add_admin_block(vec![Transaction::revoke_certificate(user)], &admin)?;
    println!("  {} revoked {} in {}", "✓".bright_green().bold(), user, block.hash());
    Ok(())
}

fn witnesses(config: &NodeConfig, hash: &str) -> Result<()> {
    let repository = open_repository(config)?;
    let hash = parse_hash(hash)?;
    let witnesses = repository.witnesses_of(&hash)?;
    header(&format!("Witnesses of {}", hash.short()));
    if witnesses.is_empty() {
        println!("  {}", "(none yet)".dimmed());
    }
    for user in witnesses {
        println!("  {} {}", "•".bright_green(), user);
    }
    Ok(())
}

async fn connect(config: &NodeConfig, addr: Option<String>, password: &str) -> Result<()> {
    let addr = addr
        .or_else(|| config.exchange.peers.first().cloned())
        .ok_or_else(|| anyhow!("no address given and no [exchange] peers configured"))?;
    let repository = open_repository(config)?;
    let identity = unlock(&repository, password)?;
    let exchange_config = config.exchange_config();

    let stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("connecting to {}", addr))?;
    let channel = Arc::new(StreamChannel::new(stream, exchange_config.max_frame_size));
    let report = run_exchange(channel, repository, identity, &exchange_config).await?;

    header(&format!("Exchanged with {}", addr));
    field("outcome", format!("{:?}", report.outcome));
    field("new root", report.new_root);
    field("blocks added", report.blocks_added);
    field("served", report.requests_served);
    Ok(())
}

/// Yields one channel per accepted TCP connection until Ctrl-C.
struct TcpAcceptor {
    listener: TcpListener,
    config: ExchangeConfig,
}

#[async_trait]
impl Connector for TcpAcceptor {
    async fn connect(&self) -> tlog_exchange::Result<Option<Arc<dyn FrameChannel>>> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "peer connected");
                        let channel: Arc<dyn FrameChannel> =
                            Arc::new(StreamChannel::new(stream, self.config.max_frame_size));
                        return Ok(Some(channel));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = tokio::signal::ctrl_c() => return Ok(None),
            }
        }
    }
}

async fn listen(config: &NodeConfig, password: &str) -> Result<()> {
    let repository = open_repository(config)?;
    let identity = unlock(&repository, password)?;
    let exchange_config = config.exchange_config();

    let listener = TcpListener::bind(&config.node.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.node.listen_addr))?;
    info!(addr = %config.node.listen_addr, user = identity.user_id(), "listening for exchanges");

    let acceptor = TcpAcceptor {
        listener,
        config: exchange_config.clone(),
    };
    let exchanger = Exchanger::new(repository, identity, exchange_config);
    exchanger.run(&acceptor).await?;
    info!("shutting down");
    Ok(())
}
