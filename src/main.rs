use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use dexm_node::config::NodeConfig;
use dexm_node::ledger::{unix_now, Ledger};
use dexm_node::node::Node;
use dexm_node::sync::{broadcast_message, HttpSync};
use dexm_node::wallet::WalletFile;
use dexm_node::wire::Envelope;

#[derive(Debug, Parser)]
#[command(name = "dexm-node", version, about = "Dexm peer-to-peer ledger node")]
struct Cli {
    /// JSON config file; every field is optional
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the block, balance and peer stores
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate a wallet and write it to a file
    #[command(visible_aliases = ["mw", "genwallet"])]
    Makewallet { path: PathBuf },

    /// Run a node until interrupted
    #[command(visible_aliases = ["sn", "rn"])]
    Startnode {
        /// Port to serve the sync endpoints on
        #[arg(long)]
        port: Option<u16>,
        /// Extra bootstrap peer (`ip` or `ip:port`), repeatable
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Address credited for mined blocks
        #[arg(long)]
        miner: Option<String>,
        /// Mine the pending transactions every N seconds
        #[arg(long, value_name = "SECS")]
        mine_every: Option<u64>,
    },

    /// Sign a transfer from a wallet file and gossip it
    #[command(visible_aliases = ["mkt"])]
    Maketransaction {
        wallet: PathBuf,
        recipient: String,
        amount: u64,
        #[arg(long, default_value_t = 0)]
        gas: u64,
        /// Node to deliver to, repeatable; defaults to the local node
        #[arg(long = "peer")]
        peers: Vec<String>,
    },

    /// Print the balance record of an address (node must be stopped)
    #[command(visible_aliases = ["gb"])]
    Getbalance { address: String },

    /// Copy balance and nonce from the local ledger into a wallet file
    #[command(visible_aliases = ["fw"])]
    Fixwallet { wallet: PathBuf },

    /// Mine one block from the local store and gossip it (node must be stopped)
    Mine {
        #[arg(long)]
        miner: String,
    },
}

fn load_config(cli: &Cli) -> Result<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Command::Makewallet { path } => cmd_makewallet(path),
        Command::Startnode {
            port,
            peers,
            miner,
            mine_every,
        } => cmd_startnode(config, port, peers, miner, mine_every).await,
        Command::Maketransaction {
            wallet,
            recipient,
            amount,
            gas,
            peers,
        } => cmd_maketransaction(config, wallet, recipient, amount, gas, peers).await,
        Command::Getbalance { address } => cmd_getbalance(config, &address),
        Command::Fixwallet { wallet } => cmd_fixwallet(config, wallet),
        Command::Mine { miner } => cmd_mine(config, miner).await,
    }
}

fn cmd_makewallet(path: PathBuf) -> Result<()> {
    if path.exists() {
        bail!("{} already exists", path.display());
    }
    let wallet = WalletFile::generate();
    wallet.save(&path)?;
    println!("Generated wallet {}", wallet.address);
    Ok(())
}

async fn cmd_startnode(
    mut config: NodeConfig,
    port: Option<u16>,
    peers: Vec<String>,
    miner: Option<String>,
    mine_every: Option<u64>,
) -> Result<()> {
    if let Some(port) = port {
        config.listen_addr.set_port(port);
    }
    config.bootstrap_peers.extend(peers);
    if miner.is_some() {
        config.miner_address = miner;
    }
    if mine_every.is_some() && config.miner_address.is_none() {
        bail!("--mine-every needs a miner address (--miner or miner_address in the config)");
    }

    let node = Node::init(config).context("failed to initialize node")?;
    let addr = node.start()?;
    info!(%addr, "Dexm node running, press Ctrl-C to stop");

    let miner_task = mine_every.map(|secs| {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = node.mine_block() {
                    warn!(error = %e, "mining failed");
                }
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    if let Some(task) = miner_task {
        task.abort();
    }
    node.shutdown().await;
    Ok(())
}

async fn cmd_maketransaction(
    config: NodeConfig,
    wallet_path: PathBuf,
    recipient: String,
    amount: u64,
    gas: u64,
    mut peers: Vec<String>,
) -> Result<()> {
    let mut wallet = WalletFile::load(&wallet_path)?;
    let tx = wallet.new_transaction(&recipient, amount, gas, unix_now())?;
    wallet.save(&wallet_path)?;
    info!(from = %wallet.address, to = %recipient, amount, gas, nonce = tx.nonce, "Generated transaction");

    if peers.is_empty() {
        peers.push(format!("127.0.0.1:{}", config.listen_addr.port()));
    }
    let sync = HttpSync::new(
        config.connect_timeout(),
        config.request_timeout(),
        config.peer_port,
    )?;
    let report = broadcast_message(Arc::new(sync), peers, Envelope::transaction(&tx)?).await;
    if report.delivered == 0 {
        bail!("transaction was not delivered to any node");
    }
    println!("Transaction delivered to {} node(s)", report.delivered);
    Ok(())
}

fn cmd_getbalance(config: NodeConfig, address: &str) -> Result<()> {
    let ledger = Ledger::open(&config.data_dir, config.ledger_params())?;
    let record = ledger.get_balance(address)?;
    println!(
        "Balance for {address} is {} (nonce {}, burned {})",
        record.balance, record.nonce, record.burn
    );
    Ok(())
}

fn cmd_fixwallet(config: NodeConfig, wallet_path: PathBuf) -> Result<()> {
    let mut wallet = WalletFile::load(&wallet_path)?;
    let ledger = Ledger::open(&config.data_dir, config.ledger_params())?;
    wallet.sync_from(&ledger.get_balance(&wallet.address)?);
    wallet.save(&wallet_path)?;
    println!(
        "Wallet {} now has balance {} and nonce {}",
        wallet.address, wallet.balance, wallet.nonce
    );
    Ok(())
}

async fn cmd_mine(mut config: NodeConfig, miner: String) -> Result<()> {
    config.miner_address = Some(miner);
    let node = Node::init(config)?;
    let (block, relay) = node.mine_block()?;
    let report = relay.await?;
    println!(
        "Mined block {} and sent it to {} of {} peer(s)",
        block.index,
        report.delivered,
        report.delivered + report.failed
    );
    Ok(())
}
