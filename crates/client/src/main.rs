//! TermRelay command-line client.
//!
//! Pairs with a remote terminal host through a relay and forwards stdin
//! lines as encrypted terminal input.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use protocol::messages::{TerminalOutput, VoiceTranscript};
use protocol::{MessageType, PublicKey};
use relay_client::config::Config;
use relay_client::{keystore, ConnectionState, RelayClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// TermRelay - encrypted remote terminal over a relay.
#[derive(Parser, Debug)]
#[command(name = "termrelay")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Generate and store a new key pair
    Keygen {
        /// Where to write the key file (default: <data_dir>/keys.json)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Print the local public key, generating a key pair if needed
    ShowKey,

    /// Connect to a host through the relay
    Connect {
        /// Six-character pairing code shown by the host
        #[arg(long)]
        code: String,

        /// Host public key (base64)
        #[arg(long, value_name = "BASE64")]
        peer_key: String,

        /// Relay endpoint as host:port (overrides config)
        #[arg(long, value_name = "HOST:PORT")]
        endpoint: Option<String>,

        /// Use ws:// instead of wss://
        #[arg(long)]
        insecure: bool,

        /// Do not reconnect after the connection drops
        #[arg(long)]
        no_reconnect: bool,

        /// Device name sent with the pairing request
        #[arg(long)]
        device_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    // Initialize tracing; RUST_LOG wins over config and --verbose
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.client.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Keygen { output, force } => {
            let path = output.unwrap_or_else(|| config.key_file());
            if path.exists() && !force {
                bail!(
                    "Key file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            let keys = protocol::KeyPair::generate();
            keystore::save(&path, &keys)?;
            println!("Key file:    {}", path.display());
            println!("Public key:  {}", keys.public_key());
            println!("Fingerprint: {}", keys.public_key().fingerprint());
        }
        Commands::ShowKey => {
            let keys = keystore::load_or_generate(&config.key_file())?;
            println!("{}", keys.public_key());
        }
        Commands::Connect {
            code,
            peer_key,
            endpoint,
            insecure,
            no_reconnect,
            device_name,
        } => {
            if let Some(endpoint) = endpoint {
                config.relay.endpoint = endpoint;
                config.validate()?;
            }
            if insecure {
                config.relay.secure = false;
            }
            if no_reconnect {
                config.reconnect.auto_reconnect = false;
            }
            let peer = PublicKey::from_base64(&peer_key).context("Invalid --peer-key")?;
            run_connect(&config, &code, peer, device_name.as_deref()).await?;
        }
    }

    Ok(())
}

/// Connects, pairs, then shuttles stdin and terminal output until Ctrl-C,
/// end of input, or the client gives up reconnecting.
async fn run_connect(
    config: &Config,
    code: &str,
    peer: PublicKey,
    device_name: Option<&str>,
) -> anyhow::Result<()> {
    let keys = keystore::load_or_generate(&config.key_file())?;
    tracing::info!(local = %keys.public_key().fingerprint(), peer = %peer.fingerprint(), "starting session");

    let client = RelayClient::new(config.client_config());
    client.set_keys(keys, peer)?;

    client.state_manager().add_listener(|snapshot| match &snapshot.error_message {
        Some(error) => tracing::info!(state = %snapshot.state, %error, "connection state"),
        None => tracing::info!(state = %snapshot.state, "connection state"),
    });
    let mut states = client.state_manager().subscribe();
    let mut output = client.messages_by_type(MessageType::TerminalOutput)?;
    let mut transcripts = client.messages_by_type(MessageType::VoiceTranscript)?;
    let mut errors = client.errors()?;

    client
        .connect(&config.relay.endpoint, code)
        .await
        .with_context(|| format!("Failed to connect to relay {}", config.relay.endpoint))?;
    client.send_pairing_request(code, device_name).await?;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("received Ctrl-C");
                break;
            }
            line = stdin.next_line() => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if let Err(e) = client.send_terminal_input(&format!("{}\n", line)).await {
                        tracing::warn!(error = %e, "input not sent");
                    }
                }
                None => break,
            },
            Some(envelope) = output.next() => match client.open_as::<TerminalOutput>(&envelope) {
                Ok(out) => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(out.output.as_bytes())?;
                    stdout.flush()?;
                }
                Err(e) => tracing::warn!(error = %e, "could not open terminal output"),
            },
            Some(envelope) = transcripts.next() => match client.open_as::<VoiceTranscript>(&envelope) {
                Ok(transcript) if transcript.is_final => println!("[voice] {}", transcript.text),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "could not open transcript"),
            },
            Some(event) = errors.next() => {
                tracing::warn!(kind = %event.kind, "{}", event.message);
            }
            Ok(snapshot) = states.recv() => {
                if snapshot.state == ConnectionState::Error {
                    eprintln!(
                        "Connection failed: {}",
                        snapshot.error_message.unwrap_or_default()
                    );
                    break;
                }
            }
        }
    }

    client.dispose().await;
    Ok(())
}
