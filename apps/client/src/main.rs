//! `veilchat-keys`: inspect or reset a local vault.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use veilchat_client::config::ClientConfig;
use veilchat_client::telemetry::init_tracing;
use veilchat_crypto::engine::CryptoEngine;
use veilchat_crypto::error::CryptoError;
use veilchat_crypto::protection_key::{KeychainKeyStore, ProtectionKeyStore};
use veilchat_crypto::vault::{KeyVault, PRIVATE_KEY_RECORD};
use veilchat_shared::ids::UserId;

/// Inspect or reset the encrypted key vault of a local user.
#[derive(Parser)]
#[command(name = "veilchat-keys")]
#[command(about = "Inspect or reset a local veilchat key vault")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show where the vault lives and whether its private key is usable
    Status {
        /// User id (UUID) owning the vault
        user: UserId,
    },

    /// Print the public key derived from the stored private key
    PublicKey {
        /// User id (UUID) owning the vault
        user: UserId,
    },

    /// Delete the vault and its protection key
    Reset {
        /// User id (UUID) owning the vault
        user: UserId,

        /// Confirm the irreversible reset
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let config = ClientConfig::load()?;
    init_tracing(&config.log_level);

    let vault = KeyVault::new(&config.vault_dir, key_store(&config)?);

    match cli.command {
        Commands::Status { user } => status(&vault, user).await,
        Commands::PublicKey { user } => {
            let engine = load_engine(&vault, user).await?;
            println!("{}", engine.export_current_public_key()?);
            Ok(())
        }
        Commands::Reset { user, yes } => {
            if !yes {
                return Err("refusing to reset without --yes".into());
            }
            vault.reset_user(&user)?;
            println!("vault for {user} removed");
            Ok(())
        }
    }
}

/// Vaults written by earlier runs are only reachable through the OS keychain.
fn key_store(config: &ClientConfig) -> Result<Arc<dyn ProtectionKeyStore>, Box<dyn std::error::Error>> {
    if !config.use_os_keychain {
        return Err("use_os_keychain is disabled: vaults are session-only and cannot be inspected".into());
    }
    Ok(Arc::new(KeychainKeyStore))
}

async fn status(vault: &KeyVault, user: UserId) -> Result<(), Box<dyn std::error::Error>> {
    println!("database:  {}", vault.database_path(&user).display());
    println!("exists:    {}", vault.database_exists(&user));

    match vault.set_current_user(user, true).await {
        Ok(()) => {}
        Err(CryptoError::VaultUnavailable) => {
            let verdict = if vault.database_exists(&user) {
                "protection key missing (vault unrecoverable)"
            } else {
                "no vault (new user)"
            };
            println!("state:     {verdict}");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    println!("records:   {}", vault.record_count().await?);
    match vault.get_bytes(PRIVATE_KEY_RECORD).await {
        Some(der) => {
            let mut engine = CryptoEngine::new();
            match engine.import_private_key(&der) {
                Ok(fingerprint) => println!("key:       {}", fingerprint.short()),
                Err(e) => println!("key:       unusable ({e})"),
            }
        }
        None => println!("key:       missing"),
    }
    if vault.undecryptable_reads() > 0 {
        println!("warning:   {} record(s) failed to decrypt", vault.undecryptable_reads());
    }
    Ok(())
}

async fn load_engine(vault: &KeyVault, user: UserId) -> Result<CryptoEngine, Box<dyn std::error::Error>> {
    vault.set_current_user(user, true).await?;
    let der = vault
        .get_bytes(PRIVATE_KEY_RECORD)
        .await
        .ok_or("no private key in vault")?;
    let mut engine = CryptoEngine::new();
    engine.import_private_key(&der)?;
    Ok(engine)
}
