//! vaultward operator tool
//!
//! Drives a vaultward data directory from the command line. Passwords are
//! read from the first line of stdin so they never appear in argv or shell
//! history:
//!
//! ```text
//! printf '%s\n' "$PASSWORD" | vaultward init
//! printf '%s\n' "$PASSWORD" | vaultward audit --level security
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};
use zeroize::Zeroizing;

use vaultward_engine::{
    default_data_dir, AuditLevel, EngineOptions, SecurityEngine, UnlockOutcome, WipeReason,
    DATA_DIR_ENV,
};

/// vaultward security engine operator tool
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Data directory (defaults to $XDG_DATA_HOME/vaultward)
    #[arg(long, env = DATA_DIR_ENV)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Set the master password for a new vault
    Init {
        /// Also issue recovery codes and print them
        #[arg(long)]
        recovery_codes: bool,
    },
    /// Check the master password (counts as an unlock attempt)
    Unlock,
    /// Print the security status as JSON
    Status,
    /// Print audit entries (requires the master password)
    Audit {
        /// Maximum entries to print, newest last
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Minimum level: info, warning, security or critical
        #[arg(long, default_value = "info")]
        level: AuditLevel,
    },
    /// Irrecoverably destroy every stored secret
    Wipe {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },
    /// Manage recovery codes
    Recovery {
        #[command(subcommand)]
        action: RecoveryAction,
    },
    /// Configure the dead-man's switch (requires the master password)
    DeadMan {
        #[command(subcommand)]
        action: DeadManAction,
    },
}

#[derive(Subcommand, Debug)]
enum RecoveryAction {
    /// Issue a new batch, replacing the old one (requires the master password)
    Generate,
    /// Redeem a code to reset the attempt counters
    Redeem { code: String },
}

#[derive(Subcommand, Debug)]
enum DeadManAction {
    Enable {
        /// Inactivity window in days (defaults to the policy value)
        #[arg(long)]
        days: Option<u32>,
    },
    Disable,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultward_engine=info,vaultward_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => default_data_dir().context("Failed to resolve data directory")?,
    };
    debug!("Using data directory {:?}", data_dir);

    let engine = SecurityEngine::open(EngineOptions::new(&data_dir))
        .await
        .with_context(|| format!("Failed to open vault at {:?}", data_dir))?;

    let result = run(&engine, args.command).await;
    engine.lock().await;
    result
}

async fn run(engine: &Arc<SecurityEngine>, command: Command) -> Result<()> {
    match command {
        Command::Init { recovery_codes } => {
            let password = read_password().await?;
            engine
                .set_master_password(password.as_bytes())
                .await
                .context("Failed to set master password")?;
            info!("Master password set");
            if recovery_codes {
                print_codes(&engine.generate_recovery_codes().await?);
            }
        }
        Command::Unlock => {
            unlock(engine).await?;
            println!("unlocked");
        }
        Command::Status => {
            let status = engine
                .get_security_status()
                .await
                .context("Failed to read security status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Audit { limit, level } => {
            unlock(engine).await?;
            for entry in engine.audit_entries(limit, level).await? {
                println!(
                    "{} {:<8} {}",
                    entry.timestamp.to_rfc3339(),
                    entry.level.as_str(),
                    entry.message
                );
            }
        }
        Command::Wipe { yes } => {
            if !yes {
                bail!("Refusing to wipe without --yes");
            }
            let destroyed = engine
                .wipe(WipeReason::Requested)
                .await
                .context("Wipe failed")?;
            println!("wiped {} files", destroyed);
        }
        Command::Recovery { action } => match action {
            RecoveryAction::Generate => {
                unlock(engine).await?;
                print_codes(&engine.generate_recovery_codes().await?);
            }
            RecoveryAction::Redeem { code } => {
                if !engine.redeem_recovery_code(&code).await? {
                    bail!("Recovery code rejected");
                }
                println!("attempt counters reset");
            }
        },
        Command::DeadMan { action } => {
            unlock(engine).await?;
            match action {
                DeadManAction::Enable { days } => {
                    engine.configure_dead_man_switch(true, days).await?;
                    println!("dead-man switch armed");
                }
                DeadManAction::Disable => {
                    engine.configure_dead_man_switch(false, None).await?;
                    println!("dead-man switch disarmed");
                }
            }
        }
    }
    Ok(())
}

/// Read the password from stdin and unlock, turning every non-success
/// outcome into an error.
async fn unlock(engine: &SecurityEngine) -> Result<()> {
    let password = read_password().await?;
    match engine.unlock(password.as_bytes()).await? {
        UnlockOutcome::Unlocked => Ok(()),
        UnlockOutcome::Rejected { remaining_attempts } => {
            bail!("Wrong password ({} attempts left before wipe)", remaining_attempts)
        }
        UnlockOutcome::RateLimited { retry_after_ms } => {
            bail!("Too many attempts, retry in {} ms", retry_after_ms)
        }
        UnlockOutcome::BackingOff { until } => {
            bail!("Locked out until {}", until.to_rfc3339())
        }
        UnlockOutcome::Wiped { permanent } => {
            if permanent {
                bail!("Permanent lockout reached; the vault has been wiped")
            }
            bail!("Too many failed attempts; the vault has been wiped")
        }
        UnlockOutcome::DeadManTriggered => {
            bail!("Dead-man switch window elapsed; the vault has been wiped")
        }
        UnlockOutcome::NotConfigured => bail!("No master password is set; run `vaultward init`"),
    }
}

async fn read_password() -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read password from stdin")?;
    let trimmed = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(trimmed);
    if line.is_empty() {
        bail!("Expected a password on stdin");
    }
    Ok(line)
}

fn print_codes(codes: &[String]) {
    println!("Recovery codes (each works once, store them offline):");
    for code in codes {
        println!("  {}", code);
    }
}
