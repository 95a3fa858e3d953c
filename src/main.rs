use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::Parser;
use connect_e2ee::store::{Backend, FileStore, InMemoryBackend};
use connect_e2ee::{Client, ClientConfig, DeviceAddress, MemoryDirectory};
use log::{info, warn};

// Runs a conversation between two in-process devices.
//
// Usage:
//   cargo run                                   # 5 round trips, in memory
//   cargo run -- --rounds 20 --reorder          # deliver each batch out of order
//   cargo run -- --store-dir ./state            # keep keys and sessions on disk
//   cargo run -- --config config.json           # override key lifecycle policy

#[derive(Parser, Debug)]
#[command(about = "End-to-end encrypted conversation between two local devices")]
struct Args {
    /// Number of message round trips.
    #[arg(short, long, default_value_t = 5)]
    rounds: u32,

    /// Deliver each batch of messages in reverse order.
    #[arg(long)]
    reorder: bool,

    /// Persist device state under this directory instead of memory.
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// JSON file with a client configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(run(args))
}

async fn backend_for(args: &Args, device: &str) -> Result<Arc<dyn Backend>> {
    Ok(match &args.store_dir {
        Some(dir) => Arc::new(
            FileStore::new(dir.join(device))
                .await
                .with_context(|| format!("failed to open store for {device}"))?,
        ),
        None => Arc::new(InMemoryBackend::new()),
    })
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            let json = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            ClientConfig::from_json(&json).context("invalid configuration")?
        }
        None => ClientConfig::default(),
    };

    let directory = Arc::new(MemoryDirectory::new());
    let alice = Client::builder(DeviceAddress::new("alice", "phone"))
        .with_config(config.clone())
        .with_backend(backend_for(&args, "alice").await?)
        .with_directory(directory.clone())
        .build()?;
    let bob = Client::builder(DeviceAddress::new("bob", "laptop"))
        .with_config(config)
        .with_backend(backend_for(&args, "bob").await?)
        .with_directory(directory)
        .build()?;

    info!("alice identity {}", alice.provision().await?);
    info!("bob identity {}", bob.provision().await?);
    let _alice_replenisher = alice.spawn_replenisher().await;
    let _bob_replenisher = bob.spawn_replenisher().await;

    if !alice.has_session(bob.address()).await? {
        alice.establish_session(bob.address()).await?;
    }

    for round in 1..=args.rounds {
        let mut batch = Vec::new();
        for n in 1..=3 {
            let text = format!("round {round} message {n}");
            batch.push((text.clone(), alice.encrypt(bob.address(), text.as_bytes()).await?));
        }
        if args.reorder {
            batch.reverse();
        }
        for (expected, wire) in &batch {
            let plaintext = bob.decrypt(alice.address(), wire).await?;
            if plaintext != expected.as_bytes() {
                bail!("bob decrypted the wrong message");
            }
            info!("bob <- {}", String::from_utf8_lossy(&plaintext));
        }

        let reply = format!("ack {round}");
        let wire = bob.encrypt(alice.address(), reply.as_bytes()).await?;
        let plaintext = alice.decrypt(bob.address(), &wire).await?;
        info!("alice <- {}", String::from_utf8_lossy(&plaintext));

        // Replaying a delivered message must fail.
        if bob.decrypt(alice.address(), &batch[0].1).await.is_ok() {
            bail!("replayed message was accepted");
        }
    }

    let alice_id = alice.session_id(bob.address()).await?;
    let bob_id = bob.session_id(alice.address()).await?;
    if alice_id != bob_id {
        warn!("session fingerprints differ");
        bail!("devices disagree on the session");
    }
    info!("session fingerprint {}", hex::encode(alice_id));

    let report = alice.run_maintenance().await?;
    info!("alice maintenance: {:?}", report);
    Ok(())
}
