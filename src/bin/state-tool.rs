//! Offline tool for the bridge's persisted state snapshot.
//!
//! Usage:
//!   cargo run --bin state-tool -- list
//!   cargo run --bin state-tool -- show [entity]
//!   cargo run --bin state-tool -- remove <entity>

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use zigbee_state_bridge::config::{Config, load_dotenv};
use zigbee_state_bridge::instance_lock::InstanceLock;
use zigbee_state_bridge::state::cache::{read_snapshot, write_snapshot};

#[derive(Parser)]
#[command(name = "state-tool")]
#[command(about = "Inspect and edit the zigbee-state-bridge state snapshot")]
struct Cli {
    /// Data directory of the bridge
    #[arg(long, env = "BRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cached entities with their property count
    List,
    /// Print the cached state of one entity, or of all
    Show {
        entity: Option<String>,
    },
    /// Drop an entity from the snapshot (the bridge must be stopped)
    Remove {
        entity: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();
    let cli = Cli::parse();

    let mut cache = Config::from_env().cache;
    if let Some(dir) = cli.data_dir {
        cache.data_dir = dir;
    }
    let path = cache.state_path();
    let entries: BTreeMap<_, _> = read_snapshot(&path).into_iter().collect();

    match cli.command {
        Commands::List => {
            println!("{} entities in {:?}", entries.len(), path);
            for (entity, properties) in &entries {
                println!("  {} ({} properties)", entity, properties.len());
            }
        }
        Commands::Show { entity: None } => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Commands::Show {
            entity: Some(entity),
        } => match entries.get(&entity) {
            Some(properties) => println!("{}", serde_json::to_string_pretty(properties)?),
            None => eprintln!("No cached state for {}", entity),
        },
        Commands::Remove { entity } => {
            // A running bridge would overwrite the file on its next save
            let _lock = InstanceLock::acquire(&cache.data_dir)?;

            let mut entries = entries;
            if entries.remove(&entity).is_none() {
                eprintln!("No cached state for {}", entity);
                return Ok(());
            }
            write_snapshot(&path, &entries)?;
            println!("Removed {} ({} entities left)", entity, entries.len());
        }
    }

    Ok(())
}
