//! dircache - Directory Attribute Cache
//!
//! Command line front end: inspect and query the cache, manage custom
//! shards, replay recorded change streams.
//!
//! ```text
//! dircache shards
//! dircache add-shard --name mails --value mail --filter '(mail=*)'
//! dircache groups-for-user uid=alice,cn=users,dc=example
//! dircache ingest changes.jsonl
//! ```

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dircache::cache::config::{DEFAULT_CACHE_DIR, DEFAULT_SHARD_CONFIG};
use dircache::directory::ENTRY_DN;
use dircache::{
    groups_for_user, replay, users_in_group, CacheConfig, CacheEngine, Filter, Result,
    ShardDefinition, ShardRegistry,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// dircache - Directory attribute cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the shard databases
    #[arg(long, global = true, env = "DIRCACHE_DIR", default_value = DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    /// JSON file with custom shard definitions
    #[arg(long, global = true, env = "DIRCACHE_SHARD_CONFIG", default_value = DEFAULT_SHARD_CONFIG)]
    shard_config: PathBuf,

    /// Maximum size of the database map in MiB
    #[arg(long, global = true, env = "DIRCACHE_MAP_SIZE_MB", default_value = "1024")]
    map_size_mb: usize,

    /// Maximum number of shards
    #[arg(long, global = true, env = "DIRCACHE_MAX_SHARDS", default_value = "64")]
    max_shards: u32,

    /// Events between two cleanup passes (0 disables periodic cleanup)
    #[arg(long, global = true, env = "DIRCACHE_CLEANUP_INTERVAL", default_value = "1000")]
    cleanup_interval: u64,

    /// Do not activate the built-in membership shards
    #[arg(long, global = true, env = "DIRCACHE_NO_BUILTIN_SHARDS")]
    no_builtin_shards: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the active shards
    Shards,

    /// Register a custom shard definition
    AddShard(ShardArgs),

    /// Unregister a custom shard definition
    RemoveShard(ShardArgs),

    /// Look up a key in a shard
    Get {
        /// Shard name
        shard: String,
        /// Lookup key
        key: String,
    },

    /// Groups a user (or group) belongs to
    GroupsForUser {
        /// DN of the user
        dn: String,
        /// Direct memberships only
        #[arg(long)]
        direct: bool,
    },

    /// Users belonging to a group
    UsersInGroup {
        /// DN of the group
        dn: String,
        /// Ignore nested groups
        #[arg(long)]
        direct: bool,
    },

    /// Replay a JSON-lines change stream
    Ingest {
        /// Input file, `-` for stdin
        #[arg(default_value = "-")]
        file: String,
    },

    /// Purge stale records from every shard
    Cleanup,

    /// Shard sizes and counters
    Stats {
        /// Prometheus text format instead of JSON
        #[arg(long)]
        prometheus: bool,
    },
}

#[derive(clap::Args, Debug)]
struct ShardArgs {
    /// Shard name
    #[arg(long)]
    name: String,

    /// Key attribute
    #[arg(long, default_value = ENTRY_DN)]
    key: String,

    /// Value attribute
    #[arg(long)]
    value: String,

    /// Filter selecting the indexed entries
    #[arg(long)]
    filter: String,

    /// Keep one value per key
    #[arg(long)]
    single_value: bool,

    /// Index values to keys
    #[arg(long)]
    reverse: bool,
}

impl ShardArgs {
    fn definition(&self) -> Result<ShardDefinition> {
        Filter::parse(&self.filter)?;
        let mut def = ShardDefinition::new(&self.name, &self.key, &self.value, &self.filter);
        if self.single_value {
            def = def.single_value();
        }
        if self.reverse {
            def = def.reverse();
        }
        def.validate()?;
        Ok(def)
    }
}

impl Args {
    fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            cache_dir: self.cache_dir.clone(),
            shard_config: self.shard_config.clone(),
            map_size_mb: self.map_size_mb,
            max_shards: self.max_shards,
            cleanup_interval: self.cleanup_interval,
            builtin_shards: !self.no_builtin_shards,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    match &args.command {
        Command::AddShard(shard) => {
            let registry = ShardRegistry::new(&args.shard_config);
            let def = shard.definition()?;
            if registry.add_definition(&def)? {
                println!("added {}", def);
            } else {
                println!("already registered: {}", def);
            }
            return Ok(());
        }
        Command::RemoveShard(shard) => {
            let registry = ShardRegistry::new(&args.shard_config);
            let def = shard.definition()?;
            if registry.remove_definition(&def)? {
                println!("removed {}", def);
            } else {
                println!("not registered: {}", def);
            }
            return Ok(());
        }
        _ => {}
    }

    let engine = CacheEngine::open(args.cache_config())?;

    match args.command {
        Command::AddShard(_) | Command::RemoveShard(_) => {}
        Command::Shards => {
            let reader = engine.read()?;
            for shard in engine.shards() {
                println!("{}\t{}\t{}", shard.name(), shard.len(Some(&reader))?, shard.definition());
            }
        }
        Command::Get { shard, key } => {
            for value in engine.get_sub_cache(&shard)?.get(&key, None)? {
                println!("{}", value);
            }
        }
        Command::GroupsForUser { dn, direct } => {
            for group in groups_for_user(&engine, &dn, !direct, None)? {
                println!("{}", group);
            }
        }
        Command::UsersInGroup { dn, direct } => {
            for user in users_in_group(&engine, &dn, !direct, None)? {
                println!("{}", user);
            }
        }
        Command::Ingest { file } => {
            info!(input = %file, "Replaying change stream");
            let summary = if file == "-" {
                replay(&engine, io::stdin().lock())?
            } else {
                replay(&engine, BufReader::new(File::open(&file)?))?
            };
            print_json(&summary)?;
        }
        Command::Cleanup => {
            let report = engine.cleanup()?;
            print_json(&report)?;
        }
        Command::Stats { prometheus } => {
            if prometheus {
                print!("{}", engine.metrics().to_prometheus()?);
            } else {
                print_json(&stats(&engine)?)?;
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct Stats {
    shards: Vec<ShardStats>,
    metrics: dircache::cache::MetricsSnapshot,
}

#[derive(Serialize)]
struct ShardStats {
    name: String,
    entries: u64,
    definition: ShardDefinition,
}

fn stats(engine: &CacheEngine) -> Result<Stats> {
    let reader = engine.read()?;
    let shards = engine
        .shards()
        .iter()
        .map(|shard| {
            Ok(ShardStats {
                name: shard.name().to_string(),
                entries: shard.len(Some(&reader))?,
                definition: shard.definition().clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Stats {
        shards,
        metrics: engine.metrics().snapshot(),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr, stdout carries command output
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init();
    }
}
