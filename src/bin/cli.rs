//! shmcache CLI
//!
//! Command-line access to a shared cache segment, plus a `stress` worker
//! used to hammer a segment from many processes at once.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use shmcache::{BlockSize, Cache, CacheError, Config, Value};
use tracing_subscriber::{fmt, EnvFilter};

/// shmcache CLI
#[derive(Parser, Debug)]
#[command(name = "shmcache-cli")]
#[command(about = "Inspect and drive a shared memory key-value cache")]
#[command(version)]
struct Args {
    /// Directory holding segment objects (default: /dev/shm or the temp dir)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Segment name
    #[arg(short, long, default_value = "shmcache")]
    name: String,

    /// Segment size in bytes, used only when creating it
    #[arg(short, long, default_value = "1048576")]
    size: u64,

    /// Block size in bytes (64 to 16384, power of two), used only when creating
    #[arg(short, long, default_value = "64")]
    block_size: u32,

    /// Give up on the segment lock after this many milliseconds
    #[arg(long, default_value = "1000")]
    lock_timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the value of a key as JSON
    Get {
        key: String,
    },

    /// Store a value; text that is not valid JSON is stored as a string
    Set {
        key: String,
        value: String,
    },

    /// Delete a key
    Del {
        key: String,
    },

    /// Report whether a key exists
    Has {
        key: String,
    },

    /// List keys in insertion order
    Keys,

    /// Print all entries (optionally only keys with a prefix) as one JSON object
    Dump {
        prefix: Option<String>,
    },

    /// Add to a counter and print the new value
    Incr {
        key: String,
        #[arg(default_value = "1", allow_hyphen_values = true)]
        delta: f64,
    },

    /// Remove every entry
    Clear,

    /// Unlink the segment
    Release,

    /// Print segment counters
    Stats,

    /// Verify segment integrity and print counters
    Check,

    /// Run a deterministic random mix of operations
    Stress {
        /// Number of operations
        #[arg(long, default_value = "10000")]
        ops: u64,

        /// Seed for the operation mix
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Size of the key space
        #[arg(long, default_value = "64")]
        keys: u32,
    },
}

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries command output
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,shmcache=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            if e.is_fatal() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(args: Args) -> shmcache::Result<()> {
    let mut builder = Config::builder()
        .name(&args.name)
        .total_size(args.size)
        .block_size(BlockSize::from_bytes(args.block_size)?)
        .lock_timeout_ms(args.lock_timeout_ms);
    if let Some(dir) = &args.dir {
        builder = builder.shm_dir(dir.clone());
    }
    let config = builder.build();

    // Release must not create the segment first
    let command = match args.command {
        Commands::Release => {
            println!("{}", shmcache::release_with(&config)?);
            return Ok(());
        }
        command => command,
    };

    let cache = Cache::open_with(&config)?;
    match command {
        Commands::Get { key } => match cache.get(&key)? {
            Some(value) => println!("{}", value.to_json()),
            None => println!("(nil)"),
        },
        Commands::Set { key, value } => {
            let value = match serde_json::from_str::<serde_json::Value>(&value) {
                Ok(json) => Value::from_json(&json),
                Err(_) => Value::String(value),
            };
            cache.set(&key, &value)?;
            println!("OK");
        }
        Commands::Del { key } => println!("{}", cache.delete(&key)?),
        Commands::Has { key } => println!("{}", cache.has(&key)?),
        Commands::Keys => {
            for key in cache.keys()? {
                println!("{}", key);
            }
        }
        Commands::Dump { prefix } => {
            println!("{}", cache.dump(prefix.as_deref())?.to_json());
        }
        Commands::Incr { key, delta } => {
            println!("{}", Value::Number(cache.increase(&key, delta)?).to_json());
        }
        Commands::Clear => {
            cache.clear()?;
            println!("OK");
        }
        Commands::Stats => print_json(&cache.stats()?)?,
        Commands::Check => print_json(&cache.check()?)?,
        Commands::Stress { ops, seed, keys } => stress(&cache, ops, seed, keys.max(1))?,
        Commands::Release => {}
    }
    Ok(())
}

fn print_json(stats: &shmcache::SegmentStats) -> shmcache::Result<()> {
    let text = serde_json::to_string_pretty(stats)
        .map_err(|e| CacheError::Codec(e.to_string()))?;
    println!("{}", text);
    Ok(())
}

// =============================================================================
// Stress Worker
// =============================================================================

/// Random values of varying size, some with shared or cyclic parts
fn random_value(rng: &mut StdRng) -> Value {
    match rng.gen_range(0..5) {
        0 => Value::Number(f64::from(rng.gen_range(0..1000u32))),
        1 => Value::String("x".repeat(rng.gen_range(0..300))),
        2 => {
            let len = rng.gen_range(0..8u32);
            let shared = Value::list((0..len).map(Value::from).collect());
            Value::list(vec![shared.clone(), Value::Bool(true), shared])
        }
        3 => {
            let node = Value::map([("id", Value::Number(f64::from(rng.gen_range(0..100u32))))]);
            node.insert("self", node.clone());
            node
        }
        _ => Value::Null,
    }
}

/// Transient lock timeouts are counted and skipped; anything fatal stops
/// the worker. The operation mix is deterministic per seed.
fn stress(cache: &Cache, ops: u64, seed: u64, keys: u32) -> shmcache::Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut timeouts = 0u64;
    let mut failures = 0u64;

    for _ in 0..ops {
        let key = format!("k{}", rng.gen_range(0..keys));
        let result = match rng.gen_range(0..100u32) {
            0..=39 => cache.set(&key, &random_value(&mut rng)),
            40..=54 => cache.delete(&key).map(|_| ()),
            55..=74 => cache.increase(&key, 1.0).map(|_| ()),
            75..=84 => cache.entries().and_then(|entries| {
                for entry in entries {
                    entry?;
                }
                Ok(())
            }),
            _ => cache.get(&key).map(|_| ()),
        };

        match result {
            Ok(()) => {}
            Err(e) if e.is_transient() => timeouts += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(key = %key, error = %e, "operation failed");
                failures += 1;
            }
        }
    }

    println!(
        "{}",
        json!({ "ops": ops, "timeouts": timeouts, "failures": failures })
    );
    Ok(())
}
