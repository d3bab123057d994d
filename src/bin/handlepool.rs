use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Instant;

use handlepool::config::{load_config, Config};
use handlepool::{params, AccessMode, DbError, HandlePool, PoolConfig, PoolStatus, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: handlepool <db-path> [--max-size N] [--threads N] [--iterations N] [--config FILE] [--json]";

/// Command-line options
#[derive(Debug)]
struct Args {
    db_path: Option<PathBuf>,
    max_size: Option<usize>,
    threads: usize,
    iterations: usize,
    config: Option<PathBuf>,
    json: bool,
}

fn parse_args(args: &[String]) -> std::result::Result<Args, String> {
    let mut parsed = Args {
        db_path: None,
        max_size: None,
        threads: 4,
        iterations: 100,
        config: None,
        json: false,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--max-size" => parsed.max_size = Some(number(iter.next(), arg)?),
            "--threads" => parsed.threads = number(iter.next(), arg)?,
            "--iterations" => parsed.iterations = number(iter.next(), arg)?,
            "--config" => {
                parsed.config = Some(iter.next().map(PathBuf::from).ok_or(format!("{} needs a value", arg))?);
            }
            "--json" => parsed.json = true,
            flag if flag.starts_with("--") => return Err(format!("unknown option {}", flag)),
            path if parsed.db_path.is_none() => parsed.db_path = Some(PathBuf::from(path)),
            extra => return Err(format!("unexpected argument {}", extra)),
        }
    }
    Ok(parsed)
}

fn number(value: Option<&String>, flag: &str) -> std::result::Result<usize, String> {
    value
        .ok_or(format!("{} needs a value", flag))?
        .parse()
        .map_err(|e| format!("invalid value for {}: {}", flag, e))
}

/// Reads `--config`, or `<config dir>/handlepool/config.toml` when it exists.
fn resolve_config(args: &Args) -> Result<Option<Config>> {
    let path = match &args.config {
        Some(path) => Some(path.clone()),
        None => dirs::config_dir()
            .map(|dir| dir.join("handlepool").join("config.toml"))
            .filter(|path| path.exists()),
    };
    path.map(load_config).transpose()
}

fn pool_config(args: &Args, config: Option<&Config>) -> Result<PoolConfig> {
    let mut pool = match (&args.db_path, config) {
        (Some(path), Some(config)) => PoolConfig {
            path: path.clone(),
            ..config.pool.clone()
        },
        (Some(path), None) => PoolConfig::new(path.clone()),
        (None, Some(config)) => config.pool.clone(),
        (None, None) => return Err(DbError::Config(USAGE.to_string())),
    };
    if let Some(max_size) = args.max_size {
        pool.max_size = max_size;
    }
    pool.validate()?;
    Ok(pool)
}

/// Each worker inserts `iterations` rows in small transactions and reads the
/// table back through a shared lease every tenth iteration.
fn run_workload(pool: &HandlePool, threads: usize, iterations: usize) -> Result<i64> {
    pool.with_handle(AccessMode::Exclusive, |h| {
        h.execute_batch(
            "CREATE TABLE IF NOT EXISTS workload (
                id INTEGER PRIMARY KEY,
                worker INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                payload TEXT
            );",
        )
    })?;

    let workers: Vec<_> = (0..threads)
        .map(|worker| {
            let pool = pool.clone();
            thread::spawn(move || -> Result<()> {
                for seq in 0..iterations {
                    pool.with_handle(AccessMode::Exclusive, |h| {
                        h.transaction(|tx| {
                            tx.execute(
                                "INSERT INTO workload (worker, seq, payload) VALUES (?1, ?2, ?3)",
                                params![worker as i64, seq as i64, format!("worker-{}-{}", worker, seq)],
                            )
                        })
                    })?;
                    if seq % 10 == 0 {
                        pool.with_handle(AccessMode::Shared, |h| {
                            h.query_row("SELECT COUNT(*) FROM workload", params![], |row| row.get_i64(0))
                        })?;
                    }
                }
                Ok(())
            })
        })
        .collect();

    for worker in workers {
        worker
            .join()
            .map_err(|_| DbError::State("worker thread panicked".to_string()))??;
    }

    let total = pool.with_handle(AccessMode::Shared, |h| {
        h.query_row("SELECT COUNT(*) FROM workload", params![], |row| row.get_i64(0))
    })?;
    Ok(total.unwrap_or(0))
}

fn report(status: &PoolStatus, rows: i64, elapsed_ms: u128, json: bool) {
    if json {
        let out = serde_json::json!({
            "rows": rows,
            "elapsed_ms": elapsed_ms,
            "status": status,
        });
        println!("{}", out);
    } else {
        println!("rows in workload table: {}", rows);
        println!("elapsed: {} ms", elapsed_ms);
        println!("pool: {}", status);
    }
}

fn run(args: Args) -> Result<()> {
    let config = resolve_config(&args)?;
    let pool = HandlePool::new(pool_config(&args, config.as_ref())?)?;
    info!(path = %pool.config().path.display(), threads = args.threads, iterations = args.iterations, "starting workload");

    let started = Instant::now();
    let rows = run_workload(&pool, args.threads, args.iterations)?;
    let elapsed_ms = started.elapsed().as_millis();

    let status = pool.status();
    pool.shutdown()?;
    report(&status, rows, elapsed_ms, args.json);
    Ok(())
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{}\n{}", msg, USAGE);
            return ExitCode::from(2);
        }
    };

    // Initialize the logging system using tracing subscriber; RUST_LOG overrides the config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let configured = args
            .config
            .as_ref()
            .and_then(|path| load_config(path).ok())
            .and_then(|config| config.log)
            .and_then(|log| log.filter);
        EnvFilter::new(configured.as_deref().unwrap_or("warn"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "handlepool failed");
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}
