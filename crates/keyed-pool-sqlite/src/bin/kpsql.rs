use std::path::PathBuf;
use std::process;

use anyhow::Context;
use keyed_pool::PoolConfig;
use keyed_pool_sqlite::{SqliteConfig, SqlitePoolExt, Value};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

struct Args {
    db_path: PathBuf,
    sql: String,
    repeat: usize,
    pool_size: Option<usize>,
    query: bool,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: kpsql <db-path> <sql> [--repeat N] [--pool-size N] [--query]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <db-path>          SQLite database file (created if missing)");
            eprintln!("  <sql>              Statement to run through the pool");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --repeat <n>       Submit the statement n times concurrently [default: 1]");
            eprintln!("  --pool-size <n>    Connections in the pool [default: $KEYED_POOL_SIZE or 6]");
            eprintln!("  --query            Print result rows instead of affected-row counts");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(args)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut positional: Vec<String> = Vec::new();
    let mut repeat = 1usize;
    let mut pool_size: Option<usize> = None;
    let mut query = false;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--repeat" => {
                i += 1;
                let raw = args.get(i).ok_or("--repeat requires a value")?;
                repeat = parse_count("--repeat", raw)?;
            }
            "--pool-size" => {
                i += 1;
                let raw = args.get(i).ok_or("--pool-size requires a value")?;
                pool_size = Some(parse_count("--pool-size", raw)?);
            }
            "--query" => query = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => {
                if positional.len() == 2 {
                    return Err(format!("unexpected argument: {arg}"));
                }
                positional.push(arg.to_string());
            }
        }
        i += 1;
    }

    let mut positional = positional.into_iter();
    let db_path = positional
        .next()
        .ok_or("missing required argument: <db-path>")?;
    let sql = positional.next().ok_or("missing required argument: <sql>")?;

    Ok(Args {
        db_path: PathBuf::from(db_path),
        sql,
        repeat,
        pool_size,
        query,
    })
}

fn parse_count(flag: &str, raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("{flag} must be a positive integer, got '{raw}'")),
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = PoolConfig::from_env()?;
    if let Some(n) = args.pool_size {
        config = config.with_pool_size(n);
    }

    let pool = keyed_pool_sqlite::open(SqliteConfig::new(&args.db_path), config)
        .with_context(|| format!("failed to open {}", args.db_path.display()))?;

    let result = if args.query {
        run_queries(&pool, &args).await
    } else {
        run_statements(&pool, &args).await
    };

    println!("{}", serde_json::to_string(&pool.status())?);

    pool.shutdown().await?;
    result
}

async fn run_statements(pool: &keyed_pool_sqlite::SqlitePool, args: &Args) -> anyhow::Result<()> {
    let pending: Vec<_> = (0..args.repeat)
        .map(|_| pool.execute(args.sql.clone(), Vec::new()))
        .collect();

    let mut failures = 0usize;
    for (i, p) in pending.into_iter().enumerate() {
        match p.await {
            Ok(changed) => println!("{}", serde_json::json!({ "run": i, "changed": changed })),
            Err(e) => {
                failures += 1;
                tracing::error!(run = i, error = %e, "Statement failed");
            }
        }
    }
    anyhow::ensure!(failures == 0, "{failures} of {} runs failed", args.repeat);
    Ok(())
}

async fn run_queries(pool: &keyed_pool_sqlite::SqlitePool, args: &Args) -> anyhow::Result<()> {
    let pending: Vec<_> = (0..args.repeat)
        .map(|_| pool.query_rows(args.sql.clone(), Vec::new()))
        .collect();

    let mut failures = 0usize;
    for (i, p) in pending.into_iter().enumerate() {
        match p.await {
            Ok(rows) => {
                let rows: Vec<Vec<serde_json::Value>> = rows
                    .into_iter()
                    .map(|row| row.into_iter().map(value_to_json).collect())
                    .collect();
                println!("{}", serde_json::json!({ "run": i, "rows": rows }));
            }
            Err(e) => {
                failures += 1;
                tracing::error!(run = i, error = %e, "Query failed");
            }
        }
    }
    anyhow::ensure!(failures == 0, "{failures} of {} runs failed", args.repeat);
    Ok(())
}

fn value_to_json(value: Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(n) => n.into(),
        Value::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => s.into(),
        Value::Blob(bytes) => bytes.into(),
    }
}

/// Initialize tracing with the same env conventions as the library logs.
///
/// `RUST_LOG` wins when set; otherwise `KEYED_POOL_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines. Logs go to stderr so stdout
/// stays machine-readable.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("KEYED_POOL_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "keyed_pool={level},keyed_pool_sqlite={level},kpsql={level}"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}
