use clap::{Parser, Subcommand, ValueEnum};
use nervusdb_v2::Db;
use nervusdb_v2_query::{Params, Value, prepare};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

mod repl;

#[derive(Parser)]
#[command(name = "nervusdb", version, arg_required_else_help = true)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv); overridden by RUST_LOG if set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single Cypher query against a database and print the results.
    Query(QueryArgs),
    /// Open an interactive Cypher REPL against a database.
    Repl(ReplArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Ndjson,
}

#[derive(Parser)]
struct QueryArgs {
    /// Database directory.
    #[arg(long)]
    db: PathBuf,

    /// Cypher query string.
    #[arg(long, conflicts_with = "file")]
    cypher: Option<String>,

    /// Read Cypher query from file.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Parameters as a JSON object (e.g. '{"name":"alice"}').
    #[arg(long)]
    params_json: Option<String>,

    #[arg(long, value_enum, default_value = "ndjson")]
    format: OutputFormat,
}

#[derive(Parser)]
struct ReplArgs {
    /// Database directory.
    #[arg(long)]
    db: PathBuf,
}

fn init_tracing(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("nervusdb={default_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn json_to_value(v: serde_json::Value) -> Value {
    match v {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (k, json_to_value(v)))
                .collect(),
        ),
    }
}

fn parse_params_json(raw: Option<String>) -> Result<Params, String> {
    let mut params = Params::new();
    let Some(raw) = raw else {
        return Ok(params);
    };
    if raw.trim().is_empty() {
        return Ok(params);
    }
    let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_str(&raw)
        .map_err(|e| format!("params_json must be a JSON object: {e}"))?;
    for (k, v) in parsed {
        params.insert(k, json_to_value(v));
    }
    Ok(params)
}

fn read_query(args: &QueryArgs) -> Result<String, String> {
    if let Some(query) = args.cypher.as_ref() {
        return Ok(query.clone());
    }
    let Some(path) = args.file.as_ref() else {
        return Err("either --cypher or --file is required".to_string());
    };
    std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read query file {}: {e}", path.display()))
}

#[tracing::instrument(skip(args), fields(db = %args.db.display()))]
fn run_query(args: QueryArgs) -> Result<(), String> {
    let query = read_query(&args)?;
    let params = parse_params_json(args.params_json)?;

    let db = Db::open(&args.db).map_err(|e| e.to_string())?;
    let snapshot = db.snapshot();
    let prepared = prepare(&query).map_err(|e| e.to_string())?;

    let mut stdout = std::io::stdout().lock();
    match args.format {
        OutputFormat::Ndjson => {
            let iter = prepared.execute_streaming(&snapshot, &params);
            let mut rows = 0u64;
            for item in iter {
                let row = item.map_err(|e| e.to_string())?;
                let mut map = serde_json::Map::with_capacity(row.columns().len());
                for (k, v) in row.columns() {
                    let encoded = serde_json::to_value(v).map_err(|e| e.to_string())?;
                    map.insert(k.clone(), encoded);
                }
                serde_json::to_writer(&mut stdout, &serde_json::Value::Object(map))
                    .map_err(|e| e.to_string())?;
                stdout.write_all(b"\n").map_err(|e| e.to_string())?;
                rows += 1;
            }
            tracing::info!(rows, "query finished");
        }
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Query(args) => run_query(args),
        Commands::Repl(args) => repl::run_repl(&args.db),
    };

    if let Err(message) = result {
        eprintln!("{message}");
        std::process::exit(1);
    }
}
