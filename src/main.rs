// src/main.rs
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use wcpatch::params::AnalysisParameters;
use wcpatch::runner;
use wcpatch::table::{Table, Value};
use wcpatch::types::Cell;

/// Batch whole-cell patch-clamp analysis: one CSV per result table.
#[derive(Parser, Debug)]
#[command(name = "wcpatch", version, long_about = None)]
struct Args {
    /// JSON array of cells with their trials
    dataset: PathBuf,

    /// JSON analysis parameters, grouped by scope
    params: PathBuf,

    /// Directory receiving the CSV tables
    out_dir: PathBuf,

    /// Raise log verbosity (-v debug, -vv trace); RUST_LOG still wins
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))
}

/// Quotes text cells that would break the CSV row.
fn csv_field(value: &Value) -> String {
    match value {
        Value::Text(s) if s.contains([',', '"', '\n']) => format!("\"{}\"", s.replace('"', "\"\"")),
        other => other.to_string(),
    }
}

fn write_csv(path: &Path, table: &Table) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(file);
    writeln!(w, "{}", table.columns.join(","))?;
    for row in &table.rows {
        let fields: Vec<String> = table
            .columns
            .iter()
            .map(|c| row.get(c).map(csv_field).unwrap_or_default())
            .collect();
        writeln!(w, "{}", fields.join(","))?;
    }
    w.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let cells: Vec<Cell> = read_json(&args.dataset)?;
    let params: AnalysisParameters = read_json(&args.params)?;
    log::info!("loaded {} cells from {}", cells.len(), args.dataset.display());

    let tables = runner::run(&cells, &params).context("analysis failed")?;

    let out_dir = args.out_dir;
    fs::create_dir_all(&out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    for (name, table) in &tables {
        let path = out_dir.join(format!("{name}.csv"));
        write_csv(&path, table)?;
        log::info!("wrote {} ({} rows)", path.display(), table.len());
    }
    Ok(())
}
