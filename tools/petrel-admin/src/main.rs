// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use clap::Parser;
use clap_derive::{Parser, Subcommand};
use eyre::{Report, bail, eyre};
use figment::Figment;
use figment::providers::{Format, Json, Serialized, Yaml};
use fs2::FileExt;
use petrel_db::{
    Database, DatabaseConfig, DatabaseDesign, PendingMaintenance, StoreDb, Table, TableDesign, Value,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

#[derive(Parser, Debug)]
#[command(version, about = "Offline maintenance for petrel database directories")]
struct Args {
    #[arg(help = "Directory holding the database files")]
    data_dir: PathBuf,

    #[arg(long, help = "YAML or JSON file with database configuration overrides")]
    config: Option<PathBuf>,

    #[arg(long, help = "Enable debug logging")]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print version, pending maintenance and per-table statistics.
    Info,
    /// Rebuild every index from the table heaps.
    Rebuild,
    /// Compact every table heap and rebuild its indexes.
    Defragment,
    /// Print every record of a table.
    Dump { table: String },
}

fn load_config(path: Option<&Path>) -> Result<DatabaseConfig, Report> {
    // Maintenance runs only when asked for.
    let defaults = DatabaseConfig {
        repair_on_open: false,
        ..DatabaseConfig::default()
    };
    let Some(path) = path else {
        return Ok(defaults);
    };
    let figment = Figment::new().merge(Serialized::defaults(defaults));
    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Yaml::file(path)),
    };
    figment
        .extract()
        .map_err(|e| eyre!("Failed to parse configuration from {:?}: {}", path, e))
}

fn acquire_lock(data_dir: &Path) -> Result<File, Report> {
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(data_dir.join(".petrel.lock"))?;
    if let Err(e) = lock_file.try_lock_exclusive() {
        error!(?data_dir, "database directory is in use by another process");
        bail!("Directory lock acquisition failed: {}", e);
    }
    Ok(lock_file)
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Int(i) => i.to_string(),
        Value::String(s) => format!("{s:?}"),
        Value::DateTime(dt) => dt.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Blob(handle) if handle.is_none() => "<no blob>".to_string(),
        Value::Blob(handle) => format!("<blob {}>", handle.0),
    }
}

fn print_info(db: &StoreDb) -> Result<(), Report> {
    let version = db.version_info();
    println!("directory:   {}", db.dir().display());
    println!("version:     {} ({})", version.version, version.build_tag);
    println!("maintenance: {}", db.pending_maintenance());
    for name in db.table_names() {
        let table = db.table(&name)?;
        let wasted = table.compute_wasted_space()?;
        println!(
            "\n{name}: {} records, {}/{} slots live ({:.0}% wasted){}",
            table.count()?,
            wasted.live,
            wasted.total,
            wasted.ratio() * 100.0,
            if table.is_dirty() { ", dirty" } else { "" }
        );
        let columns = table.columns();
        for column in &columns {
            println!("  column {} {}", column.name, column.column_type);
        }
        for index in table.indexes() {
            let names: Vec<&str> = index.columns.iter().map(|c| columns[*c].name.as_str()).collect();
            match index.value_column {
                Some(v) => println!("  index  {} -> {}", names.join("+"), columns[v].name),
                None => println!("  index  {}", names.join("+")),
            }
        }
    }
    Ok(())
}

fn dump_table(db: &StoreDb, name: &str) -> Result<(), Report> {
    let table = db.table(name)?;
    let names: Vec<String> = table.columns().into_iter().map(|c| c.name).collect();
    println!("id\t{}", names.join("\t"));
    let mut dumped = 0;
    for id in 0..table.peek_next_id() {
        let Some(record) = table.get_record(id)? else {
            continue;
        };
        let fields: Vec<String> = record.values()?.iter().map(format_value).collect();
        println!("{id}\t{}", fields.join("\t"));
        dumped += 1;
    }
    info!(table = name, dumped, "dumped table");
    Ok(())
}

fn report_progress(table: &str, done: u64, total: u64) {
    if total > 0 && (done == total || done % 10_000 == 0) {
        info!(table, done, total, "progress");
    }
}

fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" }));
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_env_filter(filter)
        .with_target(false)
        .with_span_events(FmtSpan::NONE)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if !args.data_dir.is_dir() {
        bail!("{:?} is not a database directory", args.data_dir);
    }
    let _lock = acquire_lock(&args.data_dir)?;
    let config = load_config(args.config.as_deref())?;
    let db = StoreDb::new(&args.data_dir, config)?;
    if !db.load_structure()? {
        bail!("No database structure found in {:?}", args.data_dir);
    }
    db.open_database()?;

    match &args.command {
        Command::Info => print_info(&db)?,
        Command::Rebuild => {
            for name in db.table_names() {
                let table = db.table(&name)?;
                table.rebuild_indexes(true, &mut |done, total| report_progress(&name, done, total))?;
            }
            db.run_maintenance(&mut report_progress)?;
            info!("rebuilt all indexes");
        }
        Command::Defragment => {
            if db.pending_maintenance() != PendingMaintenance::Defragment {
                for name in db.table_names() {
                    let table = db.table(&name)?;
                    table.defragment(&mut |done, total| report_progress(&name, done, total))?;
                }
            }
            db.run_maintenance(&mut report_progress)?;
            info!("defragmented all tables");
        }
        Command::Dump { table } => dump_table(&db, table)?,
    }

    let pending = db.pending_maintenance();
    if pending != PendingMaintenance::None {
        warn!(%pending, "maintenance pending; run `rebuild` or `defragment`");
    }
    db.close()?;
    Ok(())
}
