use clap::{Arg, Command};
use dvf_ingest::{Importer, ImporterConfig, PgWriter, Source, YearStatus};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let matches = Command::new("import")
        .about("Import DVF property transaction data, one year at a time")
        .arg(Arg::new("start-year").long("start-year").value_parser(clap::value_parser!(u16)))
        .arg(Arg::new("end-year").long("end-year").value_parser(clap::value_parser!(u16)))
        .arg(Arg::new("chunk-size").long("chunk-size").help("Rows per batch (memory/throughput trade-off)").value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("max-memory").long("max-memory").help("Advisory resident-memory ceiling in MB").value_parser(clap::value_parser!(u64)))
        .arg(Arg::new("base-url").long("base-url").help("URL template with a {year} placeholder"))
        .arg(Arg::new("database-url").long("database-url").help("PostgreSQL connection string (default: DATABASE_URL / POSTGRES_* env)"))
        .arg(Arg::new("from-dir").long("from-dir").help("Read {dir}/{year}.csv.gz instead of downloading").value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("delimiter").long("delimiter").help("CSV delimiter: ',' or ';'"))
        .get_matches();

    let mut config = ImporterConfig::from_env();
    if let Some(&y) = matches.get_one::<u16>("start-year") {
        config.start_year = y;
    }
    if let Some(&y) = matches.get_one::<u16>("end-year") {
        config.end_year = y;
    }
    if let Some(&n) = matches.get_one::<usize>("chunk-size") {
        config.chunk_size = n;
    }
    if let Some(&mb) = matches.get_one::<u64>("max-memory") {
        config.memory_ceiling_mb = mb;
    }
    if let Some(url) = matches.get_one::<String>("base-url") {
        config.base_url = url.clone();
    }
    if let Some(url) = matches.get_one::<String>("database-url") {
        config.database_url = url.clone();
    }
    if let Some(dir) = matches.get_one::<PathBuf>("from-dir") {
        config.source_dir = Some(dir.clone());
    }
    if let Some(d) = matches.get_one::<String>("delimiter") {
        config.delimiter = *d.as_bytes().first().unwrap_or(&b',');
    }

    // Single connection: one writer at a time by design.
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&config.database_url)
        .await?;
    let sink = PgWriter::new(pool);

    let source = match config.source_dir.clone() {
        Some(dir) => Source::Dir(dir),
        None => Source::Http,
    };

    info!(
        start_year = config.start_year,
        end_year = config.end_year,
        chunk_size = config.chunk_size,
        memory_ceiling_mb = config.memory_ceiling_mb,
        "import starting"
    );
    let mut importer = Importer::new(config, source, sink)?;

    // Honor Ctrl-C between chunks: the in-flight chunk write completes,
    // the current year is finalized, remaining years are skipped.
    let cancel = importer.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after the current chunk");
            cancel.cancel();
        }
    });

    let report = importer.run().await;

    for run in &report.runs {
        let line = format!(
            "year {}: {:?} ({} inserted, {} duplicate, {} failed, {} invalid, {}s)",
            run.year,
            run.status,
            run.counters.inserted,
            run.counters.skipped,
            run.counters.failed,
            run.counters.invalid,
            run.elapsed.as_secs(),
        );
        match run.status {
            YearStatus::Succeeded => info!("{line}"),
            _ => error!("{line}"),
        }
    }

    std::process::exit(report.exit_code());
}
