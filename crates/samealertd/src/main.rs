use std::io;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use chrono::{Duration, Utc};
use clap::Parser;
use log::{error, info, warn, LevelFilter};

use samealert::{AlertStore, IngestBuilder, Ingester, ReferenceTables, RetryPolicy};

mod app;
mod cli;

use cli::{Args, CliError};

/// Upper bound on the store retry delay, in multiples of the initial delay
const MAX_BACKOFF_FACTOR: u32 = 20;

fn main() {
    match samealertd() {
        Ok(()) => {}
        Err(cli_error) => cli_error.exit(),
    }
}

fn samealertd() -> Result<(), CliError> {
    // Parse options and start logging
    let args = Args::try_parse()?;
    log_setup(&args);

    // reference tables are shared, read-only
    let tables = ReferenceTables::load(&args.data_dir).with_context(|| {
        format!(
            "Unable to load reference tables from --data-dir \"{}\"",
            args.data_dir.display()
        )
    })?;
    let (events, originators, states, counties) = tables.len();
    info!(
        "loaded {} events, {} originators, {} states, {} counties",
        events, originators, states, counties
    );

    // open and migrate the store
    let store = AlertStore::open(
        &args.db,
        std::time::Duration::from_millis(samealert::DEFAULT_BUSY_TIMEOUT_MS),
    )
    .with_context(|| format!("Unable to open --db \"{}\"", args.db.display()))?;
    match store.stats() {
        Ok(stats) => info!("store \"{}\": {}", args.db.display(), stats),
        Err(e) => warn!("unable to read store statistics: {}", e),
    }

    let mut ingester = ingester_setup(&args, Arc::new(tables), store)?;

    // signals wait for the line in progress
    let drain = Arc::new(Mutex::new(()));
    let handler_drain = Arc::clone(&drain);
    ctrlc::set_handler(move || {
        let _guard = app::lock(&handler_drain);
        info!("received signal, exiting");
        std::process::exit(0);
    })
    .context("Unable to install signal handler")?;

    // single-message mode
    if let Some(message) = &args.message {
        info!("storing one message from --message or SAMEDEC_MSG");
        app::run_message(&mut ingester, message, &drain)?;
        return Ok(());
    }

    // file setup: locks stdin in case we need it
    let stdin = io::stdin();
    let stdin_handle = stdin.lock();
    let mut input = file_setup(&args, stdin_handle)?;

    let stats = app::run(&mut ingester, &mut input, &drain)?;
    if stats.publish_failures > 0 {
        error!(
            "{} alerts were stored but not published to \"{}\"",
            stats.publish_failures,
            args.snapshot.display()
        );
    }

    Ok(())
}

fn ingester_setup(
    args: &Args,
    tables: Arc<ReferenceTables>,
    store: AlertStore,
) -> Result<Ingester<AlertStore>, anyhow::Error> {
    let backoff = args.store_backoff();
    let mut builder = IngestBuilder::new();
    builder
        .with_dedup_window(Duration::seconds(args.dedup_window as i64))
        .with_dedup_capacity(args.dedup_capacity as usize)
        .with_rollover_tolerance(Duration::days(args.rollover_tolerance_days as i64))
        .with_store_retry(RetryPolicy::new(
            args.store_retries,
            backoff,
            backoff.saturating_mul(MAX_BACKOFF_FACTOR),
        ));
    if let Some(snapshot) = args.snapshot_path() {
        builder.with_snapshot(snapshot);
    }

    let mut ingester = builder.build(tables, store);

    // repeats of alerts stored before a restart stay suppressed
    let seeded = ingester.seed(&Utc::now())?;
    if seeded > 0 {
        info!("{} recent alerts loaded for duplicate suppression", seeded);
    }

    Ok(ingester)
}

fn log_setup(args: &Args) {
    if args.quiet {
        // no logging
        return;
    } else if std::env::var_os("RUST_LOG").is_none() {
        // parameter controls
        let log_filter = match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        pretty_env_logger::formatted_builder()
            .filter_module("samealert", log_filter)
            .filter_module("samealertd", log_filter)
            .init();
    } else {
        // environment controls
        pretty_env_logger::init();
    }
}

fn file_setup<'stdin>(
    args: &Args,
    stdin: std::io::StdinLock<'stdin>,
) -> Result<Box<dyn io::BufRead + 'stdin>, anyhow::Error> {
    if args.input_is_stdin() {
        if is_terminal(&std::io::stdin()) {
            warn!("reading SAME headers from a terminal; type one per line, or pipe in a decoder");
        } else {
            info!("reading standard input");
        }
        Ok(Box::new(stdin))
    } else {
        info!("reading file: \"{}\"", &args.file);
        let file = std::fs::File::open(&args.file)
            .with_context(|| format!("Unable to open --file \"{}\"", args.file))?;
        if file.metadata().map(|m| m.is_dir()).unwrap_or(false) {
            return Err(anyhow!("--file \"{}\" is a directory", args.file));
        }
        Ok(Box::new(io::BufReader::new(file)))
    }
}

#[cfg(not(target_os = "windows"))]
fn is_terminal<S>(stream: &S) -> bool
where
    S: std::os::fd::AsRawFd,
{
    terminal_size::terminal_size_using_fd(stream.as_raw_fd()).is_some()
}

#[cfg(target_os = "windows")]
fn is_terminal<S>(stream: &S) -> bool
where
    S: std::os::windows::io::AsRawHandle,
{
    terminal_size::terminal_size_using_handle(stream.as_raw_handle()).is_some()
}
