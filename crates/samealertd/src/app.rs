//! Read loop
//!
//! ```txt
//!   start
//!   ||
//!   \/
//! +-------------+  line  +-------------+
//! |   Reading   | =====> |  Ingesting  | (holds the drain lock)
//! +-------------+ <===== +-------------+
//!   ||     ||                 ||
//!   EOF    read error         store error
//!   ||     ||                 ||
//!   \/     \/                 \/
//!   Ok     Err <==============||
//! ```
//!
//! A line is ingested while holding the *drain lock*. The signal
//! handler takes the same lock before it exits the process, so
//! a signal which arrives mid-line waits until that line has
//! been committed and published.

use std::io::{self, BufRead, Read};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use chrono::Utc;
use log::{debug, info, warn};

use samealert::{AlertSink, IngestStats, Ingester, LineOutcome, MAX_MESSAGE_LENGTH};

/// Longest input line read in full, in bytes
///
/// Anything past this is discarded. The line is still ingested,
/// and the parser rejects it as too long.
pub const MAX_LINE_LENGTH: usize = 4 * MAX_MESSAGE_LENGTH;

/// Run the application
///
/// Reads `input` line by line, passing each line to the
/// `ingester`, until the input is exhausted. Returns an error
/// if the input cannot be read or an alert cannot be stored.
pub fn run<S, R>(
    ingester: &mut Ingester<S>,
    input: &mut R,
    drain: &Mutex<()>,
) -> Result<IngestStats, anyhow::Error>
where
    S: AlertSink,
    R: BufRead + ?Sized,
{
    let mut buf = Vec::with_capacity(MAX_MESSAGE_LENGTH + 2);
    loop {
        buf.clear();
        let nread = (&mut *input)
            .take(MAX_LINE_LENGTH as u64)
            .read_until(b'\n', &mut buf)
            .context("unable to read input")?;
        if nread == 0 {
            info!("end of input");
            break;
        }
        if nread == MAX_LINE_LENGTH && buf.last() != Some(&b'\n') {
            warn!("input line exceeds {} bytes; discarding the rest", MAX_LINE_LENGTH);
            discard_line(input).context("unable to read input")?;
        }

        // decoders may emit garbage bytes; the parser rejects them
        let line = String::from_utf8_lossy(&buf);

        let _guard = lock(drain);
        ingester.ingest_line(&line, Utc::now())?;
    }

    let stats = *ingester.stats();
    info!(
        "read {} lines: {} stored, {} suppressed, {} rejected",
        stats.lines, stats.stored, stats.suppressed, stats.rejected
    );
    Ok(stats)
}

// Skip input through the next newline
fn discard_line<R: BufRead + ?Sized>(input: &mut R) -> io::Result<()> {
    loop {
        let (found, used) = {
            let available = input.fill_buf()?;
            if available.is_empty() {
                return Ok(());
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(i) => (true, i + 1),
                None => (false, available.len()),
            }
        };
        input.consume(used);
        if found {
            return Ok(());
        }
    }
}

/// Ingest a single `message` and return
///
/// Fails if the message is not a valid SAME header.
pub fn run_message<S>(
    ingester: &mut Ingester<S>,
    message: &str,
    drain: &Mutex<()>,
) -> Result<LineOutcome, anyhow::Error>
where
    S: AlertSink,
{
    let _guard = lock(drain);
    let outcome = ingester.ingest_line(message, Utc::now())?;
    match &outcome {
        LineOutcome::Skipped => anyhow::bail!("not a SAME header: \"{}\"", message.trim()),
        LineOutcome::Rejected(err) => {
            anyhow::bail!("invalid SAME header \"{}\": {}", message.trim(), err)
        }
        LineOutcome::Suppressed => debug!("message is a recent repeat"),
        LineOutcome::Stored(_) => {}
    }
    Ok(outcome)
}

/// Wait until no line is being ingested
///
/// The returned guard blocks the read loop until dropped.
pub fn lock(drain: &Mutex<()>) -> MutexGuard<'_, ()> {
    drain.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::io::{self, BufReader, Cursor, Read};
    use std::sync::Arc;

    use super::*;

    use samealert::{AlertQuery, AlertStore, IngestBuilder, ReferenceTables};

    const TOR: &str = "ZCZC-EAS-TOR-048013+0030-2921845-KLOX/NWS-";

    fn ingester() -> Ingester<AlertStore> {
        IngestBuilder::new().build(
            Arc::new(ReferenceTables::default()),
            AlertStore::open_in_memory().unwrap(),
        )
    }

    // reader which fails after its content is consumed
    struct Broken(Cursor<Vec<u8>>);

    impl Read for Broken {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.read(buf)? {
                0 => Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")),
                n => Ok(n),
            }
        }
    }

    #[test]
    fn test_run() {
        let drain = Mutex::new(());
        let mut ing = ingester();
        let mut bytes = format!("samedec 0.4.0: reading standard input\n{tor}\n{tor}\n", tor = TOR)
            .into_bytes();
        bytes.extend_from_slice(b"ZCZC-EAS-TOR-048013+0030-2921845-K\xffLOX-\n");
        bytes.extend_from_slice(format!("{}\nNNNN", TOR).as_bytes());
        let mut input = Cursor::new(bytes);

        let stats = run(&mut ing, &mut input, &drain).unwrap();
        assert_eq!(6, stats.lines);
        assert_eq!(1, stats.stored);
        assert_eq!(2, stats.suppressed);
        assert_eq!(2, stats.skipped);
        assert_eq!(1, stats.rejected);
        assert_eq!(1, ing.sink().query(&AlertQuery::default()).unwrap().len());
    }

    #[test]
    fn test_run_overlong_line() {
        let drain = Mutex::new(());
        let mut ing = ingester();
        let mut bytes = b"ZCZC-".to_vec();
        bytes.resize(100_000, b'A');
        bytes.push(b'\n');
        bytes.extend_from_slice(format!("{}\n", TOR).as_bytes());
        let mut input = BufReader::with_capacity(64, Cursor::new(bytes));

        let stats = run(&mut ing, &mut input, &drain).unwrap();
        assert_eq!(2, stats.lines);
        assert_eq!(1, stats.rejected);
        assert_eq!(1, stats.stored);
    }

    #[test]
    fn test_run_read_error() {
        let drain = Mutex::new(());
        let mut ing = ingester();
        let mut input = BufReader::new(Broken(Cursor::new(format!("{}\n", TOR).into_bytes())));

        assert!(run(&mut ing, &mut input, &drain).is_err());

        // the line before the error was committed
        assert_eq!(1, ing.stats().stored);
        assert!(drain.try_lock().is_ok());
    }

    #[test]
    fn test_run_message() {
        let drain = Mutex::new(());
        let mut ing = ingester();

        assert!(matches!(
            run_message(&mut ing, TOR, &drain),
            Ok(LineOutcome::Stored(_))
        ));
        assert!(run_message(&mut ing, "ZCZC-EAS-TOR-", &drain).is_err());
        assert!(run_message(&mut ing, "hello", &drain).is_err());
    }
}
