//! Write-ahead transaction log (C1): append-only record of CREATE / DEPOSIT /
//! WITHDRAW / CLOSE events, authoritative on-disk state. Replay is the sole
//! source of truth for the in-memory account table on startup.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::account::{AccountError, AccountTable};
use crate::transaction::{LogEvent, ParseLogEventError};

const HEADER: &str = "# adabank transaction log";

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open log file: {0}")]
    Open(#[source] io::Error),
    #[error("failed to append to log: {0}")]
    Append(#[source] io::Error),
    #[error("failed to flush log: {0}")]
    Flush(#[source] io::Error),
}

/// Append-only log file, flushed and `fsync`'d before every response is
/// allowed to reach a client (see `append_flushed`).
pub struct TransactionLog {
    writer: BufWriter<File>,
}

impl TransactionLog {
    /// Opens the log for appending, creating it with a header line if it
    /// does not exist yet. A missing log file on startup is expected, not
    /// an error: it means a fresh broker with an empty account table.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(Error::Open)?;
        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "{HEADER}").map_err(Error::Append)?;
            writer.flush().map_err(Error::Flush)?;
        }
        Ok(Self { writer })
    }

    /// Appends one event and flushes + `fsync`s before returning, so the
    /// caller may safely post the response semaphore right afterwards: the
    /// in-memory mutation must never be visible to a client before the
    /// event that produced it is durable on disk.
    pub fn append_flushed(&mut self, event: LogEvent) -> Result<(), Error> {
        writeln!(self.writer, "{event}").map_err(Error::Append)?;
        self.writer.flush().map_err(Error::Flush)?;
        self.writer.get_ref().sync_data().map_err(Error::Flush)?;
        Ok(())
    }

    /// Rebuilds an account table from scratch by replaying every event in
    /// file order. Unknown verbs and malformed numbers are warned about and
    /// skipped; inconsistent-but-parseable events (e.g. a DEPOSIT against an
    /// id replay shows inactive) are applied anyway, since the final
    /// recorded balance wins.
    pub fn replay(path: &Path, table: &mut AccountTable) -> Result<(), Error> {
        table.init();
        if !path.exists() {
            return Ok(());
        }
        let file = File::open(path).map_err(Error::Open)?;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(Error::Open)?;
            match line.parse::<LogEvent>() {
                Ok(event) => apply(table, event),
                Err(ParseLogEventError::Blank) | Err(ParseLogEventError::Comment) => {}
                Err(e) => {
                    tracing::warn!(line = lineno + 1, raw = %line, error = %e, "skipping unreadable log record");
                }
            }
        }
        Ok(())
    }
}

fn apply(table: &mut AccountTable, event: LogEvent) {
    let result: Result<(), AccountError> = match event {
        LogEvent::Create { id, initial_balance } => table.create(id, initial_balance),
        LogEvent::Deposit { id, balance_after, .. } => table.set_balance(id, balance_after),
        LogEvent::Withdraw { id, balance_after, .. } => table.set_balance(id, balance_after),
        LogEvent::Close { id } => table.close(id),
    };
    if let Err(e) = result {
        tracing::warn!(?event, error = %e, "log replay applied an inconsistent record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MAX_ACCOUNTS;

    fn boxed_table() -> Box<AccountTable> {
        let mut table: Box<AccountTable> = unsafe {
            let layout = std::alloc::Layout::new::<AccountTable>();
            let ptr = std::alloc::alloc(layout) as *mut AccountTable;
            Box::from_raw(ptr)
        };
        table.init();
        table
    }

    #[test]
    fn replaying_missing_log_yields_empty_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent.log");
        let mut table = boxed_table();
        TransactionLog::replay(&path, &mut table).unwrap();
        assert_eq!(table.iter_active().count(), 0);
    }

    #[test]
    fn scenario_s1_fresh_start_single_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.log");
        let mut log = TransactionLog::open(&path).unwrap();
        log.append_flushed(LogEvent::Create { id: 0, initial_balance: 1000 }).unwrap();
        log.append_flushed(LogEvent::Deposit { id: 0, amount: 1000, balance_after: 1000 }).unwrap();
        log.append_flushed(LogEvent::Withdraw { id: 0, amount: 400, balance_after: 600 }).unwrap();
        log.append_flushed(LogEvent::Withdraw { id: 0, amount: 600, balance_after: 0 }).unwrap();
        log.append_flushed(LogEvent::Close { id: 0 }).unwrap();
        drop(log);

        let mut table = boxed_table();
        TransactionLog::replay(&path, &mut table).unwrap();
        assert!(!table.is_active(0));
    }

    #[test]
    fn scenario_s5_crash_recovery_replays_final_balances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.log");
        {
            let mut log = TransactionLog::open(&path).unwrap();
            log.append_flushed(LogEvent::Create { id: 0, initial_balance: 1000 }).unwrap();
            log.append_flushed(LogEvent::Deposit { id: 0, amount: 1000, balance_after: 1000 }).unwrap();
            log.append_flushed(LogEvent::Create { id: 1, initial_balance: 2000 }).unwrap();
            log.append_flushed(LogEvent::Deposit { id: 1, amount: 2000, balance_after: 2000 }).unwrap();
            // simulated crash: log handle dropped without further writes
        }
        {
            // "restart": replay, then continue the session
            let mut table = boxed_table();
            TransactionLog::replay(&path, &mut table).unwrap();
            assert_eq!(table.balance(0).unwrap(), 1000);
            assert_eq!(table.balance(1).unwrap(), 2000);

            let mut log = TransactionLog::open(&path).unwrap();
            let balance = table.deposit(0, 500).unwrap();
            log.append_flushed(LogEvent::Deposit { id: 0, amount: 500, balance_after: balance }).unwrap();
            let outcome = table.withdraw(1, 1000).unwrap();
            log.append_flushed(LogEvent::Withdraw {
                id: 1,
                amount: 1000,
                balance_after: outcome.balance_after,
            })
            .unwrap();
        }

        let mut table = boxed_table();
        TransactionLog::replay(&path, &mut table).unwrap();
        assert_eq!(table.balance(0).unwrap(), 1500);
        assert_eq!(table.balance(1).unwrap(), 1000);
    }

    #[quickcheck_macros::quickcheck]
    fn replay_from_empty_is_deterministic(ids: Vec<u8>) -> bool {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.log");
        let mut log = TransactionLog::open(&path).unwrap();
        for id in &ids {
            let id = (*id as u32) % MAX_ACCOUNTS as u32;
            log.append_flushed(LogEvent::Create { id, initial_balance: 10 }).unwrap();
        }
        drop(log);

        let mut a = boxed_table();
        TransactionLog::replay(&path, &mut a).unwrap();
        let mut b = boxed_table();
        TransactionLog::replay(&path, &mut b).unwrap();
        a.iter_active().collect::<Vec<_>>() == b.iter_active().collect::<Vec<_>>()
    }
}
