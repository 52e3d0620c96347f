//! Server Main Loop + Lifecycle (C6, C7): owns the server FIFO, spawns a
//! Teller per connecting client, drains the shared request queue, applies
//! mutations under the database mutex, and performs the seven-step ordered
//! shutdown.
//!
//! A `clap::Parser` struct drives a single `run()` call; child-process
//! tracking and the TERM-then-KILL escalation on shutdown follow the
//! standard broker pattern of giving children a bounded grace period before
//! forcing them.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Instant;

use clap::Parser;
use thiserror::Error;

use adabank::account::AccountTable;
use adabank::config::{self, DEFAULT_SERVER_FIFO_NAME, POLL_INTERVAL, SHUTDOWN_DEADLINE};
use adabank::engine;
use adabank::fifo;
use adabank::log::TransactionLog;
use adabank::queue::{self, RequestKind};
use adabank::shm::ShmHandle;
use adabank::shutdown::Shutdown;

#[derive(Parser)]
#[command(about = "AdaBank transaction broker server")]
struct Cmd {
    /// Name shared by the server FIFO and the shared-memory segment.
    #[arg(default_value_t = DEFAULT_SERVER_FIFO_NAME.to_string())]
    server_fifo_name: String,
}

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Shm(#[from] adabank::shm::Error),
    #[error(transparent)]
    Queue(#[from] queue::Error),
    #[error(transparent)]
    Log(#[from] adabank::log::Error),
    #[error(transparent)]
    Fifo(#[from] fifo::Error),
    #[error(transparent)]
    Shutdown(#[from] adabank::shutdown::Error),
    #[error(transparent)]
    Engine(#[from] engine::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("could not locate the bank-teller binary next to this executable")]
    MissingTellerBinary,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cmd = Cmd::parse();
    if let Err(e) = run(cmd) {
        tracing::error!(error = %e, "server exiting after a fatal error");
        std::process::exit(1);
    }
}

fn teller_binary_path() -> Result<PathBuf, Error> {
    let mut path = std::env::current_exe()?;
    path.pop();
    path.push("bank-teller");
    if !path.exists() {
        return Err(Error::MissingTellerBinary);
    }
    Ok(path)
}

fn run(cmd: Cmd) -> Result<(), Error> {
    let teller_path = teller_binary_path()?;
    let shutdown = Shutdown::install()?;

    let tmp_dir = config::tmp_dir();
    let log_path = config::log_path(&tmp_dir, &cmd.server_fifo_name);
    let mut log = TransactionLog::open(&log_path)?;

    let shm_name = config::shm_segment_name(&cmd.server_fifo_name);
    let (mut shm, created) = ShmHandle::create_or_attach(&shm_name)?;
    if created {
        shm.mark_owner();
    }
    // Regardless of create-vs-attach, the log alone is authoritative.
    TransactionLog::replay(&log_path, &mut shm.region_mut().accounts)?;

    let server_fifo_path = tmp_dir.join(&cmd.server_fifo_name);
    fifo::create(&server_fifo_path)?;
    // Held open for the server's lifetime so the FIFO always has a writer.
    let _sentinel = fifo::open_sentinel_writer(&server_fifo_path)?;
    let mut reader = fifo::open_read_nonblocking(&server_fifo_path)?;

    tracing::info!(fifo = %server_fifo_path.display(), shm = %shm_name, created, "server ready");

    let mut tellers: HashMap<u32, Child> = HashMap::new();
    let mut pending = String::new();

    loop {
        if shutdown.requested() {
            break;
        }

        reap_exited_tellers(&mut tellers);

        if fifo::wait_readable(&reader, POLL_INTERVAL)? {
            drain_server_fifo(&mut reader, &mut pending, &mut tellers, &teller_path, &cmd.server_fifo_name)?;
        }

        let mut drained_any = false;
        while let Some((idx, request)) = queue::try_pop(&shm)? {
            drained_any = true;
            apply_request(&shm, &mut log, idx, request)?;
        }
        if !drained_any {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
    }

    tracing::info!("shutdown requested, beginning ordered teardown");
    shutdown_sequence(tellers, &reader, &server_fifo_path, shm)?;
    Ok(())
}

fn apply_request(
    shm: &ShmHandle,
    log: &mut TransactionLog,
    idx: usize,
    request: adabank::queue::RequestSlot,
) -> Result<(), Error> {
    shm.region().db_mutex.wait()?;
    let apply_result = (|| -> Result<_, Error> {
        let accounts: &mut AccountTable = &mut shm.region_mut().accounts;
        let outcome = match request.kind {
            RequestKind::Deposit => engine::apply_deposit(accounts, log, request.bank_id, request.amount)?,
            RequestKind::Withdraw => engine::apply_withdraw(accounts, log, request.bank_id, request.amount)?,
        };
        queue::write_result(shm, idx, outcome.bank_id, outcome.balance, outcome.status);
        Ok(())
    })();
    shm.region().db_mutex.post()?;
    apply_result?;
    queue::post_response(shm, idx)?;
    Ok(())
}

fn drain_server_fifo(
    reader: &mut std::fs::File,
    pending: &mut String,
    tellers: &mut HashMap<u32, Child>,
    teller_path: &Path,
    server_fifo_name: &str,
) -> Result<(), Error> {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => pending.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    while let Some(pos) = pending.find('\n') {
        let line = pending[..pos].trim().to_string();
        pending.drain(..=pos);
        if line.is_empty() {
            continue;
        }
        match line.parse::<u32>() {
            Ok(pid) if pid > 0 => spawn_teller(pid, tellers, teller_path, server_fifo_name),
            _ => tracing::warn!(token = %line, "ignoring malformed client pid"),
        }
    }
    Ok(())
}

fn spawn_teller(client_pid: u32, tellers: &mut HashMap<u32, Child>, teller_path: &Path, server_fifo_name: &str) {
    if tellers.contains_key(&client_pid) {
        return;
    }
    match Command::new(teller_path)
        .arg(client_pid.to_string())
        .arg(server_fifo_name)
        .spawn()
    {
        Ok(child) => {
            tracing::info!(client_pid, "spawned teller");
            tellers.insert(client_pid, child);
        }
        Err(e) => tracing::error!(client_pid, error = %e, "failed to spawn teller"),
    }
}

fn reap_exited_tellers(tellers: &mut HashMap<u32, Child>) {
    tellers.retain(|pid, child| match child.try_wait() {
        Ok(Some(_)) => {
            tracing::info!(client_pid = pid, "teller exited");
            false
        }
        Ok(None) => true,
        Err(e) => {
            tracing::warn!(client_pid = pid, error = %e, "failed to poll teller status");
            true
        }
    });
}

/// Ordered teardown: stop accepting, TERM every Teller, wait bounded, KILL
/// stragglers, unlink the server FIFO, destroy the shared region, flush the log.
fn shutdown_sequence(
    mut tellers: HashMap<u32, Child>,
    _reader: &std::fs::File,
    server_fifo_path: &Path,
    shm: ShmHandle,
) -> Result<(), Error> {
    for child in tellers.values() {
        // SAFETY: child.id() names a Teller process we spawned and still track.
        unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    }

    let deadline = Instant::now() + SHUTDOWN_DEADLINE;
    while Instant::now() < deadline && !tellers.is_empty() {
        reap_exited_tellers(&mut tellers);
        if tellers.is_empty() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }

    for (pid, mut child) in tellers {
        tracing::warn!(client_pid = pid, "teller did not exit in time, sending KILL");
        let _ = child.kill();
        let _ = child.wait();
    }

    fifo::remove(server_fifo_path);
    shm.destroy()?;
    // TransactionLog flushes and fsyncs on every append; nothing further to
    // do here beyond letting it drop.
    Ok(())
}
