//! Teller Worker (C5): one per client, spawned by the server with a single
//! argument, the client's pid. Bridges the client's two FIFOs and the
//! shared request queue.

use std::io::{BufRead, BufReader, Write};

use clap::Parser;
use thiserror::Error;

use adabank::config::{self, DEFAULT_SERVER_FIFO_NAME};
use adabank::fifo;
use adabank::protocol;
use adabank::queue::{self, RequestSlot};
use adabank::shm::ShmHandle;
use adabank::shutdown::Shutdown;

#[derive(Parser)]
struct Cmd {
    /// Pid of the client this Teller serves.
    client_pid: u32,
    /// Name shared by the server FIFO and the shared-memory segment.
    #[arg(default_value_t = DEFAULT_SERVER_FIFO_NAME.to_string())]
    server_fifo_name: String,
}

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Shm(#[from] adabank::shm::Error),
    #[error(transparent)]
    Fifo(#[from] fifo::Error),
    #[error(transparent)]
    Shutdown(#[from] adabank::shutdown::Error),
    #[error(transparent)]
    Queue(#[from] queue::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cmd = Cmd::parse();
    if let Err(e) = run(cmd) {
        tracing::error!(error = %e, "teller exiting after an error");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), Error> {
    let shutdown = Shutdown::install()?;
    let tmp_dir = config::tmp_dir();
    let req_path = config::request_fifo_path(&tmp_dir, cmd.client_pid);
    let res_path = config::response_fifo_path(&tmp_dir, cmd.client_pid);

    // Both opens block until the client, which created these FIFOs, opens
    // the matching end; the two rendezvous independently.
    let req_file = fifo::open_read_blocking(&req_path)?;
    let mut res_file = fifo::open_write(&res_path)?;

    let shm_name = config::shm_segment_name(&cmd.server_fifo_name);
    let (shm, _created) = ShmHandle::create_or_attach(&shm_name)?;

    let mut lines = BufReader::new(req_file).lines();
    loop {
        if shutdown.requested() {
            tracing::info!(client_pid = cmd.client_pid, "shutdown observed, exiting after in-flight work");
            break;
        }

        let line = match lines.next() {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(e.into()),
            None => {
                tracing::info!(client_pid = cmd.client_pid, "client disconnected");
                break;
            }
        };

        let reply = match protocol::parse_command(&line) {
            Ok(command) => submit(&shm, cmd.client_pid, command)?,
            Err(e) => {
                tracing::debug!(client_pid = cmd.client_pid, raw = %line, error = %e, "rejecting malformed command");
                protocol::BAD_FORMAT_RESPONSE.to_string()
            }
        };

        if let Err(e) = res_file.write_all(reply.as_bytes()) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                tracing::info!(client_pid = cmd.client_pid, "client response pipe closed");
                break;
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn submit(shm: &ShmHandle, client_pid: u32, command: protocol::Command) -> Result<String, Error> {
    let request = RequestSlot {
        client_pid: client_pid as i32,
        bank_id: command.target,
        kind: command.kind,
        amount: command.amount,
        result_balance: 0,
        op_status: adabank::queue::OpStatus::Error,
    };
    let idx = queue::push(shm, request)?;
    let reply = queue::await_response(shm, idx)?;
    Ok(protocol::format_response(reply.bank_id, reply.result_balance, reply.op_status))
}
