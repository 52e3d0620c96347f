//! Client driver: reads a command file and exchanges lines with its Teller
//! over two per-client FIFOs that the client itself creates.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use adabank::config::{self, DEFAULT_SERVER_FIFO_NAME};
use adabank::fifo;

#[derive(Parser)]
#[command(about = "AdaBank command-file client")]
struct Cmd {
    /// Path to a file of newline-separated commands, one per line.
    command_file: PathBuf,
    /// Server FIFO name to connect to.
    #[arg(default_value_t = DEFAULT_SERVER_FIFO_NAME.to_string())]
    server_fifo_name: String,
}

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    Fifo(#[from] fifo::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cmd = Cmd::parse();
    if let Err(e) = run(cmd) {
        eprintln!("client error: {e}");
        std::process::exit(1);
    }
}

fn run(cmd: Cmd) -> Result<(), Error> {
    let pid = std::process::id();
    let tmp_dir = config::tmp_dir();
    let req_path = config::request_fifo_path(&tmp_dir, pid);
    let res_path = config::response_fifo_path(&tmp_dir, pid);

    fifo::create(&req_path)?;
    fifo::create(&res_path)?;
    let cleanup = || {
        fifo::remove(&req_path);
        fifo::remove(&res_path);
    };

    let server_fifo_path = tmp_dir.join(&cmd.server_fifo_name);
    let result = (|| -> Result<(), Error> {
        let mut server_writer = fifo::open_write(&server_fifo_path)?;
        writeln!(server_writer, "{pid}")?;
        drop(server_writer);

        // These rendezvous with the Teller the server spawns in response to
        // the pid line just written.
        let mut req_writer = fifo::open_write(&req_path)?;
        let res_reader = fifo::open_read_blocking(&res_path)?;
        let mut res_lines = BufReader::new(res_reader).lines();

        let commands = std::fs::read_to_string(&cmd.command_file)?;
        for line in commands.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            writeln!(req_writer, "{line}")?;
            req_writer.flush()?;

            match res_lines.next() {
                Some(Ok(reply)) => println!("{reply}"),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    println!("disconnected: no response received for {line:?}");
                    break;
                }
            }
        }
        Ok(())
    })();

    cleanup();
    result
}
