//! Shared configuration surface: names and paths derived from the server
//! FIFO name, plus the fixed timing constants used by the main loop and
//! shutdown sequence. No hot reload; this is read once at startup.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SERVER_FIFO_NAME: &str = "AdaBank";

/// How long the server waits for server-FIFO readability on each pass of
/// the main loop before re-checking the shutdown flag.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Bounded wait for children to exit gracefully during shutdown.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Environment variable overriding the directory per-client FIFOs are
/// created in; defaults to `/tmp`. Exists so tests never touch the real
/// `/tmp`.
pub const TMP_DIR_ENV: &str = "ADABANK_TMP_DIR";

pub fn tmp_dir() -> PathBuf {
    std::env::var(TMP_DIR_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

pub fn request_fifo_path(tmp_dir: &std::path::Path, client_pid: u32) -> PathBuf {
    tmp_dir.join(format!("bank_{client_pid}_req"))
}

pub fn response_fifo_path(tmp_dir: &std::path::Path, client_pid: u32) -> PathBuf {
    tmp_dir.join(format!("bank_{client_pid}_res"))
}

/// POSIX shared-memory segment names must start with `/` and contain no
/// other slashes; derive one from the server FIFO name so two brokers using
/// different FIFO names don't collide.
pub fn shm_segment_name(server_fifo_name: &str) -> String {
    let sanitized: String = server_fifo_name
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    format!("/adabank-{sanitized}")
}

/// Transaction log path, colocated with the FIFOs by default.
pub fn log_path(tmp_dir: &std::path::Path, server_fifo_name: &str) -> PathBuf {
    tmp_dir.join(format!("adabank-{server_fifo_name}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shm_segment_name_has_single_leading_slash() {
        let name = shm_segment_name("AdaBank");
        assert_eq!(name, "/adabank-AdaBank");
        assert_eq!(name.matches('/').count(), 1);
    }

    #[test]
    fn request_and_response_paths_differ() {
        let dir = std::path::Path::new("/tmp");
        assert_ne!(request_fifo_path(dir, 42), response_fifo_path(dir, 42));
    }
}
