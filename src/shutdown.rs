//! Signal-safe shutdown flag (C7): the termination handler itself touches
//! only an atomic; every other step of the seven-step teardown runs from
//! the main loop once it observes the flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to install signal handler: {0}")]
    Install(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    /// Installs handlers for SIGTERM and SIGINT that flip the flag; no
    /// other work happens in signal context.
    pub fn install() -> Result<Self, Error> {
        let requested = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(signal_hook::consts::SIGTERM, requested.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, requested.clone())?;
        Ok(Self { requested })
    }

    pub fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_clear_and_can_be_triggered() {
        let s = Shutdown::install().unwrap();
        assert!(!s.requested());
        s.trigger();
        assert!(s.requested());
    }
}
