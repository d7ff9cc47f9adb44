//! systemd notifications over `$NOTIFY_SOCKET`.

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

pub struct Watchdog {
    socket: UnixDatagram,
    path: PathBuf,
}

impl Watchdog {
    /// `None` when not started by systemd.
    pub fn from_env() -> Result<Option<Self>> {
        match std::env::var_os(NOTIFY_SOCKET_ENV) {
            Some(path) if !path.is_empty() => Self::connect(PathBuf::from(path)).map(Some),
            _ => Ok(None),
        }
    }

    pub fn connect(path: PathBuf) -> Result<Self> {
        if path.as_os_str().to_string_lossy().starts_with('@') {
            anyhow::bail!("abstract notify sockets are not supported: {}", path.display());
        }
        let socket = UnixDatagram::unbound().context("create notify socket")?;
        Ok(Self { socket, path })
    }

    fn send(&self, state: &str) -> Result<()> {
        self.socket
            .send_to(state.as_bytes(), &self.path)
            .with_context(|| format!("notify {}", self.path.display()))?;
        Ok(())
    }

    pub fn ready(&self) -> Result<()> {
        self.send("READY=1")
    }

    pub fn ping(&self) -> Result<()> {
        self.send("WATCHDOG=1")
    }

    pub fn stopping(&self) -> Result<()> {
        self.send("STOPPING=1")
    }
}
