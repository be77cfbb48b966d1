//! Environment-variable configuration.

use std::env;
use std::path::PathBuf;

/// Debug bits for `CCND_DEBUG` (a bitmask; trace lines are emitted at
/// `debug!` level when the subsystem's bit is set).
pub const DEBUG_INTEREST: u32 = 2;
pub const DEBUG_CONTENT: u32 = 4;
pub const DEBUG_MATCH: u32 = 8;
pub const DEBUG_PIT: u32 = 16;

pub const DEFAULT_PORT: &str = "4485";
pub const MAX_MTU: usize = 8800;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the local-IPC listener socket.
    pub sockname: PathBuf,
    /// UDP port (also the IPC socket-name suffix when set explicitly).
    pub port: String,
    /// Bind UDP to all interfaces instead of loopback.
    pub nonlocal_udp: bool,
    /// Per-subsystem trace bits.
    pub debug: u32,
    /// Content-store soft capacity in entries.
    pub capacity: usize,
    /// Byte budget for interest stuffing; 0 disables stuffing.
    pub mtu: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sockname: default_sockname(None),
            port: DEFAULT_PORT.to_string(),
            nonlocal_udp: false,
            debug: 0,
            capacity: usize::MAX,
            mtu: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let port = match env::var("CCN_LOCAL_PORT") {
            Ok(p) if !p.is_empty() && p.len() <= 10 => Some(p),
            _ => None,
        };
        let sockname = match env::var("CCN_LOCAL_SOCKNAME") {
            Ok(s) if !s.is_empty() => {
                let mut base = PathBuf::from(s);
                if let Some(p) = &port {
                    base = PathBuf::from(format!("{}.{}", base.display(), p));
                }
                base
            }
            _ => default_sockname(port.as_deref()),
        };
        let debug = env::var("CCND_DEBUG")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);
        let capacity = match env::var("CCND_CAP") {
            Ok(s) if !s.is_empty() => match s.parse::<i64>() {
                Ok(v) if v > 0 => v as usize,
                _ => 10,
            },
            _ => usize::MAX,
        };
        let mtu = env::var("CCND_MTU")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .map(|v| v.clamp(0, MAX_MTU as i64) as usize)
            .unwrap_or(0);
        Self {
            sockname,
            port: port.unwrap_or_else(|| DEFAULT_PORT.to_string()),
            nonlocal_udp: env::var("CCN_NONLOCAL_UDP").map_or(false, |v| !v.is_empty()),
            debug,
            capacity,
            mtu,
        }
    }

    pub fn debug_enabled(&self, bit: u32) -> bool {
        self.debug & bit != 0
    }
}

/// `${TMPDIR}/.ccnd.sock`, with the port as a suffix when overridden.
pub fn default_sockname(port: Option<&str>) -> PathBuf {
    let tmp = env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
    let base = PathBuf::from(tmp).join(".ccnd.sock");
    match port {
        Some(p) => PathBuf::from(format!("{}.{}", base.display(), p)),
        None => base,
    }
}
