//! Module lifecycle: owns the socket system (handle registry + slot
//! table) and the platform capability probe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::debug;

use crate::errors::Result;
use crate::socket::SocketSystem;
use crate::sys;

static SYSTEM: Lazy<RwLock<Option<Arc<SocketSystem>>>> = Lazy::new(|| RwLock::new(None));
static SUPPORTS_IPV4: AtomicBool = AtomicBool::new(false);
static SUPPORTS_IPV6: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Copy, Debug)]
pub struct NetworkConfig {
    /// Capacity of the descriptor slot table. The handle registry is
    /// sized slightly larger so ids can outlive their descriptors.
    pub max_sockets: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig { max_sockets: 256 }
    }
}

/// Initialize the module: allocate the registry and slot table and probe
/// address-family support. Idempotent; a second call is a no-op.
pub fn initialize(config: NetworkConfig) -> Result<()> {
    {
        let mut system = SYSTEM.write().unwrap();
        if system.is_some() {
            return Ok(());
        }
        debug!("initializing network services");
        *system = Some(Arc::new(SocketSystem::new(config.max_sockets)));
    }

    SUPPORTS_IPV4.store(probe_family(libc::AF_INET), Ordering::Release);
    SUPPORTS_IPV6.store(probe_family(libc::AF_INET6), Ordering::Release);

    Ok(())
}

/// Whether a datagram socket of the given family can be opened at all.
/// The probe descriptor goes through the common shutdown-and-close path;
/// the shutdown error on the never-connected socket is discarded there.
fn probe_family(family: libc::c_int) -> bool {
    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, libc::IPPROTO_UDP) };
    let supported = fd >= 0;
    sys::close_fd(fd);
    supported
}

/// Tear the module down. Outstanding guards keep their records (and the
/// system backing them) alive until dropped; everything else is released
/// here.
pub fn shutdown() {
    let taken = SYSTEM.write().unwrap().take();
    if let Some(system) = taken {
        debug!("terminating network services");
        system.map.clear();
    }
}

pub fn is_initialized() -> bool {
    SYSTEM.read().unwrap().is_some()
}

pub fn supports_ipv4() -> bool {
    SUPPORTS_IPV4.load(Ordering::Acquire)
}

pub fn supports_ipv6() -> bool {
    SUPPORTS_IPV6.load(Ordering::Acquire)
}

pub(crate) fn system() -> Option<Arc<SocketSystem>> {
    SYSTEM.read().unwrap().clone()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// All tests share the process-wide module; initialize it once.
    pub(crate) fn ensure_initialized() {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            initialize(NetworkConfig { max_sockets: 1024 }).unwrap();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent_and_probes_families() {
        testing::ensure_initialized();
        assert!(is_initialized());
        assert!(initialize(NetworkConfig::default()).is_ok());

        // Loopback TCP works in every environment this suite runs in, so
        // the v4 probe must have succeeded.
        assert!(supports_ipv4());
    }
}
