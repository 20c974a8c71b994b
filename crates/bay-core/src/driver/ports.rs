//! Ephemeral host-port allocation for host-mapped Docker/Podman drivers.
//!
//! The driver allocates, tracks, and releases ports; assignment happens by
//! binding an OS socket briefly to let the kernel pick a free port, then
//! releasing it immediately before handing the number to the container
//! runtime — the same bind-then-release trick used for picking ephemeral
//! ports elsewhere in this crate.

use std::net::{SocketAddr, TcpListener};

use crate::driver::DriverError;

/// Binds an ephemeral TCP port on loopback, returning it immediately freed.
pub fn allocate_ephemeral_port() -> Result<u16, DriverError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| DriverError::BackendUnreachable(format!("failed to allocate host port: {e}")))?;
    let addr: SocketAddr = listener
        .local_addr()
        .map_err(|e| DriverError::BackendUnreachable(format!("failed to read bound port: {e}")))?;
    Ok(addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_a_nonzero_port() {
        let port = allocate_ephemeral_port().unwrap();
        assert_ne!(port, 0);
    }
}
