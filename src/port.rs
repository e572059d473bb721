//! Loopback port allocation for worker subprocesses.

use std::net::TcpListener;

use anyhow::Context;

/// Returns a currently-unused loopback TCP port.
///
/// The probe listener is dropped before returning, so another process can in
/// principle grab the port before the worker binds it. Callers treat a failed
/// worker bind as a spawn failure and retry with a fresh port.
pub fn alloc_port() -> anyhow::Result<u16> {
    let listener =
        TcpListener::bind(("127.0.0.1", 0)).context("binding ephemeral loopback port")?;
    let port = listener
        .local_addr()
        .context("reading allocated port")?
        .port();
    Ok(port)
}
