use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// `":PORT"` means all interfaces. Tokio's bind APIs do not accept it, so it
/// becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// `host:port`, bracketing bare IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
