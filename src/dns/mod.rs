pub mod cloud;
pub mod provider;

/// Canonicalize a DNS name to carry exactly one trailing dot.
pub fn ensure_trailing_dot(name: &str) -> String {
    format!("{}.", name.trim_end_matches('.'))
}

/// A record name for a resource under a domain, e.g. `mc-server.example.com.`.
pub fn join_a_record_name(domain: &str, resource: &str) -> String {
    ensure_trailing_dot(&format!("{resource}.{}", domain.trim_end_matches('.')))
}

/// SRV record name for the minecraft service of a resource, e.g.
/// `_minecraft._tcp.mc-server.example.com.`.
pub fn join_srv_record_name(domain: &str, resource: &str) -> String {
    format!("_minecraft._tcp.{}", join_a_record_name(domain, resource))
}

/// SRV resource record value, `"<priority> <weight> <port> <target>"`.
pub fn join_srv_rr(priority: u16, weight: u16, port: i32, target: &str) -> String {
    format!("{priority} {weight} {port} {target}")
}

/// Loose RFC 1123 check for domains taken from annotations/labels. Record
/// names built by this module are assumed to start from a valid domain.
pub fn is_dns_name(name: &str) -> bool {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
