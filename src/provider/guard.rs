//! SSRF defense for local backends: the target host must resolve to
//! loopback or RFC1918 space before any connection is attempted.

use std::net::IpAddr;

use reqwest::Url;

use crate::error::DiggerError;

/// Verify that `url`'s host is loopback or private. Hostnames are
/// resolved and every resolved address must qualify; a single public
/// address rejects the whole target. Runs before dial on every invoke,
/// so DNS re-pointing a previously-private name is caught.
pub async fn ensure_private_host(backend: &str, url: &Url) -> Result<(), DiggerError> {
    let host = url
        .host()
        .ok_or_else(|| reject(backend, "URL has no host"))?;

    match host {
        url::Host::Ipv4(addr) => {
            if is_private_ip(IpAddr::V4(addr)) {
                Ok(())
            } else {
                Err(reject(backend, &format!("address {addr} is not private")))
            }
        }
        url::Host::Ipv6(addr) => {
            if is_private_ip(IpAddr::V6(addr)) {
                Ok(())
            } else {
                Err(reject(backend, &format!("address {addr} is not private")))
            }
        }
        url::Host::Domain(domain) => {
            if domain.eq_ignore_ascii_case("localhost") {
                return Ok(());
            }
            let port = url.port_or_known_default().unwrap_or(80);
            let addrs: Vec<IpAddr> = tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| reject(backend, &format!("cannot resolve {domain}: {e}")))?
                .map(|sa| sa.ip())
                .collect();
            if addrs.is_empty() {
                return Err(reject(backend, &format!("{domain} resolved to no addresses")));
            }
            if let Some(public) = addrs.iter().find(|a| !is_private_ip(**a)) {
                return Err(reject(
                    backend,
                    &format!("{domain} resolves to non-private address {public}"),
                ));
            }
            Ok(())
        }
    }
}

/// Loopback (v4/v6) or RFC1918.
fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn reject(backend: &str, detail: &str) -> DiggerError {
    DiggerError::InvalidConfig(format!(
        "backend {backend}: local target rejected before dial: {detail}"
    ))
}
