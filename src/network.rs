//! Network readiness prober: wait for a guest to report a routable IPv4.

use std::net::Ipv4Addr;

use crate::config::RetryPolicy;
use crate::control::ControlPlane;
use crate::error::ScratchError;
use crate::util::normalize_mac;

/// First syntactically valid IPv4 literal among the reported addresses.
pub fn first_ipv4(addresses: &[String]) -> Option<Ipv4Addr> {
    addresses
        .iter()
        .find_map(|a| a.trim().parse::<Ipv4Addr>().ok())
}

/// Poll the control plane until the guest reports an IPv4 address.
///
/// Makes exactly `policy.attempts` queries, sleeping `policy.interval`
/// between them (not after the last). Query errors count as "not ready".
pub async fn await_ip<C: ControlPlane>(
    control: &C,
    name: &str,
    policy: RetryPolicy,
) -> Result<Ipv4Addr, ScratchError> {
    for attempt in 1..=policy.attempts {
        match control.ip_addresses(name).await {
            Ok(addresses) => {
                if let Some(ip) = first_ipv4(&addresses) {
                    tracing::info!(name, %ip, attempt, "guest reported an address");
                    return Ok(ip);
                }
                tracing::debug!(name, attempt, ?addresses, "no IPv4 yet");
            }
            Err(e) => {
                tracing::debug!(name, attempt, error = %e, "address query failed");
            }
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(ScratchError::Timeout {
        what: format!("waiting for an IP address for '{name}'"),
        attempts: policy.attempts,
    })
}

/// [`await_ip`], then one pass over the host's neighbor table keyed by the
/// VM's MAC address before giving up.
pub async fn discover_ip<C: ControlPlane>(
    control: &C,
    name: &str,
    policy: RetryPolicy,
) -> Result<Ipv4Addr, ScratchError> {
    let timeout = match await_ip(control, name, policy).await {
        Ok(ip) => return Ok(ip),
        Err(e) => e,
    };

    let mac = match control.mac_address(name).await {
        Ok(Some(mac)) => mac,
        Ok(None) => return Err(timeout),
        Err(e) => {
            tracing::debug!(name, error = %e, "cannot read MAC for neighbor lookup");
            return Err(timeout);
        }
    };

    match control.neighbor_ip(&mac).await {
        Ok(Some(ip)) => {
            tracing::info!(name, %ip, %mac, "address found in neighbor table");
            Ok(ip)
        }
        Ok(None) => Err(timeout),
        Err(e) => {
            tracing::debug!(name, error = %e, "neighbor lookup failed");
            Err(timeout)
        }
    }
}

/// Find the IPv4 bound to `mac` in `arp -an` output:
///
/// ```text
/// ? (192.168.64.9) at 52:54:0:ab:cd:e on bridge100 ifscope [bridge]
/// ```
pub fn parse_arp_table(output: &str, mac: &str) -> Option<Ipv4Addr> {
    let wanted = normalize_mac(mac)?;
    output.lines().find_map(|line| {
        let open = line.find('(')?;
        let close = line[open..].find(')')? + open;
        let ip = line[open + 1..close].parse::<Ipv4Addr>().ok()?;
        let rest = line[close + 1..].trim_start().strip_prefix("at ")?;
        let entry_mac = rest.split_whitespace().next()?;
        (normalize_mac(entry_mac)? == wanted).then_some(ip)
    })
}
