use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::shared::error::{Result, SandboxError};

/// Probes past the starting port before giving up.
const MAX_PORT_PROBES: u16 = 1000;
/// Candidate draws in the primary subnet range before falling back.
const MAX_PRIMARY_ATTEMPTS: u32 = 100;
/// Candidate draws in the fallback range before the search fails.
const MAX_FALLBACK_ATTEMPTS: u32 = 1000;

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// A port is in use iff something on localhost accepts a connection to it.
pub fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT).is_ok()
}

/// Find `count` free local ports starting at `starting_at`, skipping any in
/// `reserved` (ports already handed to other sessions in this batch).
///
/// The probe is test-then-use: a concurrent provisioner may grab the same
/// port between the probe and the runtime bind. Callers treat a bind
/// conflict at start as retryable, not fatal.
pub fn find_free_ports(
    starting_at: u16,
    count: usize,
    reserved: &HashSet<u16>,
) -> Result<Vec<u16>> {
    let mut found = Vec::with_capacity(count);
    let mut candidate = starting_at;
    let mut probes: u16 = 0;

    while found.len() < count {
        if probes >= MAX_PORT_PROBES {
            return Err(SandboxError::ResourceConflict(format!(
                "no free port within {MAX_PORT_PROBES} probes of {starting_at}"
            )));
        }
        probes += 1;

        if !reserved.contains(&candidate) && !port_in_use(candidate) {
            debug!("port {} is free", candidate);
            found.push(candidate);
        }

        candidate = candidate.checked_add(1).ok_or_else(|| {
            SandboxError::ResourceConflict("port search ran past the port range".to_string())
        })?;
    }

    Ok(found)
}

/// Find a /24 block not present in `existing` (the set of subnets already
/// bound to live runtime networks). Random candidates are drawn from
/// 10.100-199.x.0/24 first, then from the higher 10.200-254.x.0/24 range
/// where collisions are less likely.
pub fn find_free_subnet(existing: &HashSet<String>) -> Result<String> {
    let mut rng = rand::thread_rng();

    for _ in 0..MAX_PRIMARY_ATTEMPTS {
        let candidate = format!(
            "10.{}.{}.0/24",
            rng.gen_range(100..200),
            rng.gen_range(0..256)
        );
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
    }

    for _ in 0..MAX_FALLBACK_ATTEMPTS {
        let candidate = format!(
            "10.{}.{}.0/24",
            rng.gen_range(200..255),
            rng.gen_range(0..256)
        );
        if !existing.contains(&candidate) {
            return Ok(candidate);
        }
    }

    Err(SandboxError::ResourceConflict(
        "no free subnet found in configured private ranges".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn skips_port_with_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let busy = listener.local_addr().expect("addr").port();

        let ports = find_free_ports(busy, 1, &HashSet::new()).expect("find");
        assert_ne!(ports[0], busy);
        assert!(ports[0] > busy);
    }

    #[test]
    fn returns_distinct_ports() {
        let ports = find_free_ports(47100, 2, &HashSet::new()).expect("find");
        assert_eq!(ports.len(), 2);
        assert_ne!(ports[0], ports[1]);
    }

    #[test]
    fn respects_reserved_set() {
        let first = find_free_ports(47300, 1, &HashSet::new()).expect("find");
        let reserved: HashSet<u16> = first.iter().copied().collect();
        let second = find_free_ports(47300, 1, &reserved).expect("find");
        assert_ne!(first[0], second[0]);
    }

    #[test]
    fn concurrent_allocations_through_shared_state_stay_distinct() {
        use std::sync::{Arc, Mutex};

        // The probe alone is test-then-use: two unsynchronized callers can
        // receive the same port. Exclusion comes from threading one shared
        // reservation set through every allocation, the way a provisioning
        // batch does.
        let reserved = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reserved = Arc::clone(&reserved);
            handles.push(std::thread::spawn(move || {
                let mut reserved = reserved.lock().expect("lock");
                let port = find_free_ports(48500, 1, &reserved).expect("find")[0];
                reserved.insert(port);
                port
            }));
        }

        let ports: Vec<u16> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        let unique: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(unique.len(), ports.len());
    }

    #[test]
    fn subnet_avoids_existing_blocks() {
        let mut existing = HashSet::new();
        existing.insert("10.150.20.0/24".to_string());

        let subnet = find_free_subnet(&existing).expect("find");
        assert!(!existing.contains(&subnet));
        assert!(subnet.starts_with("10."));
        assert!(subnet.ends_with(".0/24"));
    }

    #[test]
    fn falls_back_to_higher_range_when_primary_is_full() {
        let mut existing = HashSet::new();
        for second in 100..200 {
            for third in 0..256 {
                existing.insert(format!("10.{second}.{third}.0/24"));
            }
        }

        let subnet = find_free_subnet(&existing).expect("find");
        let second: u32 = subnet.split('.').nth(1).expect("octet").parse().expect("num");
        assert!(second >= 200);
    }
}
