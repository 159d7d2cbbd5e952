use std::collections::{HashMap, HashSet};
use std::net::TcpListener;

use parking_lot::Mutex;
use rand::Rng;

/// Default allocation window for `macro.getRandomPort` and friends.
pub const DEFAULT_RANGE: (u16, u16) = (20_000, 29_999);

const MAX_ATTEMPTS: usize = 64;

/// Ports handed out within one reconcile pass, grouped by named scope so
/// repeated macro evaluations do not collide. OS-level uniqueness still
/// relies on the bind probe just before use.
#[derive(Default)]
pub struct PortScopes {
    reserved: Mutex<HashMap<String, HashSet<u16>>>,
}

impl PortScopes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind-and-close probe: a port is free when the loopback bind succeeds.
    pub fn probe_free(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }

    pub fn is_reserved(&self, scope: &str, port: u16) -> bool {
        self.reserved
            .lock()
            .get(scope)
            .is_some_and(|set| set.contains(&port))
    }

    pub fn reserve(&self, scope: &str, port: u16) {
        self.reserved
            .lock()
            .entry(scope.to_string())
            .or_default()
            .insert(port);
    }

    /// Allocate one free port within `range`, reserving it in `scope`.
    pub fn allocate(&self, scope: &str, range: (u16, u16)) -> Option<u16> {
        let (min, max) = normalize(range);
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ATTEMPTS {
            let candidate = rng.gen_range(min..=max);
            if self.is_reserved(scope, candidate) {
                continue;
            }
            if Self::probe_free(candidate) {
                self.reserve(scope, candidate);
                return Some(candidate);
            }
        }
        None
    }

    /// Allocate `count` distinct free ports within `range`.
    pub fn allocate_many(&self, scope: &str, count: usize, range: (u16, u16)) -> Option<Vec<u16>> {
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            ports.push(self.allocate(scope, range)?);
        }
        Some(ports)
    }

    /// Allocate a contiguous block of `size` free ports; returns the first.
    pub fn allocate_block(&self, scope: &str, size: u16, range: (u16, u16)) -> Option<u16> {
        if size == 0 {
            return None;
        }
        let (min, max) = normalize(range);
        if max - min + 1 < size {
            return None;
        }
        let mut rng = rand::thread_rng();
        'attempt: for _ in 0..MAX_ATTEMPTS {
            let start = rng.gen_range(min..=max - size + 1);
            for offset in 0..size {
                let port = start + offset;
                if self.is_reserved(scope, port) || !Self::probe_free(port) {
                    continue 'attempt;
                }
            }
            for offset in 0..size {
                self.reserve(scope, start + offset);
            }
            return Some(start);
        }
        None
    }
}

fn normalize((min, max): (u16, u16)) -> (u16, u16) {
    if min <= max {
        (min, max)
    } else {
        (max, min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ports_are_distinct_and_bindable() {
        let scopes = PortScopes::new();
        let a = scopes.allocate("s1", DEFAULT_RANGE).unwrap();
        let b = scopes.allocate("s1", DEFAULT_RANGE).unwrap();
        let c = scopes.allocate("s1", DEFAULT_RANGE).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        for port in [a, b, c] {
            assert!(PortScopes::probe_free(port), "port {port} should be bindable");
        }
    }

    #[test]
    fn reservation_blocks_reallocation_within_scope() {
        let scopes = PortScopes::new();
        let port = scopes.allocate("s1", (21_000, 21_001)).unwrap();
        let other = scopes.allocate("s1", (21_000, 21_001)).unwrap();
        assert_ne!(port, other);
        // The two-port window is exhausted now.
        assert_eq!(scopes.allocate("s1", (21_000, 21_001)), None);
        // A different scope can still see them.
        assert!(scopes.allocate("s2", (21_000, 21_001)).is_some());
    }

    #[test]
    fn block_allocation_is_contiguous_and_reserved() {
        let scopes = PortScopes::new();
        let start = scopes.allocate_block("s1", 3, (22_000, 22_100)).unwrap();
        for offset in 0..3 {
            assert!(scopes.is_reserved("s1", start + offset));
        }
    }

    #[test]
    fn block_larger_than_range_fails() {
        let scopes = PortScopes::new();
        assert_eq!(scopes.allocate_block("s1", 10, (23_000, 23_004)), None);
    }

    #[test]
    fn busy_port_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();
        assert!(!PortScopes::probe_free(busy));
        let scopes = PortScopes::new();
        // A single-port window holding the busy port cannot allocate.
        assert_eq!(scopes.allocate("s1", (busy, busy)), None);
    }
}
