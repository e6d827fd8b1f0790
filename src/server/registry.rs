//! Per-IP connection registry: bounded membership so one client can't exhaust the server's
//! connection budget. Mutated only by the accept/remove operations below.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

pub(crate) type ConnId = u64;

#[derive(Default)]
pub(crate) struct Registry {
    next_id: AtomicU64,
    by_ip: Mutex<HashMap<IpAddr, Vec<ConnId>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attempts to register a new connection from `ip`. Returns `None` if this would exceed
    /// `max_per_client` concurrent connections for that address.
    pub(crate) async fn try_insert(&self, ip: IpAddr, max_per_client: usize) -> Option<ConnId> {
        let mut by_ip = self.by_ip.lock().await;
        let entry = by_ip.entry(ip).or_default();
        if entry.len() >= max_per_client {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entry.push(id);
        Some(id)
    }

    pub(crate) async fn remove(&self, ip: IpAddr, id: ConnId) {
        let mut by_ip = self.by_ip.lock().await;
        if let Some(entry) = by_ip.get_mut(&ip) {
            entry.retain(|existing| *existing != id);
            if entry.is_empty() {
                by_ip.remove(&ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enforces_per_ip_quota() {
        let registry = Registry::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        let first = registry.try_insert(ip, 2).await;
        let second = registry.try_insert(ip, 2).await;
        let third = registry.try_insert(ip, 2).await;

        assert!(first.is_some());
        assert!(second.is_some());
        assert!(third.is_none());
    }

    #[tokio::test]
    async fn removing_frees_quota() {
        let registry = Registry::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        let id = registry.try_insert(ip, 1).await.unwrap();
        assert!(registry.try_insert(ip, 1).await.is_none());

        registry.remove(ip, id).await;
        assert!(registry.try_insert(ip, 1).await.is_some());
    }
}
