// src/turn/relay_pool.rs
//! Relay port reservation.
//!
//! Every allocation owns exactly one relay port. The pool tracks which ports
//! of the configured range are held and binds the relay socket on a free one
//! chosen from a random starting point.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::TurnError;

/// Pool of relay ports within `[port_min, port_max]`
#[derive(Debug)]
pub struct RelayPortPool {
    bind_ip: IpAddr,
    port_min: u16,
    port_max: u16,
    in_use: Mutex<HashSet<u16>>,
}

impl RelayPortPool {
    /// Bounds given in reverse order are swapped
    pub fn new(bind_ip: IpAddr, port_min: u16, port_max: u16) -> Self {
        Self {
            bind_ip,
            port_min: port_min.min(port_max),
            port_max: port_min.max(port_max),
            in_use: Mutex::new(HashSet::new()),
        }
    }

    /// Number of ports in the range
    pub fn capacity(&self) -> usize {
        usize::from(self.port_max - self.port_min) + 1
    }

    /// Ports currently held by allocations
    pub fn in_use(&self) -> usize {
        self.in_use.lock().len()
    }

    pub fn bind_ip(&self) -> IpAddr {
        self.bind_ip
    }

    /// Reserve a free port and bind a relay socket on it.
    ///
    /// Ports another process holds are skipped; running out of ports is
    /// reported as a quota failure.
    pub async fn bind_relay(&self) -> Result<(Arc<UdpSocket>, u16), TurnError> {
        // Ports held by other processes stay reserved until this call returns
        let mut busy = Vec::new();
        let result = loop {
            let Some(port) = self.reserve_port() else {
                if !busy.is_empty() {
                    warn!("No bindable relay port, {} held outside the pool", busy.len());
                }
                break Err(TurnError::QuotaExceeded("relay port range exhausted".into()));
            };

            match UdpSocket::bind(SocketAddr::new(self.bind_ip, port)).await {
                Ok(socket) => {
                    debug!("Bound relay socket on {}:{}", self.bind_ip, port);
                    break Ok((Arc::new(socket), port));
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    debug!("Relay port {} busy outside pool", port);
                    busy.push(port);
                }
                Err(e) => {
                    self.release(port);
                    break Err(TurnError::ServerError(format!("relay bind failed: {}", e)));
                }
            }
        };

        for port in busy {
            self.release(port);
        }
        result
    }

    /// Mark a free port as held, scanning from a random offset
    fn reserve_port(&self) -> Option<u16> {
        let capacity = self.capacity();
        let mut in_use = self.in_use.lock();
        if in_use.len() >= capacity {
            return None;
        }

        let start = rand::thread_rng().gen_range(0..capacity);
        for offset in 0..capacity {
            let port = self.port_min + ((start + offset) % capacity) as u16;
            if in_use.insert(port) {
                return Some(port);
            }
        }
        None
    }

    /// Return a port to the pool once its socket is closed
    pub fn release(&self, port: u16) {
        if !self.in_use.lock().remove(&port) {
            warn!("Released relay port {} that was not held", port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_ports_stay_in_range_and_exclusive() {
        let pool = RelayPortPool::new(loopback(), 41000, 41003);
        assert_eq!(pool.capacity(), 4);

        let mut held = Vec::new();
        while let Ok((socket, port)) = pool.bind_relay().await {
            assert!((41000..=41003).contains(&port));
            assert_eq!(socket.local_addr().unwrap().port(), port);
            held.push((socket, port));
        }

        let mut ports: Vec<u16> = held.iter().map(|(_, p)| *p).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), held.len());
        assert!(matches!(pool.bind_relay().await, Err(TurnError::QuotaExceeded(_))));
    }

    #[tokio::test]
    async fn test_release_makes_port_reusable() {
        let pool = RelayPortPool::new(loopback(), 41010, 41010);
        let (socket, port) = pool.bind_relay().await.unwrap();
        assert!(pool.bind_relay().await.is_err());

        drop(socket);
        pool.release(port);
        assert_eq!(pool.in_use(), 0);

        let (_socket, again) = pool.bind_relay().await.unwrap();
        assert_eq!(again, port);
    }

    #[tokio::test]
    async fn test_inverted_range_is_normalized() {
        let pool = RelayPortPool::new(loopback(), 41022, 41020);
        assert_eq!(pool.capacity(), 3);

        let (_socket, port) = pool.bind_relay().await.unwrap();
        assert!((41020..=41022).contains(&port));
    }
}
