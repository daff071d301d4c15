// src/turn/allocation_manager.rs
//! Allocation table for the TURN relay
//!
//! Allocations are indexed by client 5-tuple and by relay address. Each
//! allocation guards its own permissions, channel bindings and expiry with a
//! private lock, so relaying on one allocation never waits on another. The
//! `closed` flag inside that lock is the single point where a Refresh and the
//! reaper agree on whether an allocation is still alive.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::relay_pool::RelayPortPool;
use super::{
    is_valid_channel_number, ClientSink, FiveTuple, TurnStats, CHANNEL_BINDING_LIFETIME,
    PERMISSION_LIFETIME,
};
use crate::error::TurnError;
use crate::stun::TransactionId;

/// Channel binding of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub number: u16,
    pub peer: SocketAddr,
    pub expires_at: Instant,
}

#[derive(Debug)]
struct AllocationState {
    expires_at: Instant,
    permissions: HashMap<IpAddr, Instant>,
    channels: HashMap<u16, ChannelBinding>,
    peer_channels: HashMap<SocketAddr, u16>,
    closed: bool,
}

impl AllocationState {
    fn is_live(&self, now: Instant) -> bool {
        !self.closed && self.expires_at > now
    }

    fn prune(&mut self, now: Instant) {
        self.permissions.retain(|_, expires_at| *expires_at > now);
        let peer_channels = &mut self.peer_channels;
        self.channels.retain(|_, binding| {
            let live = binding.expires_at > now;
            if !live {
                peer_channels.remove(&binding.peer);
            }
            live
        });
    }
}

/// Per-allocation relay counters
#[derive(Debug, Default)]
pub struct AllocationStats {
    pub packets_to_peer: AtomicU64,
    pub bytes_to_peer: AtomicU64,
    pub packets_to_client: AtomicU64,
    pub bytes_to_client: AtomicU64,
}

/// A TURN allocation
#[derive(Debug)]
pub struct Allocation {
    pub five_tuple: FiveTuple,
    /// Relay transport address advertised to the client
    pub relay_addr: SocketAddr,
    pub relay_port: u16,
    pub username: String,
    /// Quota key: the credential label, without the expiry prefix
    pub quota_key: String,
    /// Transaction id of the Allocate that created it
    pub transaction_id: TransactionId,
    pub created_at: Instant,
    pub sink: ClientSink,
    pub stats: AllocationStats,
    state: Mutex<AllocationState>,
    relay_socket: Mutex<Option<Arc<UdpSocket>>>,
    relay_task: Mutex<Option<JoinHandle<()>>>,
}

impl Allocation {
    /// Remaining lifetime at `now`, zero once expired
    pub fn remaining_lifetime(&self, now: Instant) -> Duration {
        self.state.lock().expires_at.saturating_duration_since(now)
    }

    pub fn expires_at(&self) -> Instant {
        self.state.lock().expires_at
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Open and not past its deadline at `now`
    pub fn is_live(&self, now: Instant) -> bool {
        self.state.lock().is_live(now)
    }

    /// Relay socket while the allocation is open
    pub fn relay_socket(&self) -> Option<Arc<UdpSocket>> {
        self.relay_socket.lock().clone()
    }

    /// Extend the lifetime; fails once the allocation has expired, even
    /// before the reaper has removed it
    fn refresh(&self, lifetime: Duration, now: Instant) -> Result<(), TurnError> {
        let mut state = self.state.lock();
        if !state.is_live(now) {
            return Err(TurnError::AllocationMismatch(self.five_tuple.client));
        }
        state.expires_at = now + lifetime;
        Ok(())
    }

    /// Install or refresh a permission. Expiry only moves forward.
    pub fn install_permission(&self, peer: IpAddr, now: Instant) {
        let mut state = self.state.lock();
        if !state.is_live(now) {
            return;
        }
        let expires_at = now + PERMISSION_LIFETIME;
        let entry = state.permissions.entry(peer).or_insert(expires_at);
        if *entry < expires_at {
            *entry = expires_at;
        }
    }

    /// Whether a live permission exists for `peer` on a live allocation
    pub fn has_permission(&self, peer: IpAddr, now: Instant) -> bool {
        let state = self.state.lock();
        state.is_live(now)
            && state
                .permissions
                .get(&peer)
                .map_or(false, |expires_at| *expires_at > now)
    }

    /// Expiry of the permission for `peer`, if any
    pub fn permission_expiry(&self, peer: IpAddr) -> Option<Instant> {
        self.state.lock().permissions.get(&peer).copied()
    }

    /// Admit a datagram arriving on the relay socket from `peer`.
    ///
    /// Returns `None` without a live permission; otherwise refreshes the
    /// permission and returns the channel bound to `peer`, if any.
    pub fn admit_from_peer(&self, peer: SocketAddr, now: Instant) -> Option<Option<u16>> {
        let mut state = self.state.lock();
        if !state.is_live(now) {
            return None;
        }
        match state.permissions.get_mut(&peer.ip()) {
            Some(expires_at) if *expires_at > now => {
                let refreshed = now + PERMISSION_LIFETIME;
                if *expires_at < refreshed {
                    *expires_at = refreshed;
                }
            }
            _ => return None,
        }
        let channel = state
            .peer_channels
            .get(&peer)
            .copied()
            .filter(|number| state.channels.get(number).map_or(false, |b| b.expires_at > now));
        Some(channel)
    }

    /// Bind `number` to `peer`, refreshing an identical binding.
    ///
    /// A channel already bound to another peer, or a peer already bound to
    /// another channel, is a conflict. The peer's permission is installed too.
    pub fn bind_channel(&self, number: u16, peer: SocketAddr, now: Instant) -> Result<(), TurnError> {
        if !is_valid_channel_number(number) {
            return Err(TurnError::BadRequest(format!("channel number 0x{:04X} out of range", number)));
        }

        let mut state = self.state.lock();
        if !state.is_live(now) {
            return Err(TurnError::AllocationMismatch(self.five_tuple.client));
        }
        state.prune(now);

        if let Some(existing) = state.channels.get(&number) {
            if existing.peer != peer {
                return Err(TurnError::ChannelBindingConflict(format!(
                    "channel 0x{:04X} already bound to {}",
                    number, existing.peer
                )));
            }
        }
        if let Some(existing) = state.peer_channels.get(&peer) {
            if *existing != number {
                return Err(TurnError::ChannelBindingConflict(format!(
                    "{} already bound to channel 0x{:04X}",
                    peer, existing
                )));
            }
        }

        let expires_at = now + CHANNEL_BINDING_LIFETIME;
        let binding = state.channels.entry(number).or_insert(ChannelBinding {
            number,
            peer,
            expires_at,
        });
        if binding.expires_at < expires_at {
            binding.expires_at = expires_at;
        }
        state.peer_channels.insert(peer, number);

        let permission = now + PERMISSION_LIFETIME;
        let entry = state.permissions.entry(peer.ip()).or_insert(permission);
        if *entry < permission {
            *entry = permission;
        }
        Ok(())
    }

    /// Peer bound to a live channel
    pub fn channel_peer(&self, number: u16, now: Instant) -> Option<SocketAddr> {
        let state = self.state.lock();
        if !state.is_live(now) {
            return None;
        }
        state
            .channels
            .get(&number)
            .filter(|binding| binding.expires_at > now)
            .map(|binding| binding.peer)
    }

    pub fn channel_binding(&self, number: u16) -> Option<ChannelBinding> {
        self.state.lock().channels.get(&number).copied()
    }

    pub fn permission_count(&self) -> usize {
        self.state.lock().permissions.len()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Attach the task reading the relay socket
    pub fn set_relay_task(&self, task: JoinHandle<()>) {
        if self.is_closed() {
            task.abort();
            return;
        }
        *self.relay_task.lock() = Some(task);
    }

    /// Mark closed under the state lock; true only for the first caller
    fn close(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.closed, true)
    }

    /// Close if expired at `now`; true only when this call closed it
    fn close_if_expired(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.expires_at > now {
            return false;
        }
        state.closed = true;
        true
    }

    /// Stop the relay task and drop the relay socket
    async fn shutdown(&self) {
        let task = self.relay_task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.relay_socket.lock().take();
    }
}

/// Parameters of a new allocation
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub five_tuple: FiveTuple,
    pub username: String,
    pub transaction_id: TransactionId,
    pub lifetime: Duration,
    pub sink: ClientSink,
}

/// Result of an Allocate against the table
#[derive(Debug, Clone)]
pub enum AllocateOutcome {
    /// A new allocation was created
    Created(Arc<Allocation>),
    /// Retransmission of the Allocate that created this allocation
    Retransmit(Arc<Allocation>),
}

/// The allocation table
#[derive(Debug)]
pub struct AllocationManager {
    allocations: DashMap<FiveTuple, Arc<Allocation>>,
    relay_lookup: DashMap<SocketAddr, FiveTuple>,
    user_allocations: DashMap<String, usize>,
    relay_pool: RelayPortPool,
    /// Address advertised when the relay binds an unspecified address
    public_ip: IpAddr,
    max_allocations_per_user: usize,
    stats: Arc<TurnStats>,
}

impl AllocationManager {
    pub fn new(
        relay_pool: RelayPortPool,
        public_ip: IpAddr,
        max_allocations_per_user: usize,
        stats: Arc<TurnStats>,
    ) -> Self {
        Self {
            allocations: DashMap::new(),
            relay_lookup: DashMap::new(),
            user_allocations: DashMap::new(),
            relay_pool,
            public_ip,
            max_allocations_per_user,
            stats,
        }
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    pub fn relay_pool(&self) -> &RelayPortPool {
        &self.relay_pool
    }

    /// Find allocation by client 5-tuple, including expired entries the
    /// reaper has not removed yet
    pub fn get(&self, five_tuple: &FiveTuple) -> Option<Arc<Allocation>> {
        self.allocations.get(five_tuple).map(|entry| entry.value().clone())
    }

    /// Find an allocation that is still live at `now`
    pub fn lookup(&self, five_tuple: &FiveTuple, now: Instant) -> Option<Arc<Allocation>> {
        self.get(five_tuple).filter(|allocation| allocation.is_live(now))
    }

    /// Find allocation by relay address
    pub fn find_by_relay(&self, relay_addr: SocketAddr) -> Option<Arc<Allocation>> {
        let five_tuple = *self.relay_lookup.get(&relay_addr)?.value();
        self.get(&five_tuple)
    }

    /// Allocations currently held by the label of `username`
    pub fn user_allocation_count(&self, username: &str) -> usize {
        self.user_allocations
            .get(quota_key(username))
            .map_or(0, |count| *count)
    }

    /// Create an allocation, or recognise a retransmitted Allocate.
    ///
    /// Returns the relay socket of a new allocation alongside it so the caller
    /// can start relaying.
    #[instrument(skip(self, request), fields(five_tuple = %request.five_tuple), level = "debug")]
    pub async fn create_allocation(
        &self,
        request: AllocationRequest,
        now: Instant,
    ) -> Result<(AllocateOutcome, Option<Arc<UdpSocket>>), TurnError> {
        if let Some(existing) = self.get(&request.five_tuple) {
            if !self.expire_if_due(&existing, now).await {
                return self.existing_outcome(existing, &request).map(|outcome| (outcome, None));
            }
        }

        let quota_key = quota_key(&request.username).to_string();
        self.reserve_user_slot(&quota_key)?;

        let (socket, port) = match self.relay_pool.bind_relay().await {
            Ok(bound) => bound,
            Err(e) => {
                self.release_user_slot(&quota_key);
                return Err(e);
            }
        };

        let relay_ip = if self.relay_pool.bind_ip().is_unspecified() {
            self.public_ip
        } else {
            self.relay_pool.bind_ip()
        };
        let relay_addr = SocketAddr::new(relay_ip, port);

        let allocation = Arc::new(Allocation {
            five_tuple: request.five_tuple,
            relay_addr,
            relay_port: port,
            username: request.username.clone(),
            quota_key: quota_key.clone(),
            transaction_id: request.transaction_id,
            created_at: now,
            sink: request.sink.clone(),
            stats: AllocationStats::default(),
            state: Mutex::new(AllocationState {
                expires_at: now + request.lifetime,
                permissions: HashMap::new(),
                channels: HashMap::new(),
                peer_channels: HashMap::new(),
                closed: false,
            }),
            relay_socket: Mutex::new(Some(socket.clone())),
            relay_task: Mutex::new(None),
        });

        // A concurrent Allocate on the same 5-tuple may have won the race
        match self.allocations.entry(request.five_tuple) {
            Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                drop(entry);
                drop(socket);
                allocation.relay_socket.lock().take();
                self.relay_pool.release(port);
                self.release_user_slot(&quota_key);
                self.existing_outcome(existing, &request).map(|outcome| (outcome, None))
            }
            Entry::Vacant(entry) => {
                entry.insert(allocation.clone());
                self.relay_lookup.insert(relay_addr, request.five_tuple);
                self.stats.allocations_created.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Allocation created: {} -> {} (user: {}, lifetime: {:?})",
                    request.five_tuple, relay_addr, request.username, request.lifetime
                );
                Ok((AllocateOutcome::Created(allocation), Some(socket)))
            }
        }
    }

    fn existing_outcome(
        &self,
        existing: Arc<Allocation>,
        request: &AllocationRequest,
    ) -> Result<AllocateOutcome, TurnError> {
        if existing.transaction_id == request.transaction_id && !existing.is_closed() {
            debug!("Allocate retransmission on {}", request.five_tuple);
            Ok(AllocateOutcome::Retransmit(existing))
        } else {
            Err(TurnError::AllocationMismatch(request.five_tuple.client))
        }
    }

    fn reserve_user_slot(&self, key: &str) -> Result<(), TurnError> {
        let mut count = self.user_allocations.entry(key.to_string()).or_insert(0);
        if *count >= self.max_allocations_per_user {
            return Err(TurnError::QuotaExceeded(format!(
                "user {} holds {} allocations",
                key, *count
            )));
        }
        *count += 1;
        Ok(())
    }

    fn release_user_slot(&self, key: &str) {
        let remove = match self.user_allocations.get_mut(key) {
            Some(mut count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => false,
        };
        if remove {
            self.user_allocations.remove_if(key, |_, count| *count == 0);
        }
    }

    /// Refresh allocation lifetime
    #[instrument(skip(self), level = "debug")]
    pub fn refresh_allocation(
        &self,
        five_tuple: &FiveTuple,
        lifetime: Duration,
        now: Instant,
    ) -> Result<Arc<Allocation>, TurnError> {
        let allocation = self
            .get(five_tuple)
            .ok_or(TurnError::AllocationMismatch(five_tuple.client))?;
        allocation.refresh(lifetime, now)?;
        debug!("Refreshed allocation {} for {:?}", five_tuple, lifetime);
        Ok(allocation)
    }

    /// Delete an allocation, closing its relay socket before returning.
    /// An allocation already past its deadline is reaped and reported as
    /// missing.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete_allocation(&self, five_tuple: &FiveTuple, now: Instant) -> Result<(), TurnError> {
        let allocation = self
            .get(five_tuple)
            .ok_or(TurnError::AllocationMismatch(five_tuple.client))?;
        if self.expire_if_due(&allocation, now).await || !allocation.close() {
            return Err(TurnError::AllocationMismatch(five_tuple.client));
        }
        self.remove_closed(&allocation).await;
        self.stats.allocations_deleted.fetch_add(1, Ordering::Relaxed);
        info!("Allocation {} deleted", five_tuple);
        Ok(())
    }

    /// Remove a closed allocation from the indexes and free its resources
    async fn remove_closed(&self, allocation: &Arc<Allocation>) {
        self.allocations
            .remove_if(&allocation.five_tuple, |_, current| Arc::ptr_eq(current, allocation));
        self.relay_lookup
            .remove_if(&allocation.relay_addr, |_, tuple| *tuple == allocation.five_tuple);
        allocation.shutdown().await;
        self.relay_pool.release(allocation.relay_port);
        self.release_user_slot(&allocation.quota_key);
    }

    /// Reap `allocation` if it is past its deadline; true when this call did
    async fn expire_if_due(&self, allocation: &Arc<Allocation>, now: Instant) -> bool {
        if !allocation.close_if_expired(now) {
            return false;
        }
        self.remove_closed(allocation).await;
        self.stats.allocations_expired.fetch_add(1, Ordering::Relaxed);
        debug!("Allocation {} expired", allocation.five_tuple);
        true
    }

    /// Remove expired allocations and prune expired permissions and channel
    /// bindings of the rest. Returns the number of allocations removed.
    pub async fn reap_expired(&self, now: Instant) -> usize {
        let mut expired = Vec::new();
        for entry in self.allocations.iter() {
            let allocation = entry.value();
            if allocation.close_if_expired(now) {
                expired.push(allocation.clone());
            } else {
                allocation.state.lock().prune(now);
            }
        }

        for allocation in &expired {
            self.remove_closed(allocation).await;
            self.stats.allocations_expired.fetch_add(1, Ordering::Relaxed);
            debug!("Allocation {} expired", allocation.five_tuple);
        }

        if !expired.is_empty() {
            info!("Reaped {} expired allocations", expired.len());
        }
        expired.len()
    }

    /// Close every allocation
    pub async fn shutdown(&self) {
        let all: Vec<_> = self.allocations.iter().map(|entry| entry.value().clone()).collect();
        for allocation in all {
            if allocation.close() {
                self.remove_closed(&allocation).await;
            }
        }
        if !self.relay_lookup.is_empty() {
            warn!("{} relay lookups left after shutdown", self.relay_lookup.len());
        }
    }
}

/// Quota key of a `<expiry>:<label>` username; other usernames count as-is
fn quota_key(username: &str) -> &str {
    match username.split_once(':') {
        Some((expiry, label)) if expiry.parse::<u64>().is_ok() => label,
        _ => username,
    }
}
