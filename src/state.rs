// src/state.rs - flow tables shared by the pump, the socket tasks and the relay
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::gauge;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::tcp::{FlowKey, TcpSession};
use crate::tracker::ConnectionTracker;
use crate::udp::UdpFlow;

pub type SharedTracker = Arc<Mutex<ConnectionTracker>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Terminate TLS with a leaf and re-encrypt upstream.
    Intercept,
    /// Copy bytes unchanged.
    Tunnel,
}

/// What the relay needs to serve a loopback connection, keyed by the local
/// port of the engine's loopback socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTarget {
    pub key: FlowKey,
    pub destination: SocketAddrV4,
    pub mode: RelayMode,
}

/// Owner of every per-flow table.
#[derive(Debug, Default)]
pub struct FlowManager {
    udp_flows: DashMap<FlowKey, Arc<UdpFlow>>,
    tcp_sessions: DashMap<FlowKey, Arc<TcpSession>>,
    trackers: DashMap<FlowKey, SharedTracker>,
    relay_targets: DashMap<u16, RelayTarget>,
    relay_tasks: DashMap<FlowKey, AbortHandle>,
    /// Relay connections whose flow closed gracefully, left to finish on
    /// their own until `reap_released_relays` or `clear`.
    released_relays: Mutex<Vec<(AbortHandle, Instant)>>,
}

impl FlowManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_gauge(&self) {
        gauge!("tunscope_flows_active").set((self.tcp_sessions.len() + self.udp_flows.len()) as f64);
    }

    pub fn udp_flow(&self, key: &FlowKey) -> Option<Arc<UdpFlow>> {
        self.udp_flows.get(key).map(|f| f.clone())
    }

    pub fn insert_udp(&self, flow: Arc<UdpFlow>, tracker: SharedTracker) {
        self.trackers.insert(flow.key, tracker);
        self.udp_flows.insert(flow.key, flow);
        self.update_gauge();
    }

    pub fn tcp_session(&self, key: &FlowKey) -> Option<Arc<TcpSession>> {
        self.tcp_sessions.get(key).map(|s| s.clone())
    }

    /// Returns the session this one replaced, if any.
    pub fn insert_tcp(&self, session: Arc<TcpSession>) -> Option<Arc<TcpSession>> {
        let previous = self.tcp_sessions.insert(session.key, session);
        self.update_gauge();
        previous
    }

    pub fn tracker(&self, key: &FlowKey) -> Option<SharedTracker> {
        self.trackers.get(key).map(|t| t.clone())
    }

    pub fn tracker_or_insert(&self, key: FlowKey, max_buffer: usize) -> SharedTracker {
        self.trackers
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(ConnectionTracker::new(key, max_buffer))))
            .clone()
    }

    /// Replaces the tracker outright, returning the old one.
    pub fn reset_tracker(&self, key: FlowKey, max_buffer: usize) -> Option<SharedTracker> {
        self.trackers
            .insert(key, Arc::new(Mutex::new(ConnectionTracker::new(key, max_buffer))))
    }

    /// Removes a TCP session only if it is still the one given, so a stale
    /// socket task cannot tear down a replacement session. The relay
    /// connection, if any, is left to the caller.
    pub fn remove_tcp_if(&self, session: &Arc<TcpSession>) -> Option<SharedTracker> {
        let (key, _) = self
            .tcp_sessions
            .remove_if(&session.key, |_, current| Arc::ptr_eq(current, session))?;
        self.update_gauge();
        self.trackers.remove(&key).map(|(_, t)| t)
    }

    pub fn remove_udp(&self, key: &FlowKey) -> Option<(Arc<UdpFlow>, Option<SharedTracker>)> {
        let (_, flow) = self.udp_flows.remove(key)?;
        self.update_gauge();
        let tracker = self.trackers.remove(key).map(|(_, t)| t);
        Some((flow, tracker))
    }

    /// Like `remove_udp`, but only when `pred` still holds for the flow
    /// currently stored under `key`.
    pub fn remove_udp_if<F>(&self, key: &FlowKey, pred: F) -> Option<(Arc<UdpFlow>, Option<SharedTracker>)>
    where
        F: Fn(&UdpFlow) -> bool,
    {
        let (_, flow) = self.udp_flows.remove_if(key, |_, current| pred(current))?;
        self.update_gauge();
        let tracker = self.trackers.remove(key).map(|(_, t)| t);
        Some((flow, tracker))
    }

    pub fn register_relay_target(&self, local_port: u16, target: RelayTarget) {
        self.relay_targets.insert(local_port, target);
    }

    pub fn relay_target(&self, local_port: u16) -> Option<RelayTarget> {
        self.relay_targets.get(&local_port).map(|t| *t)
    }

    pub fn register_relay_task(&self, key: FlowKey, handle: AbortHandle) {
        if let Some(old) = self.relay_tasks.insert(key, handle) {
            old.abort();
        }
    }

    /// Aborts the relay connection bound to `key` and forgets its routing.
    pub fn abort_relay(&self, key: &FlowKey) {
        if let Some((_, handle)) = self.relay_tasks.remove(key) {
            handle.abort();
        }
        self.relay_targets.retain(|_, target| target.key != *key);
    }

    /// Forgets the routing for `key` but lets its relay connection finish.
    pub fn release_relay(&self, key: &FlowKey) {
        if let Some((_, handle)) = self.relay_tasks.remove(key) {
            self.released_relays.lock().push((handle, Instant::now()));
        }
        self.relay_targets.retain(|_, target| target.key != *key);
    }

    /// Drops finished released relays and aborts those older than `timeout`.
    pub fn reap_released_relays(&self, timeout: Duration) {
        self.released_relays.lock().retain(|(handle, since)| {
            if handle.is_finished() {
                return false;
            }
            if since.elapsed() >= timeout {
                handle.abort();
                return false;
            }
            true
        });
    }

    pub fn released_relay_count(&self) -> usize {
        self.released_relays.lock().len()
    }

    pub fn idle_tcp(&self, timeout: Duration) -> Vec<Arc<TcpSession>> {
        self.tcp_sessions
            .iter()
            .filter(|s| s.idle_for() >= timeout)
            .map(|s| s.clone())
            .collect()
    }

    pub fn idle_udp(&self, timeout: Duration) -> Vec<FlowKey> {
        self.udp_flows
            .iter()
            .filter(|f| f.idle_for() >= timeout)
            .map(|f| *f.key())
            .collect()
    }

    pub fn tcp_sessions(&self) -> Vec<Arc<TcpSession>> {
        self.tcp_sessions.iter().map(|s| s.clone()).collect()
    }

    pub fn udp_keys(&self) -> Vec<FlowKey> {
        self.udp_flows.iter().map(|f| *f.key()).collect()
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp_sessions.len()
    }

    pub fn udp_count(&self) -> usize {
        self.udp_flows.len()
    }

    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    pub fn relay_count(&self) -> usize {
        self.relay_targets.len()
    }

    /// Aborts whatever is left and empties every table.
    pub fn clear(&self) {
        for session in self.tcp_sessions.iter() {
            session.abort();
        }
        for flow in self.udp_flows.iter() {
            flow.close();
        }
        for handle in self.relay_tasks.iter() {
            handle.abort();
        }
        for (handle, _) in self.released_relays.lock().drain(..) {
            handle.abort();
        }
        self.tcp_sessions.clear();
        self.udp_flows.clear();
        self.trackers.clear();
        self.relay_targets.clear();
        self.relay_tasks.clear();
        self.update_gauge();
    }
}
