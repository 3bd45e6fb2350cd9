use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::messages::{IceCandidate, IceCandidateMessage, PeerId};

/// Handle returned by [`CandidateRegistry::add`], used to remove that
/// listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Remote ICE candidate listeners keyed by the remote peer id.
#[derive(Debug, Default)]
pub struct CandidateRegistry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<PeerId, Vec<(ListenerId, mpsc::UnboundedSender<IceCandidate>)>>>,
}

impl CandidateRegistry {
    pub fn add(&self, remote_id: &str, listener: mpsc::UnboundedSender<IceCandidate>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .entry(remote_id.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove(&self, remote_id: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(entries) = listeners.get_mut(remote_id) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(remote_id);
        }
        removed
    }

    /// Hands the candidate to every listener registered for the message's
    /// source. Returns how many listeners accepted it.
    pub fn dispatch(&self, message: &IceCandidateMessage) -> usize {
        let listeners = self.listeners.lock();
        let Some(entries) = listeners.get(&message.source_id) else {
            tracing::debug!(
                target = "rtc_tunnel::signal",
                remote_id = %message.source_id,
                "no candidate listener for remote"
            );
            return 0;
        };
        entries
            .iter()
            .filter(|(_, listener)| listener.send(message.candidate.clone()).is_ok())
            .count()
    }

    pub fn listener_count(&self, remote_id: &str) -> usize {
        self.listeners
            .lock()
            .get(remote_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: &str, candidate: &str) -> IceCandidateMessage {
        IceCandidateMessage {
            source_id: from.into(),
            destination_id: "me".into(),
            candidate: IceCandidate {
                candidate: candidate.into(),
                sdp_mid: None,
                sdp_m_line_index: None,
                username_fragment: None,
            },
        }
    }

    #[test]
    fn dispatches_to_every_listener_of_the_source() {
        let registry = CandidateRegistry::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, mut rx3) = mpsc::unbounded_channel();
        registry.add("alice", tx1);
        registry.add("alice", tx2);
        registry.add("bob", tx3);

        assert_eq!(registry.dispatch(&message("alice", "c1")), 2);
        assert_eq!(rx1.try_recv().expect("rx1").candidate, "c1");
        assert_eq!(rx2.try_recv().expect("rx2").candidate, "c1");
        assert!(rx3.try_recv().is_err());
    }

    #[test]
    fn removal_is_explicit_and_per_listener() {
        let registry = CandidateRegistry::default();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let first = registry.add("alice", tx1);
        registry.add("alice", tx2);

        assert!(registry.remove("alice", first));
        assert!(!registry.remove("alice", first));
        assert_eq!(registry.listener_count("alice"), 1);
        registry.dispatch(&message("alice", "c2"));
        assert_eq!(rx2.try_recv().expect("rx2").candidate, "c2");
    }

    #[test]
    fn unknown_source_is_ignored() {
        let registry = CandidateRegistry::default();
        assert_eq!(registry.dispatch(&message("nobody", "c")), 0);
    }
}
