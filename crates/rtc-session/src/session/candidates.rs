//! Candidate buffering in both directions
//!
//! Local candidates wait for a flush (debounce or end of gathering) and for
//! signaling; remote candidates wait for a remote description.

use crate::peer::{sort_for_transmission, IceCandidate};
use std::collections::VecDeque;

/// Candidates not yet sendable or not yet applicable
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    local: Vec<IceCandidate>,
    remote: VecDeque<IceCandidate>,
    flush_armed: bool,
}

impl IceCandidateBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a gathered candidate
    ///
    /// Returns true when this candidate opens a new batch, i.e. the caller
    /// should arm the debounce timer.
    pub fn push_local(&mut self, candidate: IceCandidate) -> bool {
        self.local.push(candidate);
        if self.flush_armed {
            false
        } else {
            self.flush_armed = true;
            true
        }
    }

    /// Take every pending local candidate in transmission order
    pub fn take_local_batch(&mut self) -> Vec<IceCandidate> {
        self.flush_armed = false;
        let mut batch = std::mem::take(&mut self.local);
        sort_for_transmission(&mut batch);
        batch
    }

    /// Put back candidates that could not be sent
    pub fn requeue_local(&mut self, unsent: Vec<IceCandidate>) {
        let newer = std::mem::replace(&mut self.local, unsent);
        self.local.extend(newer);
    }

    /// Number of local candidates waiting
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    /// True while a debounce timer is pending
    pub fn is_flush_armed(&self) -> bool {
        self.flush_armed
    }

    /// Queue a remote candidate until a remote description exists
    pub fn push_remote(&mut self, candidate: IceCandidate) {
        self.remote.push_back(candidate);
    }

    /// Take queued remote candidates in arrival order
    pub fn take_remote(&mut self) -> Vec<IceCandidate> {
        self.remote.drain(..).collect()
    }

    /// Number of remote candidates waiting
    pub fn remote_len(&self) -> usize {
        self.remote.len()
    }

    /// Drop everything (the connection they belong to is gone)
    pub fn clear(&mut self) {
        self.local.clear();
        self.remote.clear();
        self.flush_armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::CandidateType;

    fn candidate(typ: &str, priority: u32) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:1 1 udp {} 10.0.0.1 5000 typ {}",
            priority, typ
        ))
    }

    #[test]
    fn test_first_candidate_arms_flush() {
        let mut buffer = IceCandidateBuffer::new();
        assert!(buffer.push_local(candidate("host", 1)));
        assert!(!buffer.push_local(candidate("host", 2)));
        assert!(buffer.is_flush_armed());

        let batch = buffer.take_local_batch();
        assert_eq!(batch.len(), 2);
        assert!(!buffer.is_flush_armed());
        assert!(buffer.push_local(candidate("host", 3)));
    }

    #[test]
    fn test_batch_is_sorted() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.push_local(candidate("relay", 900));
        buffer.push_local(candidate("host", 10));
        buffer.push_local(candidate("srflx", 500));
        buffer.push_local(candidate("host", 20));

        let batch = buffer.take_local_batch();
        let order: Vec<_> = batch
            .iter()
            .map(|c| (c.candidate_type(), c.priority()))
            .collect();
        assert_eq!(
            order,
            vec![
                (CandidateType::Host, 20),
                (CandidateType::Host, 10),
                (CandidateType::ServerReflexive, 500),
                (CandidateType::Relay, 900),
            ]
        );
    }

    #[test]
    fn test_requeue_keeps_unsent_first() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.push_local(candidate("host", 1));
        buffer.requeue_local(vec![candidate("relay", 5)]);
        assert_eq!(buffer.local_len(), 2);
        assert_eq!(
            buffer.local[0].candidate_type(),
            CandidateType::Relay,
            "unsent candidates precede newer ones"
        );
    }

    #[test]
    fn test_remote_arrival_order() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.push_remote(candidate("relay", 1));
        buffer.push_remote(candidate("host", 2));
        let drained = buffer.take_remote();
        assert_eq!(drained[0].candidate_type(), CandidateType::Relay);
        assert_eq!(drained[1].candidate_type(), CandidateType::Host);
        assert_eq!(buffer.remote_len(), 0);
    }

    #[test]
    fn test_clear() {
        let mut buffer = IceCandidateBuffer::new();
        buffer.push_local(candidate("host", 1));
        buffer.push_remote(candidate("host", 1));
        buffer.clear();
        assert_eq!(buffer.local_len(), 0);
        assert_eq!(buffer.remote_len(), 0);
        assert!(!buffer.is_flush_armed());
    }
}
