//! Remote candidate buffering.
//!
//! A candidate handed to the negotiation engine before a remote description
//! exists is rejected by the engine, and candidates routinely arrive before
//! the offer/answer has been applied. The queue sits in front of the engine
//! and only lets candidates through once the gate has been opened.

use std::collections::VecDeque;

use callcore::IceCandidate;

#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<IceCandidate>,
    open: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit an inbound candidate.
    ///
    /// Returns the candidate when it may be applied right away; otherwise it
    /// is buffered and `None` is returned.
    pub fn admit(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.open {
            Some(candidate)
        } else {
            self.pending.push_back(candidate);
            None
        }
    }

    /// Open the gate and take everything buffered so far, in receipt order.
    ///
    /// The buffer is handed out only once; later calls return nothing.
    pub fn open(&mut self) -> Vec<IceCandidate> {
        self.open = true;
        self.pending.drain(..).collect()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop anything still buffered. Used when the session is torn down.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 UDP 2130706431 10.0.0.{n} 9000 typ host"))
    }

    #[test]
    fn test_buffers_until_opened() {
        let mut queue = CandidateQueue::new();
        assert!(!queue.is_open());

        for n in 0..3 {
            assert!(queue.admit(candidate(n)).is_none());
        }
        assert_eq!(queue.len(), 3);

        let drained = queue.open();
        assert_eq!(drained, vec![candidate(0), candidate(1), candidate(2)]);
        assert!(queue.is_empty());
        assert!(queue.is_open());
    }

    #[test]
    fn test_passes_through_once_open() {
        let mut queue = CandidateQueue::new();
        queue.open();

        assert_eq!(queue.admit(candidate(7)), Some(candidate(7)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drains_exactly_once() {
        let mut queue = CandidateQueue::new();
        queue.admit(candidate(1));

        assert_eq!(queue.open().len(), 1);
        assert!(queue.open().is_empty(), "second open must not replay candidates");
    }

    #[test]
    fn test_clear_discards_buffered() {
        let mut queue = CandidateQueue::new();
        queue.admit(candidate(1));
        queue.admit(candidate(2));
        queue.clear();

        assert!(queue.open().is_empty());
    }
}
