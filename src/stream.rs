//! the response-stream sub-state shared (in spirit) by [`crate::csm::ConnectionStateMachine`]
//! and [`crate::bsm::BagStateMachine`].
//!
//! a tiny FIFO with a read-demand flag. it is what lets the request pipeline exert two-way
//! backpressure: upward, to the server, by not issuing another socket read while the buffer
//! still holds undrained chunks; sideways, to the delegate, by the bag-side counterpart
//! (`bsm::RespStream`) asking the executor for more only once its own buffer runs dry.

use std::collections::VecDeque;

use bytes::Bytes;

/// whether the owner of this sub-state should issue another read against its underlying source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAction {
    /// the consumer is caught up; pull more data.
    Read,
    /// data is buffered and hasn't been asked for yet; hold off.
    Wait,
}

/// response-body chunks buffered between the wire and whatever drains them in batches.
#[derive(Debug, Default)]
pub struct ResponseStreamState {
    buffered: VecDeque<Bytes>,
}

impl ResponseStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// should the owner issue another read? `Wait` while undrained chunks are buffered so reads
    /// coalesce into bursts instead of growing the buffer unbounded.
    pub fn read(&self) -> ReadAction {
        if self.buffered.is_empty() {
            ReadAction::Read
        } else {
            ReadAction::Wait
        }
    }

    /// mirrors [`Self::read`] but triggered by consumer-side demand rather than wire readiness.
    pub fn demand_more_response_body_parts(&self) -> ReadAction {
        self.read()
    }

    /// append a freshly received chunk.
    pub fn received_body_part(&mut self, part: Bytes) {
        self.buffered.push_back(part);
    }

    /// drain whatever is buffered, for handing up to the caller in one batch. `None` when there
    /// is nothing to drain, so the caller can skip emitting an empty forward action.
    pub fn channel_read_complete(&mut self) -> Option<VecDeque<Bytes>> {
        if self.buffered.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffered))
        }
    }

    /// consume the sub-state, returning whatever remains unbuffered.
    pub fn end(mut self) -> VecDeque<Bytes> {
        std::mem::take(&mut self.buffered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_until_drained() {
        let mut s = ResponseStreamState::new();
        assert_eq!(s.read(), ReadAction::Read);
        s.received_body_part(Bytes::from_static(b"a"));
        assert_eq!(s.read(), ReadAction::Wait);
        let batch = s.channel_read_complete().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(s.read(), ReadAction::Read);
        assert!(s.channel_read_complete().is_none());
    }

    #[test]
    fn end_returns_remaining() {
        let mut s = ResponseStreamState::new();
        s.received_body_part(Bytes::from_static(b"a"));
        s.received_body_part(Bytes::from_static(b"b"));
        let remaining = s.end();
        assert_eq!(remaining.len(), 2);
    }
}
