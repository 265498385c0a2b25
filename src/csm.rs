//! the connection-side state machine: drives one request as seen from the socket/channel it
//! runs on.
//!
//! transitions are synchronous and non-blocking — they mutate [`ConnectionStateMachine`] in
//! place and return an [`Action`] describing what the caller (the channel's event loop) must do
//! next. the machine never performs I/O itself.

use std::{collections::VecDeque, mem};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    error::Error,
    head::{RequestBodyLength, RequestHeadState, ResponseHeadState},
    stream::ResponseStreamState,
};

/// whether the producer of the request body is currently allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Producer {
    Producing,
    Paused,
}

/// state legal only while the request body is still being assembled.
#[derive(Debug)]
enum RequestState {
    Streaming {
        expected_body_length: Option<u64>,
        sent_body_bytes: u64,
        producer: Producer,
    },
    EndSent,
}

/// state legal only while the response is being read.
#[derive(Debug)]
enum ResponseState {
    WaitingForHead,
    ReceivingBody(ResponseHeadState, ResponseStreamState),
    EndReceived,
}

#[derive(Debug)]
enum CsmState {
    Initialized,
    WaitForChannelToBecomeWritable(RequestHeadState, RequestBodyLength),
    Running(RequestState, ResponseState),
    Finished,
    Failed(Error),
}

/// a chunk of the response as read off the channel.
#[derive(Debug)]
pub enum ChannelRead {
    Head(ResponseHeadState),
    Body(Bytes),
    End,
}

/// how the terminal action leaves the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStreamAction {
    /// the wire is out of sync (a framing violation or a partially-written request); the
    /// connection cannot be reused and must be torn down.
    Close,
    /// a success in which the terminating chunk still needs to be emitted on the wire.
    SendRequestEnd,
    /// no further action is needed; in failure terminal actions this additionally means the
    /// request head was never written and the connection itself is unaffected.
    None,
}

/// what the caller must do in response to a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// nothing to do; the machine is waiting on its next input.
    Wait,
    /// issue another socket read.
    Read,
    /// write the request head; `start_body` says whether a body follows immediately.
    SendRequestHead { start_body: bool },
    PauseRequestBodyStream,
    ResumeRequestBodyStream,
    SendBodyPart(Bytes),
    SendRequestEnd,
    /// forward the response head to the delegate. `pause_request_body_stream` is `true` when
    /// this transition also just forced the upload producer to pause (the "head ≥ 300" rule).
    ForwardResponseHead {
        head: ResponseHeadState,
        pause_request_body_stream: bool,
    },
    ForwardResponseBodyParts(VecDeque<Bytes>),
    FailRequest(Error, FinalStreamAction),
    SucceedRequest(FinalStreamAction, VecDeque<Bytes>),
}

/// drives one HTTP request as seen from the channel it runs on.
///
/// single-threaded: every public method must be serialized by the caller, normally the
/// channel's own event-loop thread. see crate-level docs for the two-machine split.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: CsmState,
    is_writable: bool,
}

impl ConnectionStateMachine {
    pub fn new(is_channel_writable: bool) -> Self {
        Self {
            state: CsmState::Initialized,
            is_writable: is_channel_writable,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.is_writable
    }

    /// begin the request. valid only in `Initialized`.
    pub fn start(&mut self, head: RequestHeadState, metadata: RequestBodyLength) -> Action {
        match mem::replace(&mut self.state, CsmState::Initialized) {
            CsmState::Initialized => {
                if self.is_writable {
                    let (state, action) = Self::begin_running(metadata);
                    self.state = state;
                    action
                } else {
                    self.state = CsmState::WaitForChannelToBecomeWritable(head, metadata);
                    Action::Wait
                }
            }
            other => unreachable!("start() called outside Initialized: {other:?}"),
        }
    }

    fn begin_running(metadata: RequestBodyLength) -> (CsmState, Action) {
        let start_body = metadata.starts_body();
        let request_state = if start_body {
            RequestState::Streaming {
                expected_body_length: metadata.expected_len(),
                sent_body_bytes: 0,
                producer: Producer::Producing,
            }
        } else {
            RequestState::EndSent
        };
        (
            CsmState::Running(request_state, ResponseState::WaitingForHead),
            Action::SendRequestHead { start_body },
        )
    }

    /// notify the machine that channel writability flipped. repeated calls with the same value
    /// are a documented no-op.
    pub fn writability_changed(&mut self, writable: bool) -> Action {
        if writable == self.is_writable {
            return Action::Wait;
        }
        self.is_writable = writable;

        match mem::replace(&mut self.state, CsmState::Initialized) {
            CsmState::WaitForChannelToBecomeWritable(head, metadata) if writable => {
                let _ = head;
                let (state, action) = Self::begin_running(metadata);
                self.state = state;
                action
            }
            CsmState::WaitForChannelToBecomeWritable(head, metadata) => {
                self.state = CsmState::WaitForChannelToBecomeWritable(head, metadata);
                Action::Wait
            }
            CsmState::Running(
                RequestState::Streaming {
                    expected_body_length,
                    sent_body_bytes,
                    producer: Producer::Producing,
                },
                response_state,
            ) if !writable => {
                debug!("channel no longer writable, pausing request body producer");
                self.state = CsmState::Running(
                    RequestState::Streaming {
                        expected_body_length,
                        sent_body_bytes,
                        producer: Producer::Paused,
                    },
                    response_state,
                );
                Action::PauseRequestBodyStream
            }
            CsmState::Running(
                RequestState::Streaming {
                    expected_body_length,
                    sent_body_bytes,
                    producer: Producer::Paused,
                },
                response_state,
            ) if writable => {
                let blocked = matches!(&response_state, ResponseState::ReceivingBody(head, _) if !head.is_success_class());
                if blocked {
                    self.state = CsmState::Running(
                        RequestState::Streaming {
                            expected_body_length,
                            sent_body_bytes,
                            producer: Producer::Paused,
                        },
                        response_state,
                    );
                    Action::Wait
                } else {
                    trace!("channel writable again, resuming request body producer");
                    self.state = CsmState::Running(
                        RequestState::Streaming {
                            expected_body_length,
                            sent_body_bytes,
                            producer: Producer::Producing,
                        },
                        response_state,
                    );
                    Action::ResumeRequestBodyStream
                }
            }
            other => {
                self.state = other;
                Action::Wait
            }
        }
    }

    /// a body chunk arrived from the producer. valid only while `Running(Streaming, *)`.
    pub fn request_stream_part_received(&mut self, part: Bytes) -> Action {
        match mem::replace(&mut self.state, CsmState::Initialized) {
            CsmState::Running(
                RequestState::Streaming {
                    expected_body_length,
                    sent_body_bytes,
                    producer,
                },
                response_state,
            ) => {
                let short_circuited = matches!(&response_state, ResponseState::ReceivingBody(head, _) if !head.is_success_class());
                if short_circuited {
                    debug_assert_eq!(producer, Producer::Paused, "upload must be paused once a >=300 head arrives");
                    self.state = CsmState::Running(
                        RequestState::Streaming {
                            expected_body_length,
                            sent_body_bytes,
                            producer,
                        },
                        response_state,
                    );
                    return Action::Wait;
                }

                let new_total = sent_body_bytes + part.len() as u64;
                if let Some(expected) = expected_body_length {
                    if new_total > expected {
                        let err = Error::BodyLengthMismatch {
                            expected,
                            sent: new_total,
                        };
                        self.state = CsmState::Failed(err.clone());
                        return Action::FailRequest(err, FinalStreamAction::Close);
                    }
                }

                self.state = CsmState::Running(
                    RequestState::Streaming {
                        expected_body_length,
                        sent_body_bytes: new_total,
                        producer,
                    },
                    response_state,
                );
                Action::SendBodyPart(part)
            }
            other => unreachable!("request_stream_part_received() outside Running(Streaming, *): {other:?}"),
        }
    }

    /// the producer signalled it has no more body parts. valid only while `Running(Streaming, *)`.
    pub fn request_stream_finished(&mut self) -> Action {
        match mem::replace(&mut self.state, CsmState::Initialized) {
            CsmState::Running(
                RequestState::Streaming {
                    expected_body_length,
                    sent_body_bytes,
                    producer,
                },
                response_state,
            ) => {
                let short_circuited = matches!(&response_state, ResponseState::ReceivingBody(head, _) if !head.is_success_class());
                if short_circuited {
                    debug_assert_eq!(producer, Producer::Paused);
                    self.state = CsmState::Running(RequestState::EndSent, response_state);
                    return Action::Wait;
                }

                if let Some(expected) = expected_body_length {
                    if sent_body_bytes != expected {
                        let err = Error::BodyLengthMismatch {
                            expected,
                            sent: sent_body_bytes,
                        };
                        self.state = CsmState::Failed(err.clone());
                        return Action::FailRequest(err, FinalStreamAction::Close);
                    }
                }

                match response_state {
                    ResponseState::EndReceived => {
                        self.state = CsmState::Finished;
                        Action::SucceedRequest(FinalStreamAction::SendRequestEnd, VecDeque::new())
                    }
                    other => {
                        self.state = CsmState::Running(RequestState::EndSent, other);
                        Action::SendRequestEnd
                    }
                }
            }
            other => unreachable!("request_stream_finished() outside Running(Streaming, *): {other:?}"),
        }
    }

    /// something arrived off the channel.
    pub fn channel_read(&mut self, read: ChannelRead) -> Action {
        match read {
            ChannelRead::Head(head) => self.channel_read_head(head),
            ChannelRead::Body(bytes) => self.channel_read_body(bytes),
            ChannelRead::End => self.channel_read_end(),
        }
    }

    fn channel_read_head(&mut self, head: ResponseHeadState) -> Action {
        if head.is_informational() {
            return Action::Wait;
        }

        match mem::replace(&mut self.state, CsmState::Initialized) {
            CsmState::Running(request_state, ResponseState::WaitingForHead) => {
                if head.is_success_class() {
                    let action = Action::ForwardResponseHead {
                        head: head.clone(),
                        pause_request_body_stream: false,
                    };
                    self.state = CsmState::Running(
                        request_state,
                        ResponseState::ReceivingBody(head, ResponseStreamState::new()),
                    );
                    action
                } else {
                    let (request_state, paused) = match request_state {
                        RequestState::Streaming {
                            expected_body_length,
                            sent_body_bytes,
                            producer: Producer::Producing,
                        } => (
                            RequestState::Streaming {
                                expected_body_length,
                                sent_body_bytes,
                                producer: Producer::Paused,
                            },
                            true,
                        ),
                        other => (other, false),
                    };
                    let action = Action::ForwardResponseHead {
                        head: head.clone(),
                        pause_request_body_stream: paused,
                    };
                    self.state = CsmState::Running(
                        request_state,
                        ResponseState::ReceivingBody(head, ResponseStreamState::new()),
                    );
                    action
                }
            }
            other => unreachable!("response head received outside Running(.., WaitingForHead): {other:?}"),
        }
    }

    fn channel_read_body(&mut self, bytes: Bytes) -> Action {
        match &mut self.state {
            CsmState::Running(_, ResponseState::ReceivingBody(_, sub)) => {
                sub.received_body_part(bytes);
                Action::Wait
            }
            other => unreachable!("response body received outside Running(.., ReceivingBody): {other:?}"),
        }
    }

    fn channel_read_end(&mut self) -> Action {
        match mem::replace(&mut self.state, CsmState::Initialized) {
            CsmState::Running(request_state, ResponseState::ReceivingBody(head, sub)) => {
                let remaining = sub.end();
                if !head.is_success_class() {
                    self.state = CsmState::Finished;
                    Action::SucceedRequest(FinalStreamAction::Close, remaining)
                } else if matches!(request_state, RequestState::EndSent) {
                    self.state = CsmState::Finished;
                    Action::SucceedRequest(FinalStreamAction::None, remaining)
                } else {
                    self.state = CsmState::Running(request_state, ResponseState::EndReceived);
                    Action::ForwardResponseBodyParts(remaining)
                }
            }
            other => unreachable!("response end received outside Running(.., ReceivingBody): {other:?}"),
        }
    }

    /// drain whatever the response sub-state has buffered since the last call, coalescing reads
    /// into bursts.
    pub fn channel_read_complete(&mut self) -> Action {
        match &mut self.state {
            CsmState::Running(_, ResponseState::ReceivingBody(_, sub)) => match sub.channel_read_complete() {
                Some(batch) => Action::ForwardResponseBodyParts(batch),
                None => Action::Wait,
            },
            _ => Action::Wait,
        }
    }

    /// should another socket read be issued?
    pub fn read(&self) -> Action {
        match &self.state {
            CsmState::Running(_, ResponseState::ReceivingBody(_, sub)) => match sub.read() {
                crate::stream::ReadAction::Read => Action::Read,
                crate::stream::ReadAction::Wait => Action::Wait,
            },
            _ => Action::Read,
        }
    }

    /// consumer-driven pull: the delegate wants another chunk.
    pub fn demand_more_response_body_parts(&mut self) -> Action {
        match &self.state {
            CsmState::Running(_, ResponseState::ReceivingBody(_, sub)) => match sub.demand_more_response_body_parts() {
                crate::stream::ReadAction::Read => Action::Read,
                crate::stream::ReadAction::Wait => Action::Wait,
            },
            _ => Action::Read,
        }
    }

    /// no bytes were read within the idle window. valid only after `EndSent`.
    pub fn idle_read_timeout_triggered(&mut self) -> Action {
        let after_end_sent = matches!(
            &self.state,
            CsmState::Running(RequestState::EndSent, _) | CsmState::Finished | CsmState::Failed(_)
        );
        if !after_end_sent {
            unreachable!("idle_read_timeout_triggered() before EndSent");
        }
        self.fail_now(Error::ReadTimeout)
    }

    pub fn request_cancelled(&mut self) -> Action {
        self.fail_now(Error::Cancelled)
    }

    pub fn channel_inactive(&mut self) -> Action {
        self.fail_now(Error::RemoteConnectionClosed)
    }

    pub fn error_happened(&mut self, err: Error) -> Action {
        self.fail_now(err)
    }

    fn fail_now(&mut self, err: Error) -> Action {
        if matches!(&self.state, CsmState::Finished | CsmState::Failed(_)) {
            // terminal states absorb further events silently.
            return Action::Wait;
        }
        let final_action = match &self.state {
            CsmState::Initialized | CsmState::WaitForChannelToBecomeWritable(..) => FinalStreamAction::None,
            _ => FinalStreamAction::Close,
        };
        self.state = CsmState::Failed(err.clone());
        Action::FailRequest(err, final_action)
    }
}
