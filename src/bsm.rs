//! the bag-side state machine: drives one request as seen by its owning delegate/task.
//!
//! mirrors [`crate::csm::ConnectionStateMachine`] in style (synchronous transitions, `Action`
//! return values) but lives on the bag's owning thread rather than the channel's event loop —
//! the two never share memory, only the action values the executor ferries between them.

use std::{collections::VecDeque, fmt, mem, sync::Arc};

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Uri};
use tracing::{debug, trace};

use crate::{
    ack::{self, Ack, AckSender},
    error::Error,
    head::ResponseHeadState,
};

/// pure predicate the bag consults at most once per response: does this status/header pair
/// redirect, and if so, where?
pub type RedirectPredicate = Arc<dyn Fn(&StatusCode, &HeaderMap) -> Option<Uri> + Send + Sync>;

#[derive(Debug)]
enum ReqStream {
    Initialized,
    Producing,
    /// the stored `AckSender` is `None` until the producer's next `write_next_request_part`
    /// actually needs one; `pause_request_body_stream()` alone never allocates one.
    Paused(Option<AckSender>),
    Finished,
}

#[derive(Debug)]
enum Next {
    AskExecutorForMore,
    Eof,
    Error(Error),
}

#[derive(Debug)]
enum RespStream {
    Initialized,
    Buffering(VecDeque<Bytes>, Next),
    WaitingForRemote,
}

#[derive(Debug)]
enum BsmState<S, E> {
    Initialized,
    Queued(S),
    Executing(E, ReqStream, RespStream),
    Redirected(ResponseHeadState, Uri),
    Finished(Option<Error>),
}

/// what [`BagStateMachine::resume_request_body_stream`] tells the caller to do.
#[derive(Debug)]
pub enum ResumeAction {
    /// first resume: spawn the writer task.
    StartWriter,
    /// fulfill this ack to let the paused producer's `write_next_request_part` return.
    SucceedAck(AckSender),
    /// redirect already in flight, or the writer already finished; nothing to do.
    None,
}

/// what [`BagStateMachine::write_next_request_part`] tells the caller to do.
#[derive(Debug)]
pub enum WriteAction<E> {
    Write(Bytes, E, Ack),
    /// writing after the stream had already finished; the whole task is now failed.
    FailTask(Error),
    /// a soft failure that fails only the producer's own wait, not the whole task (redirect in
    /// flight, or the task already finished by some other path).
    FailFuture(Error),
}

/// what [`BagStateMachine::finish_request_body_stream`] tells the caller to do.
#[derive(Debug)]
pub enum FinishAction<E> {
    ForwardStreamFinished(E, Option<AckSender>),
    ForwardStreamFailureAndFailTask(E, Error, Option<AckSender>),
}

/// what [`BagStateMachine::consume_more_body_data`] tells the caller to do.
#[derive(Debug)]
pub enum ConsumeAction<E> {
    Consume(Bytes),
    RequestMoreFromExecutor(E),
    FinishStream,
    FailTask { err: Error, cancel_executor: Option<E> },
}

/// what [`BagStateMachine::succeed_request`] tells the caller to do.
#[derive(Debug)]
pub enum ReceiveResponseEndAction {
    SucceedRequest,
    Consume(Bytes),
    Redirect(ResponseHeadState, Uri),
    None,
}

/// what [`BagStateMachine::fail`] tells the caller to do.
#[derive(Debug)]
pub enum FailAction<S, E> {
    FailTask { scheduler: Option<S>, executor: Option<E> },
    CancelExecutor(E),
    /// already finished; the cancellation is dropped.
    Ignored,
}

/// drives one HTTP request as seen by its owner: queueing, executor binding, upload
/// backpressure, download buffering, redirect interception, cancellation.
pub struct BagStateMachine<S, E> {
    state: BsmState<S, E>,
    redirect: Option<RedirectPredicate>,
}

impl<S, E> fmt::Debug for BagStateMachine<S, E>
where
    S: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BagStateMachine").field("state", &self.state).finish()
    }
}

impl<S, E> BagStateMachine<S, E>
where
    S: Clone + fmt::Debug,
    E: Clone + fmt::Debug,
{
    pub fn new(redirect: Option<RedirectPredicate>) -> Self {
        Self {
            state: BsmState::Initialized,
            redirect,
        }
    }

    /// the request was handed to a scheduler's queue. races with `will_execute_request` are
    /// resolved by treating any non-`Initialized` state as the late call and ignoring it.
    pub fn request_was_queued(&mut self, scheduler: S) {
        if matches!(self.state, BsmState::Initialized) {
            self.state = BsmState::Queued(scheduler);
        } else {
            trace!("request_was_queued lost the race to will_execute_request, ignoring");
        }
    }

    /// an executor picked up the request. returns `false` if the request was already cancelled
    /// while queued, in which case the caller must not run it.
    pub fn will_execute_request(&mut self, executor: E) -> bool {
        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Initialized | BsmState::Queued(_) => {
                self.state = BsmState::Executing(executor, ReqStream::Initialized, RespStream::Initialized);
                true
            }
            BsmState::Finished(Some(err)) => {
                debug!(?err, "will_execute_request on a request cancelled before execution");
                self.state = BsmState::Finished(Some(err));
                false
            }
            other => unreachable!("will_execute_request() outside Initialized/Queued/cancelled-Finished: {other:?}"),
        }
    }

    pub fn resume_request_body_stream(&mut self) -> ResumeAction {
        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Executing(executor, ReqStream::Initialized, resp) => {
                self.state = BsmState::Executing(executor, ReqStream::Producing, resp);
                ResumeAction::StartWriter
            }
            BsmState::Executing(executor, ReqStream::Paused(ack), resp) => {
                self.state = BsmState::Executing(executor, ReqStream::Producing, resp);
                match ack {
                    Some(sender) => ResumeAction::SucceedAck(sender),
                    None => ResumeAction::None,
                }
            }
            other => {
                self.state = other;
                ResumeAction::None
            }
        }
    }

    pub fn pause_request_body_stream(&mut self) {
        if let BsmState::Executing(_, req @ ReqStream::Producing, _) = &mut self.state {
            *req = ReqStream::Paused(None);
        }
    }

    pub fn write_next_request_part(&mut self, part: Bytes) -> WriteAction<E> {
        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Executing(executor, ReqStream::Initialized | ReqStream::Producing, resp) => {
                self.state = BsmState::Executing(executor.clone(), ReqStream::Producing, resp);
                WriteAction::Write(part, executor, ack::ready())
            }
            BsmState::Executing(executor, ReqStream::Paused(None), resp) => {
                let (sender, ack) = ack::pair();
                self.state = BsmState::Executing(executor.clone(), ReqStream::Paused(Some(sender)), resp);
                WriteAction::Write(part, executor, ack)
            }
            BsmState::Executing(executor, ReqStream::Paused(Some(sender)), resp) => {
                // the producer must await its outstanding ack before writing again; a second
                // write while one is already pending violates the "at most one ack outstanding"
                // invariant and is a programmer error, not a runtime-recoverable state.
                self.state = BsmState::Executing(executor, ReqStream::Paused(Some(sender)), resp);
                unreachable!("write_next_request_part() called with an ack already outstanding");
            }
            BsmState::Executing(executor, ReqStream::Finished, resp) => {
                self.state = BsmState::Finished(Some(Error::WriteAfterRequestSent));
                let _ = (executor, resp);
                WriteAction::FailTask(Error::WriteAfterRequestSent)
            }
            redirected @ BsmState::Redirected(..) => {
                self.state = redirected;
                WriteAction::FailFuture(Error::RequestStreamCancelled)
            }
            finished @ BsmState::Finished(_) => {
                self.state = finished;
                WriteAction::FailFuture(Error::RequestStreamCancelled)
            }
            other => unreachable!("write_next_request_part() before will_execute_request(): {other:?}"),
        }
    }

    pub fn finish_request_body_stream(&mut self, result: Result<(), Error>) -> FinishAction<E> {
        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Executing(executor, req, resp) => match result {
                Ok(()) => {
                    let ack_to_fulfill = match req {
                        ReqStream::Paused(ack) => ack,
                        ReqStream::Initialized | ReqStream::Producing | ReqStream::Finished => None,
                    };
                    self.state = BsmState::Executing(executor.clone(), ReqStream::Finished, resp);
                    FinishAction::ForwardStreamFinished(executor, ack_to_fulfill)
                }
                Err(err) => {
                    let ack_to_fail = match req {
                        ReqStream::Paused(ack) => ack,
                        ReqStream::Initialized | ReqStream::Producing | ReqStream::Finished => None,
                    };
                    self.state = BsmState::Finished(Some(err.clone()));
                    FinishAction::ForwardStreamFailureAndFailTask(executor, err, ack_to_fail)
                }
            },
            other => unreachable!("finish_request_body_stream() outside Executing: {other:?}"),
        }
    }

    /// a response head arrived. returns `false` (and intercepts into `Redirected`) if the
    /// redirect predicate accepts it; the delegate never sees the head in that case.
    pub fn receive_response_head(&mut self, head: ResponseHeadState) -> bool {
        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Executing(executor, req, RespStream::Initialized) => {
                if let Some(target) = self.redirect.as_ref().and_then(|p| p(&head.status, &head.headers)) {
                    debug!(%target, "response head matched redirect predicate, intercepting");
                    self.state = BsmState::Redirected(head, target);
                    let _ = (executor, req);
                    false
                } else {
                    self.state = BsmState::Executing(executor, req, RespStream::Buffering(VecDeque::new(), Next::AskExecutorForMore));
                    true
                }
            }
            other => unreachable!("receive_response_head() outside Executing(.., RespStream::Initialized): {other:?}"),
        }
    }

    /// chunks arrived from the executor. returns the first chunk immediately if the consumer
    /// was already blocked waiting for it.
    pub fn receive_response_body_parts(&mut self, chunks: VecDeque<Bytes>) -> Option<Bytes> {
        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Executing(executor, req, RespStream::Buffering(mut fifo, Next::AskExecutorForMore)) => {
                fifo.extend(chunks);
                self.state = BsmState::Executing(executor, req, RespStream::Buffering(fifo, Next::AskExecutorForMore));
                None
            }
            BsmState::Executing(executor, req, RespStream::WaitingForRemote) => {
                let mut chunks = chunks;
                let first = chunks.pop_front();
                self.state = BsmState::Executing(executor, req, RespStream::Buffering(chunks, Next::AskExecutorForMore));
                first
            }
            other => unreachable!("receive_response_body_parts() in unexpected state: {other:?}"),
        }
    }

    /// the response ended. flushes any trailing bytes and decides the terminal action.
    pub fn succeed_request(&mut self, final_chunks: VecDeque<Bytes>) -> ReceiveResponseEndAction {
        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Redirected(head, target) => {
                self.state = BsmState::Finished(None);
                ReceiveResponseEndAction::Redirect(head, target)
            }
            BsmState::Executing(executor, req, RespStream::WaitingForRemote) => {
                if final_chunks.is_empty() {
                    self.state = BsmState::Finished(None);
                    ReceiveResponseEndAction::SucceedRequest
                } else {
                    let mut final_chunks = final_chunks;
                    let first = final_chunks.pop_front().expect("checked non-empty above");
                    self.state = BsmState::Executing(executor, req, RespStream::Buffering(final_chunks, Next::Eof));
                    ReceiveResponseEndAction::Consume(first)
                }
            }
            BsmState::Executing(executor, req, RespStream::Buffering(mut fifo, next)) => {
                if fifo.is_empty() && final_chunks.is_empty() {
                    self.state = BsmState::Finished(None);
                    ReceiveResponseEndAction::SucceedRequest
                } else {
                    fifo.extend(final_chunks);
                    self.state = BsmState::Executing(executor, req, RespStream::Buffering(fifo, match next {
                        Next::Error(e) => Next::Error(e),
                        Next::AskExecutorForMore | Next::Eof => Next::Eof,
                    }));
                    ReceiveResponseEndAction::None
                }
            }
            other => unreachable!("succeed_request() in unexpected state: {other:?}"),
        }
    }

    /// the consumer reports what happened with the previous chunk and asks for the next one.
    pub fn consume_more_body_data(&mut self, prev_result: Result<(), Error>) -> ConsumeAction<E> {
        if let Err(err) = prev_result {
            return self.fail_with_consumption_error(err);
        }

        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Executing(executor, req, RespStream::Buffering(mut fifo, next)) => {
                if let Some(chunk) = fifo.pop_front() {
                    self.state = BsmState::Executing(executor, req, RespStream::Buffering(fifo, next));
                    return ConsumeAction::Consume(chunk);
                }
                match next {
                    Next::AskExecutorForMore => {
                        self.state = BsmState::Executing(executor.clone(), req, RespStream::WaitingForRemote);
                        ConsumeAction::RequestMoreFromExecutor(executor)
                    }
                    Next::Eof => {
                        self.state = BsmState::Finished(None);
                        ConsumeAction::FinishStream
                    }
                    Next::Error(err) => {
                        self.state = BsmState::Finished(Some(err.clone()));
                        ConsumeAction::FailTask { err, cancel_executor: None }
                    }
                }
            }
            other => unreachable!("consume_more_body_data() in unexpected state: {other:?}"),
        }
    }

    /// first-error-wins policy for a consumption error surfaced while a connection error is
    /// already pending delivery: the connection error happened first and is kept; the freshly
    /// reported one is dropped along with the executor cancellation (the executor is already
    /// dead in that case).
    fn fail_with_consumption_error(&mut self, err: Error) -> ConsumeAction<E> {
        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Executing(executor, req, RespStream::Buffering(fifo, Next::Error(existing))) => {
                self.state = BsmState::Finished(Some(existing.clone()));
                let _ = (executor, req, fifo);
                ConsumeAction::FailTask {
                    err: existing,
                    cancel_executor: None,
                }
            }
            BsmState::Executing(executor, req, RespStream::Buffering(fifo, next)) => {
                self.state = BsmState::Finished(Some(err.clone()));
                let _ = (req, fifo, next);
                ConsumeAction::FailTask {
                    err,
                    cancel_executor: Some(executor),
                }
            }
            BsmState::Executing(..) => {
                unreachable!(
                    "fail_with_consumption_error() while WaitingForRemote: not proven reachable by any known caller"
                )
            }
            other => unreachable!("fail_with_consumption_error() in unexpected state: {other:?}"),
        }
    }

    /// universal cancellation entry point. always valid, including from another thread (the
    /// caller still must hop to the bag's owning thread before calling it).
    pub fn fail(&mut self, err: Error) -> FailAction<S, E> {
        match mem::replace(&mut self.state, BsmState::Initialized) {
            BsmState::Initialized => {
                self.state = BsmState::Finished(Some(err));
                FailAction::FailTask {
                    scheduler: None,
                    executor: None,
                }
            }
            BsmState::Queued(scheduler) => {
                self.state = BsmState::Finished(Some(err));
                FailAction::FailTask {
                    scheduler: Some(scheduler),
                    executor: None,
                }
            }
            BsmState::Executing(executor, req, RespStream::Buffering(fifo, Next::Eof)) => {
                self.state = BsmState::Executing(executor.clone(), req, RespStream::Buffering(fifo, Next::Error(err)));
                FailAction::CancelExecutor(executor)
            }
            BsmState::Executing(executor, req, RespStream::Buffering(fifo, next @ Next::Error(_))) => {
                // the original error happened first; keep it, just make sure the (already dead)
                // executor gets told to clean up.
                self.state = BsmState::Executing(executor.clone(), req, RespStream::Buffering(fifo, next));
                FailAction::CancelExecutor(executor)
            }
            BsmState::Executing(executor, _req, RespStream::Buffering(_, Next::AskExecutorForMore)) => {
                self.state = BsmState::Finished(Some(err));
                FailAction::FailTask {
                    scheduler: None,
                    executor: Some(executor),
                }
            }
            BsmState::Executing(executor, _req, RespStream::WaitingForRemote | RespStream::Initialized) => {
                self.state = BsmState::Finished(Some(err));
                FailAction::FailTask {
                    scheduler: None,
                    executor: Some(executor),
                }
            }
            redirected @ BsmState::Redirected(..) => {
                let _ = redirected;
                self.state = BsmState::Finished(Some(err));
                FailAction::FailTask {
                    scheduler: None,
                    executor: None,
                }
            }
            finished @ BsmState::Finished(_) => {
                self.state = finished;
                FailAction::Ignored
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_head(status: u16) -> ResponseHeadState {
        ResponseHeadState::new(StatusCode::from_u16(status).unwrap(), HeaderMap::new())
    }

    #[test]
    fn late_queue_race_leaves_executing() {
        let mut bsm: BagStateMachine<&str, &str> = BagStateMachine::new(None);
        assert!(bsm.will_execute_request("exec"));
        bsm.request_was_queued("scheduler");
        assert!(matches!(bsm.state, BsmState::Executing(..)));
    }

    #[test]
    fn cancel_while_queued_then_execute_returns_false() {
        let mut bsm: BagStateMachine<&str, &str> = BagStateMachine::new(None);
        bsm.request_was_queued("scheduler");
        let action = bsm.fail(Error::Cancelled);
        assert!(matches!(
            action,
            FailAction::FailTask {
                scheduler: Some("scheduler"),
                executor: None
            }
        ));
        assert!(!bsm.will_execute_request("exec"));
    }

    #[test]
    fn redirect_swallows_body_and_succeed() {
        let predicate: RedirectPredicate = Arc::new(|status, _headers| {
            (*status == StatusCode::FOUND).then(|| Uri::from_static("http://example.test/next"))
        });
        let mut bsm: BagStateMachine<&str, &str> = BagStateMachine::new(Some(predicate));
        bsm.will_execute_request("exec");
        let head = response_head(302);
        assert!(!bsm.receive_response_head(head.clone()));
        match bsm.succeed_request(VecDeque::new()) {
            ReceiveResponseEndAction::Redirect(h, uri) => {
                assert_eq!(h.status, head.status);
                assert_eq!(uri, Uri::from_static("http://example.test/next"));
            }
            other => panic!("expected Redirect, got {other:?}"),
        }
    }

    #[test]
    fn no_redirect_forwards_chunks_to_consumer() {
        let mut bsm: BagStateMachine<&str, &str> = BagStateMachine::new(None);
        bsm.will_execute_request("exec");
        assert!(bsm.receive_response_head(response_head(200)));
        let mut chunks = VecDeque::new();
        chunks.push_back(Bytes::from_static(b"a"));
        assert_eq!(bsm.receive_response_body_parts(chunks), None);
        match bsm.consume_more_body_data(Ok(())) {
            ConsumeAction::Consume(b) => assert_eq!(b, Bytes::from_static(b"a")),
            other => panic!("expected Consume, got {other:?}"),
        }
        match bsm.consume_more_body_data(Ok(())) {
            ConsumeAction::RequestMoreFromExecutor(e) => assert_eq!(e, "exec"),
            other => panic!("expected RequestMoreFromExecutor, got {other:?}"),
        }
    }

    #[test]
    fn waiting_consumer_gets_chunk_immediately() {
        let mut bsm: BagStateMachine<&str, &str> = BagStateMachine::new(None);
        bsm.will_execute_request("exec");
        bsm.receive_response_head(response_head(200));
        bsm.consume_more_body_data(Ok(())); // moves to WaitingForRemote
        let mut chunks = VecDeque::new();
        chunks.push_back(Bytes::from_static(b"x"));
        chunks.push_back(Bytes::from_static(b"y"));
        assert_eq!(bsm.receive_response_body_parts(chunks), Some(Bytes::from_static(b"x")));
        match bsm.consume_more_body_data(Ok(())) {
            ConsumeAction::Consume(b) => assert_eq!(b, Bytes::from_static(b"y")),
            other => panic!("expected Consume, got {other:?}"),
        }
    }

    #[test]
    fn first_error_wins_on_concurrent_fail_during_eof_drain() {
        let mut bsm: BagStateMachine<&str, &str> = BagStateMachine::new(None);
        bsm.will_execute_request("exec");
        bsm.receive_response_head(response_head(200));
        let mut chunks = VecDeque::new();
        chunks.push_back(Bytes::from_static(b"a"));
        bsm.succeed_request(chunks); // buffered fifo, Next::Eof

        let action = bsm.fail(Error::ReadTimeout);
        assert!(matches!(action, FailAction::CancelExecutor("exec")));

        match bsm.consume_more_body_data(Ok(())) {
            ConsumeAction::Consume(b) => assert_eq!(b, Bytes::from_static(b"a")),
            other => panic!("expected Consume, got {other:?}"),
        }
        // the buffered chunk drained; now the Eof-turned-Error(ReadTimeout) surfaces, not a
        // later, different error the consumer might report.
        match bsm.consume_more_body_data(Err(Error::Cancelled)) {
            ConsumeAction::FailTask { err, cancel_executor } => {
                assert_eq!(err, Error::ReadTimeout);
                assert_eq!(cancel_executor, None);
            }
            other => panic!("expected FailTask, got {other:?}"),
        }
    }

    #[test]
    fn second_fail_while_error_pending_keeps_first_error_and_cancels_again() {
        let mut bsm: BagStateMachine<&str, &str> = BagStateMachine::new(None);
        bsm.will_execute_request("exec");
        bsm.receive_response_head(response_head(200));
        let mut chunks = VecDeque::new();
        chunks.push_back(Bytes::from_static(b"a"));
        bsm.succeed_request(chunks); // buffered fifo, Next::Eof

        let action = bsm.fail(Error::ReadTimeout);
        assert!(matches!(action, FailAction::CancelExecutor("exec")));

        // a second fail() call races in before the consumer has drained the fifo; the first
        // error must be kept, and the executor is told to clean up again.
        let action = bsm.fail(Error::Cancelled);
        assert!(matches!(action, FailAction::CancelExecutor("exec")));

        match bsm.consume_more_body_data(Ok(())) {
            ConsumeAction::Consume(b) => assert_eq!(b, Bytes::from_static(b"a")),
            other => panic!("expected Consume, got {other:?}"),
        }
        match bsm.consume_more_body_data(Ok(())) {
            ConsumeAction::FailTask { err, cancel_executor } => {
                assert_eq!(err, Error::ReadTimeout);
                assert_eq!(cancel_executor, None);
            }
            other => panic!("expected FailTask, got {other:?}"),
        }
    }

    #[test]
    fn pause_resume_backpressure_roundtrip() {
        let mut bsm: BagStateMachine<&str, &str> = BagStateMachine::new(None);
        bsm.will_execute_request("exec");
        assert!(matches!(bsm.resume_request_body_stream(), ResumeAction::StartWriter));
        bsm.pause_request_body_stream();
        match bsm.write_next_request_part(Bytes::from_static(b"p")) {
            WriteAction::Write(_, _, _ack) => {}
            other => panic!("expected Write, got {other:?}"),
        }
        assert!(matches!(bsm.resume_request_body_stream(), ResumeAction::SucceedAck(_)));
    }

    #[test]
    fn write_after_finish_fails_task() {
        let mut bsm: BagStateMachine<&str, &str> = BagStateMachine::new(None);
        bsm.will_execute_request("exec");
        bsm.resume_request_body_stream();
        assert!(matches!(
            bsm.finish_request_body_stream(Ok(())),
            FinishAction::ForwardStreamFinished("exec", None)
        ));
        assert!(matches!(
            bsm.write_next_request_part(Bytes::from_static(b"late")),
            WriteAction::FailTask(Error::WriteAfterRequestSent)
        ));
    }
}
