//! one-shot completion handle used to implement upload backpressure.
//!
//! when [`crate::bsm::BagStateMachine`] pauses the request body producer it may hand back an
//! [`Ack`] that the producer awaits before writing its next part. fulfillment is observable by
//! exactly one awaiter, per the concurrency model: a channel with capacity one is the tightest
//! fit among the primitives the rest of the dependency graph reaches for (`tokio::sync::Notify`
//! is built for the multi-waiter case and would be the wrong tool here).

use tokio::sync::oneshot;

use crate::error::Error;

/// producer-side half of an [`Ack`]. awaiting it resolves once the bag-side state machine
/// fulfills or fails the outstanding pause.
#[derive(Debug)]
pub struct Ack(oneshot::Receiver<Result<(), Error>>);

impl Ack {
    /// wait for the ack to be fulfilled or failed.
    ///
    /// if the sending half was dropped without being fulfilled (the state machine was dropped
    /// mid-pause) this resolves as [`Error::RequestStreamCancelled`].
    pub async fn wait(self) -> Result<(), Error> {
        self.0.await.unwrap_or(Err(Error::RequestStreamCancelled))
    }
}

/// bag-side half of an [`Ack`]. the state machine holds this while a producer is paused and
/// consumes it (via [`AckSender::succeed`] or [`AckSender::fail`]) on any transition out of
/// `Paused`.
#[derive(Debug)]
pub struct AckSender(oneshot::Sender<Result<(), Error>>);

/// construct a fresh, unfulfilled ack pair.
pub fn pair() -> (AckSender, Ack) {
    let (tx, rx) = oneshot::channel();
    (AckSender(tx), Ack(rx))
}

/// construct an ack that is already fulfilled, for the "producer was never paused" fast path.
pub fn ready() -> Ack {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Ok(()));
    Ack(rx)
}

impl AckSender {
    /// let the paused producer proceed.
    pub fn succeed(self) {
        // a dropped receiver means the producer gave up waiting; nothing to do.
        let _ = self.0.send(Ok(()));
    }

    /// fail the paused producer's wait without failing the whole request.
    pub fn fail(self, err: Error) {
        let _ = self.0.send(Err(err));
    }
}
