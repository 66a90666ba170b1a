//! The bounded, typed channel an agent communicates through.

use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::sync::mpsc;

/// Declares the message types and channel capacities for an agent.
///
/// Implemented on the agent's own state type, so `Self::Input`/`Self::Output`
/// read naturally alongside the agent's fields.
pub trait Port {
    /// Values sent into the agent.
    type Input: Send + 'static;
    /// Values the agent sends out.
    type Output: Send + 'static;
    /// Input channel capacity. `0` collapses to a capacity of one, so a
    /// disabled channel still behaves like a (rendezvous) channel rather
    /// than panicking on creation.
    const INPUT_CAPACITY: usize;
    /// Output channel capacity, see [`Port::INPUT_CAPACITY`].
    const OUTPUT_CAPACITY: usize;
}

/// A value received by the agent.
#[derive(Debug)]
pub struct Input<T> {
    /// The value itself.
    pub value: T,
}

impl<T> Input<T> {
    fn new(value: T) -> Self {
        Self { value }
    }
}

/// A value produced by the agent.
#[derive(Debug)]
pub struct Output<T> {
    /// The value itself.
    pub value: T,
}

impl<T> Output<T> {
    /// Wraps `value` for sending on the port.
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

/// The port's peer has been dropped.
#[derive(Debug, thiserror::Error)]
#[error("port is closed")]
pub struct SendError;

/// The agent-side half of a [`Port`]: an input stream and an output sink,
/// held by the running [`Task`](crate::agent::Task) for the life of the
/// agent.
#[derive(Debug)]
pub struct Inner<P: Port> {
    input_rx: mpsc::Receiver<Input<P::Input>>,
    output_tx: mpsc::Sender<Output<P::Output>>,
}

impl<P: Port> Inner<P> {
    pub(crate) fn new(
        input_rx: mpsc::Receiver<Input<P::Input>>,
        output_tx: mpsc::Sender<Output<P::Output>>,
    ) -> Self {
        Self { input_rx, output_tx }
    }

    /// Sends `output` to the agent's owner.
    ///
    /// # Errors
    ///
    /// Fails if the owner's [`Handle`](crate::agent::Handle) has been
    /// dropped.
    pub async fn send(&mut self, output: Output<P::Output>) -> Result<(), SendError> {
        self.output_tx.send(output).await.map_err(|_| SendError)
    }

    /// Receives the next input, or `None` once the owner's handle is
    /// dropped and no inputs remain queued.
    pub async fn next(&mut self) -> Option<Input<P::Input>> {
        self.input_rx.recv().await
    }
}

impl<P: Port> futures::Stream for Inner<P> {
    type Item = Input<P::Input>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.input_rx.poll_recv(cx)
    }
}

/// The owner-side half of a [`Port`], created by [`spawn`](crate::spawn).
#[derive(Debug)]
pub struct Outer<P: Port> {
    pub(crate) input_tx: mpsc::Sender<Input<P::Input>>,
    pub(crate) output_rx: mpsc::Receiver<Output<P::Output>>,
}

impl<P: Port> Outer<P> {
    /// Sends `value` to the agent.
    ///
    /// # Errors
    ///
    /// Fails if the agent has exited and dropped its port.
    pub async fn send(&self, value: P::Input) -> Result<(), SendError> {
        self.input_tx.send(Input::new(value)).await.map_err(|_| SendError)
    }

    /// Receives the next value the agent produced, or `None` once the agent
    /// has exited and its output side is drained.
    pub async fn recv(&mut self) -> Option<P::Output> {
        self.output_rx.recv().await.map(|output| output.value)
    }
}
