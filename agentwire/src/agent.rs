//! Agent lifecycle: the [`Agent`] trait, the [`Task`] trait agents
//! implement, and [`spawn`], which wires a task's [`Port`] and hands back a
//! [`Handle`] to the rest of the process.

use crate::port::{self, Port};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;

/// Identifies an agent for tracing spans and log lines.
pub trait Agent: Port {
    /// Name used in tracing spans and diagnostics.
    const NAME: &'static str;
}

/// The work an agent performs for the lifetime of its task.
///
/// `run` owns `self` and the agent's [`port::Inner`] for as long as the
/// agent is alive; there is no other way to reach into agent state, which
/// is what keeps the process single-threaded-cooperative in spirit even
/// though each agent runs on its own tokio task.
pub trait Task: Port + Sized + Send + 'static {
    /// Error returned when the task exits abnormally.
    type Error: std::fmt::Debug + Send + 'static;

    /// Drives the agent until its port is closed or an unrecoverable error
    /// occurs.
    async fn run(self, port: port::Inner<Self>) -> Result<(), Self::Error>;
}

/// A handle to a running agent's [`Port`], held by the agent's owner.
pub type Handle<A> = port::Outer<A>;

/// Spawns `agent` onto its own tokio task and returns a [`Handle`] to its
/// port plus the task's [`JoinHandle`].
pub fn spawn<A>(agent: A) -> (Handle<A>, JoinHandle<Result<(), A::Error>>)
where
    A: Agent + Task,
{
    let (input_tx, input_rx) = mpsc::channel(A::INPUT_CAPACITY.max(1));
    let (output_tx, output_rx) = mpsc::channel(A::OUTPUT_CAPACITY.max(1));
    let inner = port::Inner::new(input_rx, output_tx);
    let task = async move {
        tracing::debug!("agent started");
        let result = agent.run(inner).await;
        match &result {
            Ok(()) => tracing::debug!("agent exited"),
            Err(err) => tracing::error!(?err, "agent exited with error"),
        }
        result
    }
    .instrument(tracing::info_span!("agent", name = A::NAME));
    let join = tokio::spawn(task);
    (port::Outer { input_tx, output_rx }, join)
}
