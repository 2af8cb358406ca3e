//! Calculation graph on its own task
//!
//! Inputs arrive in batches over a bounded channel. The task applies every
//! batch that is ready, flushes once, then waits for more. It stops when
//! all senders are dropped or on the first error.

use strata_common::{Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::graph::{CalcGraph, GraphInput};
use crate::sequencer::DataplaneSink;

/// Default number of batches buffered ahead of the graph task
pub const DEFAULT_BATCH_CAPACITY: usize = 64;

/// Handle to a running graph task
pub struct AsyncCalcGraph {
    tx: mpsc::Sender<Vec<GraphInput>>,
    handle: JoinHandle<Result<()>>,
}

impl AsyncCalcGraph {
    /// Move `graph` onto a new task writing flushed messages to `sink`
    pub fn spawn<S>(graph: CalcGraph, sink: S, capacity: usize) -> Self
    where
        S: DataplaneSink + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run(graph, sink, rx));
        Self { tx, handle }
    }

    /// Another sender feeding the same graph
    pub fn sender(&self) -> mpsc::Sender<Vec<GraphInput>> {
        self.tx.clone()
    }

    /// Queue one batch of inputs
    pub async fn send(&self, batch: Vec<GraphInput>) -> Result<()> {
        self.tx
            .send(batch)
            .await
            .map_err(|_| Error::channel_closed("graph input"))
    }

    /// Close this handle's sender and wait for the task to finish
    ///
    /// The task only exits once every other sender has been dropped too.
    pub async fn shutdown(self) -> Result<()> {
        drop(self.tx);
        self.handle
            .await
            .map_err(|e| Error::internal_with_context("graph task", e.to_string()))?
    }
}

async fn run<S: DataplaneSink>(
    mut graph: CalcGraph,
    mut sink: S,
    mut rx: mpsc::Receiver<Vec<GraphInput>>,
) -> Result<()> {
    while let Some(batch) = rx.recv().await {
        let mut inputs = batch.len();
        apply_batch(&mut graph, batch)?;
        while let Ok(more) = rx.try_recv() {
            inputs += more.len();
            apply_batch(&mut graph, more)?;
        }
        let messages = graph.flush(&mut sink).inspect_err(|err| {
            error!(error = %err, "graph flush failed");
        })?;
        debug!(inputs, messages, "graph batch processed");
    }
    info!("graph inputs closed, stopping");
    Ok(())
}

fn apply_batch(graph: &mut CalcGraph, batch: Vec<GraphInput>) -> Result<()> {
    for input in batch {
        graph.apply(input)?;
    }
    Ok(())
}
