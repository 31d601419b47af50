use std::sync::Weak;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use super::Engine;
use crate::error::DbResult;
use crate::record::TableId;

/// A page range due for a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeTask {
    pub table: TableId,
    pub range: u32,
}

pub(crate) enum MergeMessage {
    Merge(MergeTask),
    /// Answered once every earlier message has been handled
    Barrier(Sender<()>),
    Shutdown,
}

/// Dedicated thread running merges queued at commit time
pub(crate) struct MergeWorker {
    sender: Sender<MergeMessage>,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    pub fn spawn(engine: Weak<Engine>) -> DbResult<Self> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("lstore-merge".to_string())
            .spawn(move || run(engine, receiver))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> Sender<MergeMessage> {
        self.sender.clone()
    }

    /// Stop after the queued messages and wait for the thread
    pub fn shutdown(mut self) {
        let _ = self.sender.send(MergeMessage::Shutdown);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("merge worker panicked");
        }
    }
}

fn run(engine: Weak<Engine>, receiver: Receiver<MergeMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            MergeMessage::Merge(task) => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.run_merge(task);
            }
            MergeMessage::Barrier(done) => {
                let _ = done.send(());
            }
            MergeMessage::Shutdown => break,
        }
    }
    tracing::debug!("merge worker stopped");
}
