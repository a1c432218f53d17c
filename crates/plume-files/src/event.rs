use crate::ids::FileId;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileEvent {
    /// A node was registered for the first time; `size` is the best estimate
    /// available at registration, for storage accounting.
    NewFile { size: i64 },
    /// User-observable state of the node behind this handle changed.
    Updated(FileId),
}

pub type FileEventReceiver = broadcast::Receiver<FileEvent>;

#[derive(Clone)]
pub struct FileEventBus {
    tx: broadcast::Sender<FileEvent>,
}

impl FileEventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> FileEventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: FileEvent) {
        let _ = self.tx.send(event);
    }
}
