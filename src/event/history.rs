use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
    sync::RwLock,
};

use crate::{
    error::Result,
    util::sync::{read, write},
    Address,
};

use super::HeapEvent;

/// Every heap event seen this session, in completion order. Nothing is ever
/// removed: freed chunks stay here so that a dangling address can still be
/// attributed to the allocations it once belonged to.
#[derive(Debug, Default)]
pub struct EventLog {
    events: RwLock<Vec<HeapEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: HeapEvent) {
        write(&self.events).push(event);
    }

    pub fn len(&self) -> usize {
        read(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All chunk-creating events whose `[chunk_start, chunk_end]` contains
    /// `address`, oldest first. O(number of events).
    pub fn chunks_containing(&self, address: Address) -> Vec<HeapEvent> {
        read(&self.events)
            .iter()
            .filter(|event| event.kind.creates_chunk() && event.contains(address))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> Vec<HeapEvent> {
        read(&self.events).clone()
    }

    pub fn write_json<P>(&self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let mut file = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut file, &*read(&self.events))?;
        file.flush()?;
        Ok(())
    }

    pub fn read_json<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let file = BufReader::new(File::open(path)?);
        let events: Vec<HeapEvent> = serde_json::from_reader(file)?;
        Ok(Self {
            events: RwLock::new(events),
        })
    }
}
