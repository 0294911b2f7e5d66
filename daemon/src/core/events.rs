use super::{error::BlockchainError, trie::OverlayTrie};
use log::trace;
use neb_common::{crypto::Hash, event::Event};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};
use tokio::sync::mpsc;

pub type EventReceiver = mpsc::UnboundedReceiver<Arc<Event>>;

// In-memory publish/subscribe hub for chain events. Triggering is
// gated on block commit by the engine, so subscribers never observe
// events from rolled-back execution. Persistence of events lives in
// the per-block events trie, not here.
pub struct EventEmitter {
    subscribers: RwLock<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Arc<Event>>)>>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    pub fn new() -> Self {
        EventEmitter {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    // Register for one or more topics; the same receiver gets every
    // matching event. Returns the subscription id used to deregister.
    pub fn subscribe(&self, topics: &[&str]) -> (u64, EventReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self.subscribers.write().expect("emitter poisoned");
        for topic in topics {
            subscribers
                .entry((*topic).to_string())
                .or_default()
                .push((id, sender.clone()));
        }
        (id, receiver)
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subscribers = self.subscribers.write().expect("emitter poisoned");
        for entries in subscribers.values_mut() {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    // Publish one event to the subscribers of its topic. Closed
    // receivers are pruned lazily.
    pub fn trigger(&self, event: Event) {
        trace!("triggering event on topic {}", event.topic);
        let event = Arc::new(event);
        let mut subscribers = self.subscribers.write().expect("emitter poisoned");
        if let Some(entries) = subscribers.get_mut(&event.topic) {
            entries.retain(|(_, sender)| sender.send(Arc::clone(&event)).is_ok());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        EventEmitter::new()
    }
}

// Persist an event into the events trie. Keys are
// tx_hash || be_i64(index) with a 1-based index equal to the number of
// events already recorded under the transaction plus one.
pub fn record_event(
    trie: &mut OverlayTrie,
    tx_hash: &Hash,
    event: &Event,
) -> Result<(), BlockchainError> {
    let prior = trie.iterator(tx_hash.as_bytes())?.count() as i64;
    let index = prior + 1;

    let mut key = tx_hash.as_bytes().to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    trie.put(&key, serde_json::to_string(event)?.as_bytes())?;
    Ok(())
}

// All events recorded under a transaction, in insertion order
pub fn fetch_events(trie: &OverlayTrie, tx_hash: &Hash) -> Result<Vec<Event>, BlockchainError> {
    trie.iterator(tx_hash.as_bytes())?
        .map(|(_, value)| serde_json::from_slice(&value).map_err(Into::into))
        .collect()
}
