use super::peer::PeerId;
use bytes::Bytes;
use log::{debug, trace};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};
use tokio::sync::{broadcast, mpsc};

// An application-level message lifted off a peer stream, routed to
// subscribers by its message name.
#[derive(Debug)]
pub struct Message {
    pub name: String,
    pub sender: PeerId,
    pub data: Bytes,
}

impl Message {
    pub fn new(name: impl Into<String>, sender: PeerId, data: Bytes) -> Self {
        Message {
            name: name.into(),
            sender,
            data,
        }
    }
}

pub type MessageReceiver = mpsc::UnboundedReceiver<Arc<Message>>;

// Routes inbound messages to registered subscribers. Delivery within a
// topic is FIFO with respect to arrival; cross-topic ordering follows
// the single delivery queue.
pub struct Dispatcher {
    subscribers: RwLock<HashMap<String, Vec<(u64, mpsc::UnboundedSender<Arc<Message>>)>>>,
    queue_tx: mpsc::UnboundedSender<Arc<Message>>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Message>>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Dispatcher {
            subscribers: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            next_id: AtomicU64::new(1),
        }
    }

    // Register a subscriber for the given message names
    pub fn register(&self, topics: &[&str]) -> (u64, MessageReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subscribers = self.subscribers.write().expect("dispatcher poisoned");
        for topic in topics {
            subscribers
                .entry((*topic).to_string())
                .or_default()
                .push((id, sender.clone()));
        }
        (id, receiver)
    }

    pub fn deregister(&self, id: u64) {
        let mut subscribers = self.subscribers.write().expect("dispatcher poisoned");
        for entries in subscribers.values_mut() {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    // Enqueue a message for delivery
    pub fn put_message(&self, message: Message) {
        trace!("dispatching {} from {}", message.name, message.sender);
        let _ = self.queue_tx.send(Arc::new(message));
    }

    // Spawn the delivery worker; it drains the queue until shutdown
    pub fn start(self: &Arc<Self>, mut quit: broadcast::Receiver<()>) {
        let dispatcher = Arc::clone(self);
        let mut queue_rx = dispatcher
            .queue_rx
            .lock()
            .expect("dispatcher poisoned")
            .take()
            .expect("dispatcher already started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = quit.recv() => {
                        debug!("dispatcher exiting");
                        return;
                    }
                    maybe = queue_rx.recv() => {
                        let Some(message) = maybe else { return };
                        dispatcher.deliver(message);
                    }
                }
            }
        });
    }

    fn deliver(&self, message: Arc<Message>) {
        let mut subscribers = self.subscribers.write().expect("dispatcher poisoned");
        if let Some(entries) = subscribers.get_mut(&message.name) {
            entries.retain(|(_, sender)| sender.send(Arc::clone(&message)).is_ok());
        } else {
            debug!("no subscriber for message {}", message.name);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn test_delivery_is_fifo_per_topic() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (quit_tx, _) = broadcast::channel(1);
        dispatcher.start(quit_tx.subscribe());

        let (_id, mut receiver) = dispatcher.register(&["newblock"]);
        for i in 0..10u8 {
            dispatcher.put_message(Message::new(
                "newblock",
                "peer".to_string(),
                Bytes::from(vec![i]),
            ));
        }

        for i in 0..10u8 {
            let message = timeout(Duration::from_secs(1), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(message.data[0], i);
        }
    }

    #[tokio::test]
    async fn test_only_matching_topic_is_delivered() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (quit_tx, _) = broadcast::channel(1);
        dispatcher.start(quit_tx.subscribe());

        let (_blocks, mut blocks_rx) = dispatcher.register(&["newblock"]);
        let (txs_id, mut txs_rx) = dispatcher.register(&["newtx"]);

        dispatcher.put_message(Message::new("newtx", "peer".to_string(), Bytes::new()));
        let got = timeout(Duration::from_secs(1), txs_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.name, "newtx");
        assert!(blocks_rx.try_recv().is_err());

        // deregistered subscribers stop receiving
        dispatcher.deregister(txs_id);
        dispatcher.put_message(Message::new("newtx", "peer".to_string(), Bytes::new()));
        sleep(Duration::from_millis(50)).await;
        assert!(txs_rx.try_recv().is_err());
    }
}
