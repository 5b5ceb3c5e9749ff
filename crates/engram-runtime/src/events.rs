use tokio::sync::broadcast;

use engram_types::{BusEvent, Channel};

// NOTE: Bus Semantics
//
// - FIFO per channel, no ordering across channels
// - No replay: a subscriber that connects late starts from now; the REST
//   surface is the source of record
// - Publishers never block: a lagging subscriber drops the oldest events
//   (broadcast ring buffer), and the WebSocket layer turns sustained lag
//   into a disconnect

const CHANNEL_CAPACITY: usize = 256;

/// In-process publish/subscribe bus with one ring buffer per named channel.
#[derive(Clone)]
pub struct EventBus {
    daemon: broadcast::Sender<BusEvent>,
    analysis: broadcast::Sender<BusEvent>,
    node: broadcast::Sender<BusEvent>,
    queue: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            daemon: broadcast::channel(CHANNEL_CAPACITY).0,
            analysis: broadcast::channel(CHANNEL_CAPACITY).0,
            node: broadcast::channel(CHANNEL_CAPACITY).0,
            queue: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    fn sender(&self, channel: Channel) -> &broadcast::Sender<BusEvent> {
        match channel {
            Channel::Daemon => &self.daemon,
            Channel::Analysis => &self.analysis,
            Channel::Node => &self.node,
            Channel::Queue => &self.queue,
        }
    }

    /// Publish onto the event's channel. Send errors only mean "no
    /// subscribers", which is not a failure.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.sender(event.channel()).send(event);
    }

    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<BusEvent> {
        self.sender(channel).subscribe()
    }

    pub fn subscribe_all(&self) -> Vec<(Channel, broadcast::Receiver<BusEvent>)> {
        Channel::ALL
            .into_iter()
            .map(|c| (c, self.subscribe(c)))
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
