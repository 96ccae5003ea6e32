//! Packet traffic tracing for debugging.
//!
//! Disabled by default. `TRELLIS_TRAFFIC=log` records events in
//! memory, `TRELLIS_TRAFFIC=print` writes them to stdout as they
//! happen. The sink sits behind this one type so the session code can
//! log unconditionally.

use std::fmt;
use std::sync::Mutex;

use crate::address::Address;
use crate::packet::Packet;

/// Environment variable selecting the traffic sink.
pub const TRAFFIC_ENV: &str = "TRELLIS_TRAFFIC";

#[derive(Clone, Debug, PartialEq)]
pub enum TrafficEvent {
    Send { to: Address, destinations: usize },
    Recv { from: Address, destinations: usize },
    RelayOpened { to: Address },
    RelayClosed { to: Address },
}

impl fmt::Display for TrafficEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficEvent::Send { to, destinations } => {
                write!(f, "send to {} ({} destination-s)", to, destinations)
            }
            TrafficEvent::Recv { from, destinations } => {
                write!(f, "recv from {} ({} destination-s)", from, destinations)
            }
            TrafficEvent::RelayOpened { to } => write!(f, "relay opened to {}", to),
            TrafficEvent::RelayClosed { to } => write!(f, "relay closed to {}", to),
        }
    }
}

enum Sink {
    Disabled,
    Memory(Mutex<Vec<TrafficEvent>>),
    Stdout,
}

/// Per-node traffic watcher. Cheap no-op unless enabled.
pub struct Traffic {
    me: Address,
    sink: Sink,
}

impl Traffic {
    /// Builds the watcher selected by [`TRAFFIC_ENV`].
    pub fn from_env(me: Address) -> Self {
        let sink = match std::env::var(TRAFFIC_ENV).as_deref() {
            Ok("log") => Sink::Memory(Mutex::new(Vec::new())),
            Ok("print") => Sink::Stdout,
            _ => Sink::Disabled,
        };

        Self { me, sink }
    }

    pub fn log_send(&self, to: &Address, packet: &Packet) {
        self.record(TrafficEvent::Send {
            to: to.clone(),
            destinations: packet.destinations().len(),
        });
    }

    pub fn log_recv(&self, from: &Address, packet: &Packet) {
        self.record(TrafficEvent::Recv {
            from: from.clone(),
            destinations: packet.destinations().len(),
        });
    }

    pub fn log_relay(&self, to: &Address) {
        self.record(TrafficEvent::RelayOpened { to: to.clone() });
    }

    pub fn log_relay_closed(&self, to: &Address) {
        self.record(TrafficEvent::RelayClosed { to: to.clone() });
    }

    /// Events recorded so far, empty unless the memory sink is active.
    pub fn events(&self) -> Vec<TrafficEvent> {
        match &self.sink {
            Sink::Memory(events) => events.lock().expect("traffic log poisoned").clone(),
            _ => Vec::new(),
        }
    }

    fn record(&self, event: TrafficEvent) {
        match &self.sink {
            Sink::Disabled => {}
            Sink::Memory(events) => {
                events.lock().expect("traffic log poisoned").push(event);
            }
            Sink::Stdout => println!("[{}] {}", self.me, event),
        }
    }
}
