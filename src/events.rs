// Topic based fan-out of connection events to subscriber callbacks.

use derive_more::Display;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Everything the connection can notify callers about. Message lifecycle
/// events carry the handle as parameter; transfer events carry byte counts
/// or chunk indices.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageEvent {
    DeviceNotAvailable,
    TimedOutOnSend,
    SendError,
    ResponseReceived,
    ResponseTimedOut,
    ResponseErrorValid,
    ResponseErrorInvalid,
    ResponseErrorCrc,
    InterlockAlarmSet,
    UnexpectedRxChar,
    InterruptReceived,
    NoFastMemoryInterface,
    MemoryTransferNotIdle,
    MemoryTransferComplete,
    MemoryTransferError,
}

/// Optional second parameter delivered with an event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EventAux {
    #[default]
    None,
    /// A second integer, e.g. the second data word of a short interrupt.
    Word(i32),
    /// A raw byte vector, e.g. the payload of a long interrupt packet.
    Bytes(Vec<u8>),
}

/// What a subscriber receives on every trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventArgs {
    pub event: MessageEvent,
    pub param: i32,
    pub aux: EventAux,
}

/// Returned by [`EventBus::subscribe`]; identifies one registration.
///
/// Subscribing the same closure twice produces two tokens and two
/// registrations; unsubscribing one of them leaves the other in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventToken(usize);

type Handler = Arc<dyn Fn(&EventArgs) + Send + Sync>;

/// Subscription table and dispatcher.
///
/// `trigger` snapshots the subscriber list under the shared lock and invokes
/// the handlers after releasing it, so a handler may subscribe or
/// unsubscribe freely, including on the kind currently firing. Handlers run
/// on the publishing thread; long work belongs elsewhere.
#[derive(Default)]
pub struct EventBus {
    map: RwLock<HashMap<MessageEvent, Vec<(EventToken, Handler)>>>,
    next_token: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: MessageEvent, handler: F) -> EventToken
    where
        F: Fn(&EventArgs) + Send + Sync + 'static,
    {
        let token = EventToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut map = self.map.write().unwrap();
        map.entry(event)
            .or_default()
            .push((token, Arc::new(handler)));
        token
    }

    /// Removes one registration. Returns false when the token was not
    /// subscribed to this event.
    pub fn unsubscribe(&self, event: MessageEvent, token: EventToken) -> bool {
        let mut map = self.map.write().unwrap();
        if let Some(list) = map.get_mut(&event) {
            let before = list.len();
            list.retain(|(t, _)| *t != token);
            return list.len() != before;
        }
        false
    }

    pub fn subscriber_count(&self, event: MessageEvent) -> usize {
        let map = self.map.read().unwrap();
        map.get(&event).map_or(0, Vec::len)
    }

    pub fn trigger(&self, event: MessageEvent, param: i32) {
        self.dispatch(EventArgs {
            event,
            param,
            aux: EventAux::None,
        });
    }

    pub fn trigger_with(&self, event: MessageEvent, param: i32, aux: EventAux) {
        self.dispatch(EventArgs { event, param, aux });
    }

    fn dispatch(&self, args: EventArgs) {
        let snapshot: Vec<Handler> = {
            let map = self.map.read().unwrap();
            match map.get(&args.event) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };
        for handler in snapshot {
            handler(&args);
        }
    }
}
