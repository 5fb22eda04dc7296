//! Event bus: typed one-way channels between network tasks and the presenter.
//!
//! ```text
//!  network tasks ──EventSender──────────────> PresentationBus.events  (joined/left/received/log)
//!  outbound pump <──outgoing (ChatPost)────── PresentationHandle::send(MessageToSend)
//!  every task    <──Shutdown (watch)───────── PresentationHandle::send(Shutdown)
//! ```

use std::sync::Arc;

use peerchat_core::{ChatPost, Event};
use tokio::sync::{mpsc, watch};

/// Build a bus. The network half goes to the registry/discovery, the presentation half to the presenter.
pub fn channel() -> (NetworkBus, PresentationBus) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trigger = ShutdownTrigger(Arc::new(shutdown_tx));
    let network = NetworkBus {
        events: EventSender(events_tx),
        outgoing: outgoing_rx,
        shutdown: Shutdown(shutdown_rx),
        trigger: trigger.clone(),
    };
    let presentation = PresentationBus {
        events: events_rx,
        handle: PresentationHandle {
            outgoing: outgoing_tx,
            shutdown: trigger,
        },
    };
    (network, presentation)
}

/// Network side of the bus.
pub struct NetworkBus {
    pub events: EventSender,
    pub outgoing: mpsc::UnboundedReceiver<ChatPost>,
    pub shutdown: Shutdown,
    pub trigger: ShutdownTrigger,
}

/// Presentation side of the bus.
pub struct PresentationBus {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub handle: PresentationHandle,
}

/// Emits network-to-presentation events. Sending never blocks; a gone presenter is ignored.
#[derive(Clone, Debug)]
pub struct EventSender(mpsc::UnboundedSender<Event>);

impl EventSender {
    pub fn emit(&self, event: Event) {
        debug_assert!(event.is_inbound(), "not a network event: {:?}", event);
        let _ = self.0.send(event);
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(Event::LogLine(line.into()));
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("network side of the bus is gone")]
    Closed,
    #[error("event {0:?} is not accepted from the presenter")]
    NotOutbound(Event),
}

/// What the presenter uses to talk to the network.
#[derive(Clone, Debug)]
pub struct PresentationHandle {
    outgoing: mpsc::UnboundedSender<ChatPost>,
    shutdown: ShutdownTrigger,
}

impl PresentationHandle {
    /// Accepts `MessageToSend` and `Shutdown`.
    pub fn send(&self, event: Event) -> Result<(), SendError> {
        match event {
            Event::MessageToSend(post) => self.outgoing.send(post).map_err(|_| SendError::Closed),
            Event::Shutdown => {
                self.shutdown.trigger();
                Ok(())
            }
            other => Err(SendError::NotOutbound(other)),
        }
    }
}

/// Fires the process-wide shutdown signal.
#[derive(Clone, Debug)]
pub struct ShutdownTrigger(Arc<watch::Sender<bool>>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

/// Observes the shutdown signal. Cloned into every long-running task.
#[derive(Clone, Debug)]
pub struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown has been triggered. Never resolves if the trigger is dropped unfired.
    pub async fn triggered(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
