//! Listener interface
//!
//! The consumer side of a session. All lifecycle outcomes and input events
//! reach the application through this trait.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::report::Buttons;

/// Connection lifecycle reported to the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// The connection has been established
    Connected,
    /// The connection attempt failed
    Aborted,
    /// The connection ended normally
    Ended,
}

impl ConnectionState {
    /// Integer status code (0 connected, 1 aborted, 2 ended)
    pub fn code(self) -> i32 {
        match self {
            ConnectionState::Connected => 0,
            ConnectionState::Aborted => 1,
            ConnectionState::Ended => 2,
        }
    }
}

/// Receives session events.
///
/// Input callbacks run synchronously on the link's delivery thread while the
/// session state is locked. They must return quickly, must not block and
/// must not call back into the session that invoked them; a slow callback
/// stalls delivery of every later report.
pub trait Listener: Send + Sync {
    fn connection_changed(&self, state: ConnectionState);

    /// Button A went down (`true`) or up (`false`)
    fn button_a_changed(&self, pressed: bool);

    /// Button B went down (`true`) or up (`false`)
    fn button_b_changed(&self, pressed: bool);

    /// Fired for every button report, whether or not anything changed
    fn button_event(&self, previous: Buttons, current: Buttons);

    /// Calibrated accelerometer sample
    fn accelerometer_event(&self, _x: i32, _y: i32, _z: i32) {}
}

/// A listener callback as a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connection { state: ConnectionState },
    ButtonA { pressed: bool },
    ButtonB { pressed: bool },
    Buttons { previous: Buttons, current: Buttons },
    Accelerometer { x: i32, y: i32, z: i32 },
}

/// Forwards every callback into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Create a listener together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver dropped, discarding {:?}", event);
        }
    }
}

impl Listener for ChannelListener {
    fn connection_changed(&self, state: ConnectionState) {
        self.send(SessionEvent::Connection { state });
    }

    fn button_a_changed(&self, pressed: bool) {
        self.send(SessionEvent::ButtonA { pressed });
    }

    fn button_b_changed(&self, pressed: bool) {
        self.send(SessionEvent::ButtonB { pressed });
    }

    fn button_event(&self, previous: Buttons, current: Buttons) {
        self.send(SessionEvent::Buttons { previous, current });
    }

    fn accelerometer_event(&self, x: i32, y: i32, z: i32) {
        self.send(SessionEvent::Accelerometer { x, y, z });
    }
}
