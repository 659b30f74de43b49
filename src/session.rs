//! Device session
//!
//! A [`Session`] owns at most one open link to a Wii Remote. It configures
//! the report stream on connect, receives frame batches on the link's
//! delivery thread, turns button snapshots into edge events, applies the
//! accelerometer calibration and forwards everything to a [`Listener`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::calibration::Calibration;
use crate::link::{BdAddr, DeviceLink, LinkError, ReportConsumer, ReportMode};
use crate::listener::{ConnectionState, Listener};
use crate::report::{decode_batch, Buttons, RawFrame, Report};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Wii Remote already connected")]
    AlreadyConnected,

    #[error("Wii Remote is not connected")]
    NotConnected,

    #[error("Unable to connect to Wii Remote: {0}")]
    LinkOpenFailed(#[source] LinkError),

    #[error("Unable to set report consumer: {0}")]
    ConsumerRegistrationFailed(#[source] LinkError),
}

/// Connection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Device to open; [`BdAddr::ANY`] takes the first available one
    pub address: BdAddr,
    /// Stream accelerometer reports in addition to buttons
    pub accelerometer: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: BdAddr::ANY,
            accelerometer: true,
        }
    }
}

impl SessionConfig {
    pub fn report_mode(&self) -> ReportMode {
        if self.accelerometer {
            ReportMode::BUTTONS_ACCELEROMETER
        } else {
            ReportMode::BUTTONS
        }
    }
}

/// Difference between two button snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ButtonDelta {
    pub previous: Buttons,
    pub current: Buttons,
}

impl ButtonDelta {
    pub fn new(previous: Buttons, current: Buttons) -> Self {
        Self { previous, current }
    }

    pub fn changed(&self) -> Buttons {
        self.current.changed(self.previous)
    }

    /// New state of `mask` if it toggled
    pub fn toggled(&self, mask: Buttons) -> Option<bool> {
        self.changed()
            .intersects(mask)
            .then(|| self.current.intersects(mask))
    }

    /// Per-button callbacks first, then the raw event
    pub fn dispatch(&self, listener: &dyn Listener) {
        if let Some(pressed) = self.toggled(Buttons::A) {
            listener.button_a_changed(pressed);
        }
        if let Some(pressed) = self.toggled(Buttons::B) {
            listener.button_b_changed(pressed);
        }
        listener.button_event(self.previous, self.current);
    }
}

/// State shared between the control path and the delivery thread
struct SessionState<H> {
    handle: Option<H>,
    opening: bool,
    listener: Option<Arc<dyn Listener>>,
    previous_buttons: Buttons,
    calibration: Calibration,
}

impl<H> SessionState<H> {
    fn new() -> Self {
        Self {
            handle: None,
            opening: false,
            listener: None,
            previous_buttons: Buttons::NONE,
            calibration: Calibration::default(),
        }
    }

    fn handle_batch(&mut self, frames: &[RawFrame]) {
        let Some(listener) = self.listener.clone() else {
            trace!("Dropping batch of {} frames, no listener", frames.len());
            return;
        };

        for report in decode_batch(frames) {
            match report {
                Report::Button { buttons } => {
                    ButtonDelta::new(self.previous_buttons, buttons).dispatch(listener.as_ref());
                    self.previous_buttons = buttons;
                }
                Report::Accelerometer { x, y, z } => {
                    let (x, y, z) = self.calibration.apply(x, y, z);
                    listener.accelerometer_event(x, y, z);
                }
                Report::Unknown { tag } => {
                    debug!("Unknown report (tag {:#04x}), skipped", tag);
                }
            }
        }
    }
}

fn lock<H>(state: &Mutex<SessionState<H>>) -> MutexGuard<'_, SessionState<H>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One logical Wii Remote connection
pub struct Session<L: DeviceLink> {
    link: Arc<L>,
    config: SessionConfig,
    state: Arc<Mutex<SessionState<L::Handle>>>,
    connecting: AtomicBool,
}

impl<L: DeviceLink> Session<L> {
    pub fn new(link: Arc<L>, config: SessionConfig) -> Self {
        Self {
            link,
            config,
            state: Arc::new(Mutex::new(SessionState::new())),
            connecting: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).handle.is_some()
    }

    /// Calibration in use, while connected
    pub fn calibration(&self) -> Option<Calibration> {
        let state = lock(&self.state);
        state.handle.as_ref().map(|_| state.calibration)
    }

    /// Last button snapshot, while connected
    pub fn previous_buttons(&self) -> Option<Buttons> {
        let state = lock(&self.state);
        state.handle.as_ref().map(|_| state.previous_buttons)
    }

    /// Open the link and start streaming reports to `listener`.
    ///
    /// The outcome is also reported through
    /// [`Listener::connection_changed`]: `Connected` on success, `Aborted`
    /// if the link cannot be set up. A call while already connected (or
    /// while another connect is in flight) is rejected without notifying
    /// anyone.
    pub fn connect(&self, listener: Arc<dyn Listener>) -> Result<(), SessionError> {
        {
            let mut state = lock(&self.state);
            if state.handle.is_some() || state.opening {
                warn!("Wii Remote already connected. Cannot connect.");
                return Err(SessionError::AlreadyConnected);
            }
            state.opening = true;
        }

        // The link is set up without holding the lock: the delivery thread
        // must stay free to answer the calibration query.
        let result = self.open_link();

        let mut state = lock(&self.state);
        state.opening = false;

        match result {
            Ok((handle, calibration)) => {
                state.handle = Some(handle);
                state.listener = Some(Arc::clone(&listener));
                state.previous_buttons = Buttons::NONE;
                state.calibration = calibration;

                info!("Connected to Wii Remote ({})", self.config.address);
                listener.connection_changed(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                drop(state);
                warn!("{}", e);
                listener.connection_changed(ConnectionState::Aborted);
                Err(e)
            }
        }
    }

    fn open_link(&self) -> Result<(L::Handle, Calibration), SessionError> {
        let handle = self
            .link
            .open(&self.config.address)
            .map_err(SessionError::LinkOpenFailed)?;

        if let Err(e) = self.link.set_report_consumer(&handle, self.report_consumer()) {
            if let Err(close_err) = self.link.close(handle) {
                warn!("Error closing link after failed setup: {}", close_err);
            }
            return Err(SessionError::ConsumerRegistrationFailed(e));
        }

        let calibration = Calibration::fetch(self.link.as_ref(), &handle);

        if let Err(e) = self.link.enable_message_interface(&handle) {
            warn!("Unable to enable message interface: {}", e);
        }

        let mode = self.config.report_mode();
        if let Err(e) = self.link.set_report_mode(&handle, mode) {
            warn!("Unable to set report mode {:?}: {}", mode, e);
        }

        Ok((handle, calibration))
    }

    /// Close the link.
    ///
    /// The listener receives `Ended` even if the underlying close fails; the
    /// failure is only logged. `Ended` is the last callback of the
    /// connection.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        let (handle, listener) = {
            let mut state = lock(&self.state);
            let Some(handle) = state.handle.take() else {
                warn!("Wii Remote is not connected. Cannot disconnect.");
                return Err(SessionError::NotConnected);
            };
            (handle, state.listener.take())
        };

        // Closing joins the delivery thread, which may be waiting on the lock
        if let Err(e) = self.link.close(handle) {
            warn!("Error on Wii Remote disconnect: {}", e);
        }

        if let Some(listener) = listener {
            listener.connection_changed(ConnectionState::Ended);
        }

        info!("Disconnected from Wii Remote ({})", self.config.address);
        Ok(())
    }

    /// Connect on a background thread.
    ///
    /// Returns `None` if an attempt started this way is still running.
    pub fn spawn_connect(
        self: &Arc<Self>,
        listener: Arc<dyn Listener>,
    ) -> Option<JoinHandle<Result<(), SessionError>>> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            debug!("Connection attempt already in progress");
            return None;
        }

        let session = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("wiimote-connect".to_string())
            .spawn(move || {
                let result = session.connect(listener);
                session.connecting.store(false, Ordering::SeqCst);
                result
            });

        match spawned {
            Ok(join) => Some(join),
            Err(e) => {
                warn!("Unable to spawn connection thread: {}", e);
                self.connecting.store(false, Ordering::SeqCst);
                None
            }
        }
    }

    fn report_consumer(&self) -> ReportConsumer {
        let state = Arc::downgrade(&self.state);
        Arc::new(move |frames: &[RawFrame]| {
            if let Some(state) = state.upgrade() {
                lock(&state).handle_batch(frames);
            }
        })
    }
}

impl<L: DeviceLink> Drop for Session<L> {
    fn drop(&mut self) {
        if self.is_connected() {
            debug!("Session dropped while connected, disconnecting");
            if let Err(e) = self.disconnect() {
                debug!("Disconnect on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::SessionEvent;
    use crate::report::tag;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[derive(Default)]
    struct MockState {
        consumer: Option<ReportConsumer>,
        next_handle: u32,
        open: Vec<u32>,
        closed: Vec<u32>,
        modes: Vec<ReportMode>,
        message_interface: usize,
    }

    /// Holds `open` until the test releases it
    struct OpenGate {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    #[derive(Default)]
    struct MockLink {
        fail_open: bool,
        fail_consumer: bool,
        fail_close: bool,
        calibration: Option<Calibration>,
        /// Delivered through the consumer while calibration is queried
        early_frames: Vec<RawFrame>,
        gate: Mutex<Option<OpenGate>>,
        state: Mutex<MockState>,
    }

    impl MockLink {
        fn deliver(&self, frames: &[RawFrame]) {
            let consumer = self.state.lock().unwrap().consumer.clone();
            if let Some(consumer) = consumer {
                consumer(frames);
            }
        }

        fn open_handles(&self) -> Vec<u32> {
            self.state.lock().unwrap().open.clone()
        }
    }

    impl DeviceLink for MockLink {
        type Handle = u32;

        fn open(&self, _address: &BdAddr) -> Result<u32, LinkError> {
            let gate = self.gate.lock().unwrap().take();
            if let Some(gate) = gate {
                gate.entered.send(()).unwrap();
                gate.release.recv().unwrap();
            }
            if self.fail_open {
                return Err(LinkError::NotFound);
            }
            let mut state = self.state.lock().unwrap();
            state.next_handle += 1;
            let handle = state.next_handle;
            state.open.push(handle);
            Ok(handle)
        }

        fn close(&self, handle: u32) -> Result<(), LinkError> {
            let mut state = self.state.lock().unwrap();
            state.consumer = None;
            state.open.retain(|h| *h != handle);
            state.closed.push(handle);
            if self.fail_close {
                return Err(LinkError::Closed);
            }
            Ok(())
        }

        fn set_report_consumer(
            &self,
            _handle: &u32,
            consumer: ReportConsumer,
        ) -> Result<(), LinkError> {
            if self.fail_consumer {
                return Err(LinkError::ConsumerAlreadySet);
            }
            self.state.lock().unwrap().consumer = Some(consumer);
            Ok(())
        }

        fn enable_message_interface(&self, _handle: &u32) -> Result<(), LinkError> {
            self.state.lock().unwrap().message_interface += 1;
            Ok(())
        }

        fn set_report_mode(&self, _handle: &u32, mode: ReportMode) -> Result<(), LinkError> {
            self.state.lock().unwrap().modes.push(mode);
            Ok(())
        }

        fn query_calibration(&self, _handle: &u32) -> Result<Calibration, LinkError> {
            if !self.early_frames.is_empty() {
                self.deliver(&self.early_frames);
            }
            self.calibration.ok_or(LinkError::NoResponse)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<SessionEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn push(&self, event: SessionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    impl Listener for Recorder {
        fn connection_changed(&self, state: ConnectionState) {
            self.push(SessionEvent::Connection { state });
        }

        fn button_a_changed(&self, pressed: bool) {
            self.push(SessionEvent::ButtonA { pressed });
        }

        fn button_b_changed(&self, pressed: bool) {
            self.push(SessionEvent::ButtonB { pressed });
        }

        fn button_event(&self, previous: Buttons, current: Buttons) {
            self.push(SessionEvent::Buttons { previous, current });
        }

        fn accelerometer_event(&self, x: i32, y: i32, z: i32) {
            self.push(SessionEvent::Accelerometer { x, y, z });
        }
    }

    fn connection(state: ConnectionState) -> SessionEvent {
        SessionEvent::Connection { state }
    }

    fn connected(link: MockLink) -> (Arc<MockLink>, Session<MockLink>, Arc<Recorder>) {
        let link = Arc::new(link);
        let session = Session::new(Arc::clone(&link), SessionConfig::default());
        let recorder = Arc::new(Recorder::default());
        session.connect(recorder.clone()).unwrap();
        assert_eq!(recorder.take(), vec![connection(ConnectionState::Connected)]);
        (link, session, recorder)
    }

    #[test]
    fn test_edge_detection_all_low_bit_pairs() {
        for p in 0u16..0x20 {
            for n in 0u16..0x20 {
                let recorder = Recorder::default();
                let previous = Buttons::from_bits(p | 0x1000);
                let current = Buttons::from_bits(n);
                ButtonDelta::new(previous, current).dispatch(&recorder);

                let mut expected = Vec::new();
                if (p ^ n) & 0x08 != 0 {
                    expected.push(SessionEvent::ButtonA {
                        pressed: n & 0x08 != 0,
                    });
                }
                if (p ^ n) & 0x04 != 0 {
                    expected.push(SessionEvent::ButtonB {
                        pressed: n & 0x04 != 0,
                    });
                }
                expected.push(SessionEvent::Buttons { previous, current });
                assert_eq!(recorder.take(), expected, "p={:#x} n={:#x}", p, n);
            }
        }
    }

    #[test]
    fn test_button_scenario() {
        let (link, session, recorder) = connected(MockLink::default());

        link.deliver(&[RawFrame::buttons(0x0008)]);
        assert_eq!(
            recorder.take(),
            vec![
                SessionEvent::ButtonA { pressed: true },
                SessionEvent::Buttons {
                    previous: Buttons::NONE,
                    current: Buttons::A
                },
            ]
        );
        assert_eq!(session.previous_buttons(), Some(Buttons::A));

        link.deliver(&[RawFrame::buttons(0x0000)]);
        assert_eq!(
            recorder.take(),
            vec![
                SessionEvent::ButtonA { pressed: false },
                SessionEvent::Buttons {
                    previous: Buttons::A,
                    current: Buttons::NONE
                },
            ]
        );

        session.disconnect().unwrap();
        assert_eq!(recorder.take(), vec![connection(ConnectionState::Ended)]);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_button_event_fires_without_change() {
        let (link, session, recorder) = connected(MockLink::default());

        link.deliver(&[RawFrame::buttons(0x0800)]);
        link.deliver(&[RawFrame::buttons(0x0800)]);
        let events = recorder.take();
        assert_eq!(
            events,
            vec![
                SessionEvent::Buttons {
                    previous: Buttons::NONE,
                    current: Buttons::UP
                },
                SessionEvent::Buttons {
                    previous: Buttons::UP,
                    current: Buttons::UP
                },
            ]
        );
        assert_eq!(session.previous_buttons(), Some(Buttons::UP));
    }

    #[test]
    fn test_accelerometer_default_calibration() {
        let (link, _session, recorder) = connected(MockLink::default());

        link.deliver(&[RawFrame::accelerometer(130, 124, 100)]);
        assert_eq!(
            recorder.take(),
            vec![SessionEvent::Accelerometer { x: 6, y: 0, z: -24 }]
        );
    }

    #[test]
    fn test_accelerometer_fetched_calibration() {
        let link = MockLink {
            calibration: Some(Calibration::new([128, 120, 150])),
            ..Default::default()
        };
        let (link, session, recorder) = connected(link);
        assert_eq!(session.calibration().unwrap().zero, [128, 120, 150]);

        link.deliver(&[RawFrame::accelerometer(130, 124, 100)]);
        assert_eq!(
            recorder.take(),
            vec![SessionEvent::Accelerometer { x: 2, y: 4, z: -50 }]
        );
    }

    #[test]
    fn test_unknown_report_does_not_halt_batch() {
        let (link, _session, recorder) = connected(MockLink::default());

        link.deliver(&[
            RawFrame::new(tag::IR, vec![0xFF; 12]),
            RawFrame::buttons(0x0004),
        ]);
        assert_eq!(
            recorder.take(),
            vec![
                SessionEvent::ButtonB { pressed: true },
                SessionEvent::Buttons {
                    previous: Buttons::NONE,
                    current: Buttons::B
                },
            ]
        );
    }

    #[test]
    fn test_mixed_batch_in_order() {
        let (link, _session, recorder) = connected(MockLink::default());

        link.deliver(&[
            RawFrame::buttons(0x0008),
            RawFrame::accelerometer(124, 124, 124),
        ]);
        assert_eq!(
            recorder.take(),
            vec![
                SessionEvent::ButtonA { pressed: true },
                SessionEvent::Buttons {
                    previous: Buttons::NONE,
                    current: Buttons::A
                },
                SessionEvent::Accelerometer { x: 0, y: 0, z: 0 },
            ]
        );
    }

    #[test]
    fn test_connect_twice_is_rejected() {
        let (link, session, recorder) = connected(MockLink::default());
        link.deliver(&[RawFrame::buttons(0x0008)]);
        recorder.take();

        let second = Arc::new(Recorder::default());
        let err = session.connect(second.clone()).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyConnected));
        assert!(second.take().is_empty());
        assert!(recorder.take().is_empty());

        assert_eq!(link.open_handles(), vec![1]);
        assert_eq!(session.previous_buttons(), Some(Buttons::A));

        // Still delivering to the first listener
        link.deliver(&[RawFrame::buttons(0x0008)]);
        assert_eq!(recorder.take().len(), 1);
    }

    #[test]
    fn test_disconnect_without_connect() {
        let link = Arc::new(MockLink::default());
        let session = Session::new(link, SessionConfig::default());
        let err = session.disconnect().unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[test]
    fn test_open_failure_aborts() {
        let link = Arc::new(MockLink {
            fail_open: true,
            ..Default::default()
        });
        let session = Session::new(Arc::clone(&link), SessionConfig::default());
        let recorder = Arc::new(Recorder::default());

        let err = session.connect(recorder.clone()).unwrap_err();
        assert!(matches!(err, SessionError::LinkOpenFailed(_)));
        assert_eq!(recorder.take(), vec![connection(ConnectionState::Aborted)]);
        assert!(!session.is_connected());

        assert!(matches!(
            session.disconnect(),
            Err(SessionError::NotConnected)
        ));
        assert!(recorder.take().is_empty());
        assert_eq!(Arc::strong_count(&recorder), 1);
    }

    #[test]
    fn test_consumer_failure_closes_link() {
        let link = Arc::new(MockLink {
            fail_consumer: true,
            ..Default::default()
        });
        let session = Session::new(Arc::clone(&link), SessionConfig::default());
        let recorder = Arc::new(Recorder::default());

        let err = session.connect(recorder.clone()).unwrap_err();
        assert!(matches!(err, SessionError::ConsumerRegistrationFailed(_)));
        assert_eq!(recorder.take(), vec![connection(ConnectionState::Aborted)]);
        assert!(link.open_handles().is_empty());
        assert_eq!(link.state.lock().unwrap().closed, vec![1]);
        assert_eq!(Arc::strong_count(&recorder), 1);
    }

    #[test]
    fn test_close_failure_still_ends() {
        let link = MockLink {
            fail_close: true,
            ..Default::default()
        };
        let (_link, session, recorder) = connected(link);

        session.disconnect().unwrap();
        assert_eq!(recorder.take(), vec![connection(ConnectionState::Ended)]);
        assert!(!session.is_connected());
        assert_eq!(Arc::strong_count(&recorder), 1);
    }

    #[test]
    fn test_reconnect_resets_previous_buttons() {
        let (link, session, recorder) = connected(MockLink::default());
        link.deliver(&[RawFrame::buttons(0x0008)]);
        session.disconnect().unwrap();
        recorder.take();

        session.connect(recorder.clone()).unwrap();
        assert_eq!(session.previous_buttons(), Some(Buttons::NONE));
        link.deliver(&[RawFrame::buttons(0x0008)]);
        assert_eq!(
            recorder.take(),
            vec![
                connection(ConnectionState::Connected),
                SessionEvent::ButtonA { pressed: true },
                SessionEvent::Buttons {
                    previous: Buttons::NONE,
                    current: Buttons::A
                },
            ]
        );
    }

    #[test]
    fn test_report_mode_and_message_interface() {
        let link = Arc::new(MockLink::default());
        let config = SessionConfig {
            accelerometer: false,
            ..Default::default()
        };
        let session = Session::new(Arc::clone(&link), config);
        session.connect(Arc::new(Recorder::default())).unwrap();

        let state = link.state.lock().unwrap();
        assert_eq!(state.modes, vec![ReportMode::BUTTONS]);
        assert_eq!(state.message_interface, 1);
    }

    #[test]
    fn test_batch_after_session_dropped() {
        let (link, session, recorder) = connected(MockLink::default());
        let consumer = link.state.lock().unwrap().consumer.clone().unwrap();
        drop(session);
        assert_eq!(recorder.take(), vec![connection(ConnectionState::Ended)]);

        consumer(&[RawFrame::buttons(0x0008)]);
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_drop_with_close_failure_ends() {
        let link = MockLink {
            fail_close: true,
            ..Default::default()
        };
        let (link, session, recorder) = connected(link);
        drop(session);

        assert_eq!(recorder.take(), vec![connection(ConnectionState::Ended)]);
        assert_eq!(link.state.lock().unwrap().closed, vec![1]);
    }

    #[test]
    fn test_spawn_connect() {
        let link = Arc::new(MockLink::default());
        let session = Arc::new(Session::new(Arc::clone(&link), SessionConfig::default()));
        let recorder = Arc::new(Recorder::default());

        let join = session.spawn_connect(recorder.clone()).unwrap();
        join.join().unwrap().unwrap();
        assert!(session.is_connected());
        assert_eq!(recorder.take(), vec![connection(ConnectionState::Connected)]);

        let join = session.spawn_connect(recorder.clone()).unwrap();
        assert!(matches!(
            join.join().unwrap(),
            Err(SessionError::AlreadyConnected)
        ));
    }

    #[test]
    fn test_batches_during_connect_are_dropped() {
        let link = MockLink {
            early_frames: vec![RawFrame::buttons(0x0008)],
            ..Default::default()
        };
        let (link, session, recorder) = connected(link);

        // The early press never reached the listener nor the button state
        assert_eq!(session.previous_buttons(), Some(Buttons::NONE));
        link.deliver(&[RawFrame::buttons(0x0008)]);
        assert_eq!(
            recorder.take(),
            vec![
                SessionEvent::ButtonA { pressed: true },
                SessionEvent::Buttons {
                    previous: Buttons::NONE,
                    current: Buttons::A
                },
            ]
        );
    }

    #[test]
    fn test_ended_is_last_while_delivering() {
        for _ in 0..50 {
            let (link, session, recorder) = connected(MockLink::default());
            let stop = Arc::new(AtomicBool::new(false));
            let delivered = Arc::new(AtomicUsize::new(0));

            let delivery = {
                let link = Arc::clone(&link);
                let stop = Arc::clone(&stop);
                let delivered = Arc::clone(&delivered);
                thread::spawn(move || {
                    let mut bits = 0x0008;
                    while !stop.load(Ordering::SeqCst) {
                        link.deliver(&[RawFrame::buttons(bits)]);
                        bits ^= 0x0008;
                        delivered.fetch_add(1, Ordering::SeqCst);
                    }
                })
            };

            while delivered.load(Ordering::SeqCst) < 5 {
                thread::yield_now();
            }
            session.disconnect().unwrap();
            stop.store(true, Ordering::SeqCst);
            delivery.join().unwrap();

            let events = recorder.take();
            assert_eq!(events.last(), Some(&connection(ConnectionState::Ended)));
            let lifecycle = events
                .iter()
                .filter(|e| matches!(e, SessionEvent::Connection { .. }))
                .count();
            assert_eq!(lifecycle, 1);
        }
    }

    #[test]
    fn test_connect_while_opening() {
        let (entered_tx, entered) = mpsc::channel();
        let (release, release_rx) = mpsc::channel();
        let link = Arc::new(MockLink {
            gate: Mutex::new(Some(OpenGate {
                entered: entered_tx,
                release: release_rx,
            })),
            ..Default::default()
        });
        let session = Arc::new(Session::new(Arc::clone(&link), SessionConfig::default()));
        let recorder = Arc::new(Recorder::default());

        let join = session.spawn_connect(recorder.clone()).unwrap();
        entered.recv().unwrap();

        assert!(session.spawn_connect(recorder.clone()).is_none());

        let other = Arc::new(Recorder::default());
        let err = session.connect(other.clone()).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyConnected));
        assert!(other.take().is_empty());
        assert!(recorder.take().is_empty());
        assert!(!session.is_connected());

        release.send(()).unwrap();
        join.join().unwrap().unwrap();
        assert_eq!(recorder.take(), vec![connection(ConnectionState::Connected)]);
        assert_eq!(link.open_handles(), vec![1]);
    }
}
