//! HID device link
//!
//! Talks to a Wii Remote that the OS has already paired and exposed as a
//! HID device. Each open handle owns a reader thread: it is the only place
//! the `HidDevice` is touched, so control requests are queued to it and
//! written between reads.

use std::collections::HashSet;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hidapi::{DeviceInfo, HidApi, HidDevice};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::calibration::{Calibration, CALIBRATION_ADDRESS, CALIBRATION_LEN};
use crate::link::{BdAddr, DeviceLink, LinkError, ReportConsumer, ReportMode};
use crate::report::{tag, RawFrame, ACCELEROMETER_LEN, BUTTONS_LEN};

/// Nintendo vendor ID
pub const NINTENDO_VENDOR_ID: u16 = 0x057E;
/// Original Wii Remote product ID
pub const WIIMOTE_PRODUCT_ID: u16 = 0x0306;
/// Wii Remote Plus product ID
pub const WIIMOTE_PLUS_PRODUCT_ID: u16 = 0x0330;

/// Largest input report (report ID + 21 bytes)
pub const INPUT_REPORT_SIZE: usize = 22;

/// Output report IDs
pub mod output {
    pub const SET_REPORT_MODE: u8 = 0x12;
    pub const STATUS_REQUEST: u8 = 0x15;
    pub const READ_MEMORY: u8 = 0x17;
}

/// Input report IDs
pub mod input {
    pub const STATUS: u8 = 0x20;
    pub const READ_MEMORY: u8 = 0x21;
    pub const ACK: u8 = 0x22;
    pub const BUTTONS: u8 = 0x30;
    pub const BUTTONS_ACCEL: u8 = 0x31;
    pub const BUTTONS_ACCEL_IR: u8 = 0x33;
    pub const BUTTONS_ACCEL_EXT: u8 = 0x35;
}

const IR_LEN: usize = 12;
const EXTENSION_LEN: usize = 16;

/// Timing knobs for [`HidLink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidLinkConfig {
    /// Poll interval of the reader thread, in milliseconds
    pub read_timeout_ms: i32,
    /// How long to wait for the calibration block
    pub calibration_timeout: Duration,
}

impl Default for HidLinkConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 10,
            calibration_timeout: Duration::from_millis(500),
        }
    }
}

/// A Wii Remote visible to the HID layer
#[derive(Debug, Clone, Serialize)]
pub struct WiimoteInfo {
    pub product: String,
    pub product_id: u16,
    pub serial: Option<String>,
    pub address: Option<BdAddr>,
    pub path: String,
}

/// Reply to a memory read (input report 0x21)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryReply {
    pub offset: u16,
    pub error: u8,
    pub data: Vec<u8>,
}

struct OutputRequest {
    data: Vec<u8>,
    done: mpsc::Sender<Result<(), LinkError>>,
}

/// Identity used for exclusivity: the MAC when known, else the HID path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DeviceKey {
    Address(BdAddr),
    Path(CString),
}

/// A Wii Remote found during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    address: Option<BdAddr>,
    path: CString,
    product: String,
}

impl Candidate {
    fn from_info(info: &DeviceInfo) -> Self {
        Self {
            address: serial_address(info),
            path: info.path().to_owned(),
            product: info.product_string().unwrap_or("Wii Remote").to_string(),
        }
    }

    fn key(&self) -> DeviceKey {
        match self.address {
            Some(address) => DeviceKey::Address(address),
            None => DeviceKey::Path(self.path.clone()),
        }
    }
}

/// Pick the device to open for `address`.
///
/// `ANY` takes the first candidate not already open. A specific address
/// must match a candidate's MAC and must not be open.
fn select<'a>(
    address: &BdAddr,
    candidates: &'a [Candidate],
    open: &HashSet<DeviceKey>,
) -> Result<&'a Candidate, LinkError> {
    if address.is_any() {
        return candidates
            .iter()
            .find(|c| !open.contains(&c.key()))
            .ok_or(LinkError::NotFound);
    }

    if open.contains(&DeviceKey::Address(*address)) {
        return Err(LinkError::AddressInUse(*address));
    }

    candidates
        .iter()
        .find(|c| c.address == Some(*address))
        .ok_or(LinkError::NotFound)
}

/// Devices currently held open by one [`HidLink`]
#[derive(Debug, Default)]
struct OpenDevices {
    keys: HashSet<DeviceKey>,
}

impl OpenDevices {
    /// Select a device for `address` and mark it open
    fn claim(
        &mut self,
        address: &BdAddr,
        candidates: &[Candidate],
    ) -> Result<Candidate, LinkError> {
        let candidate = select(address, candidates, &self.keys)?.clone();
        self.keys.insert(candidate.key());
        Ok(candidate)
    }

    fn release(&mut self, key: &DeviceKey) {
        self.keys.remove(key);
    }
}

/// An open Wii Remote
pub struct HidHandle {
    address: BdAddr,
    key: DeviceKey,
    running: Arc<AtomicBool>,
    consumer: Arc<Mutex<Option<ReportConsumer>>>,
    requests: mpsc::Sender<OutputRequest>,
    memory_replies: mpsc::Receiver<MemoryReply>,
    reader: Option<JoinHandle<()>>,
}

impl HidHandle {
    pub fn address(&self) -> BdAddr {
        self.address
    }

    fn set_consumer(&self, consumer: ReportConsumer) -> Result<(), LinkError> {
        let mut slot = lock(&self.consumer);
        if slot.is_some() {
            return Err(LinkError::ConsumerAlreadySet);
        }
        *slot = Some(consumer);
        Ok(())
    }
}

impl Drop for HidHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// [`DeviceLink`] over `hidapi`
pub struct HidLink {
    api: Mutex<HidApi>,
    open_devices: Mutex<OpenDevices>,
    config: HidLinkConfig,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_wiimote(info: &DeviceInfo) -> bool {
    info.vendor_id() == NINTENDO_VENDOR_ID
        && matches!(
            info.product_id(),
            WIIMOTE_PRODUCT_ID | WIIMOTE_PLUS_PRODUCT_ID
        )
}

/// Bluetooth HID devices report their MAC address as serial number
fn serial_address(info: &DeviceInfo) -> Option<BdAddr> {
    info.serial_number().and_then(|s| s.parse().ok())
}

impl HidLink {
    pub fn new(config: HidLinkConfig) -> Result<Self, LinkError> {
        Ok(Self {
            api: Mutex::new(HidApi::new()?),
            open_devices: Mutex::new(OpenDevices::default()),
            config,
        })
    }

    /// List the Wii Remotes currently visible
    pub fn enumerate(&self) -> Result<Vec<WiimoteInfo>, LinkError> {
        let mut api = lock(&self.api);
        api.refresh_devices()?;

        Ok(api
            .device_list()
            .filter(|d| is_wiimote(d))
            .map(|d| WiimoteInfo {
                product: d.product_string().unwrap_or("Wii Remote").to_string(),
                product_id: d.product_id(),
                serial: d.serial_number().map(str::to_string),
                address: serial_address(d),
                path: d.path().to_string_lossy().into_owned(),
            })
            .collect())
    }

    /// Queue an output report on the reader thread and wait for the write
    fn request(&self, handle: &HidHandle, data: Vec<u8>) -> Result<(), LinkError> {
        let (done, result) = mpsc::channel();
        handle
            .requests
            .send(OutputRequest { data, done })
            .map_err(|_| LinkError::Closed)?;

        let wait = Duration::from_millis(self.config.read_timeout_ms.max(0) as u64)
            + self.config.calibration_timeout;
        result.recv_timeout(wait).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => LinkError::NoResponse,
            mpsc::RecvTimeoutError::Disconnected => LinkError::Closed,
        })?
    }
}

impl DeviceLink for HidLink {
    type Handle = HidHandle;

    fn open(&self, address: &BdAddr) -> Result<HidHandle, LinkError> {
        let (device, candidate) = {
            let mut api = lock(&self.api);
            api.refresh_devices()?;

            let candidates: Vec<Candidate> = api
                .device_list()
                .filter(|d| is_wiimote(d))
                .map(Candidate::from_info)
                .collect();
            let candidate = lock(&self.open_devices).claim(address, &candidates)?;

            info!(
                "Opening {} ({})",
                candidate.product,
                candidate.address.unwrap_or(*address)
            );

            match api.open_path(&candidate.path) {
                Ok(device) => (device, candidate),
                Err(e) => {
                    lock(&self.open_devices).release(&candidate.key());
                    return Err(e.into());
                }
            }
        };
        let resolved = candidate.address.unwrap_or(*address);
        let key = candidate.key();

        let running = Arc::new(AtomicBool::new(true));
        let consumer = Arc::new(Mutex::new(None));
        let (requests, request_rx) = mpsc::channel();
        let (reply_tx, memory_replies) = mpsc::channel();

        let reader = {
            let running = Arc::clone(&running);
            let consumer = Arc::clone(&consumer);
            let timeout_ms = self.config.read_timeout_ms;
            thread::Builder::new()
                .name(format!("wiimote-{}", resolved))
                .spawn(move || read_loop(device, running, consumer, request_rx, reply_tx, timeout_ms))
        };

        let reader = match reader {
            Ok(reader) => reader,
            Err(e) => {
                lock(&self.open_devices).release(&key);
                return Err(e.into());
            }
        };

        Ok(HidHandle {
            address: resolved,
            key,
            running,
            consumer,
            requests,
            memory_replies,
            reader: Some(reader),
        })
    }

    fn close(&self, mut handle: HidHandle) -> Result<(), LinkError> {
        handle.running.store(false, Ordering::SeqCst);
        lock(&handle.consumer).take();
        lock(&self.open_devices).release(&handle.key);

        if let Some(reader) = handle.reader.take() {
            if reader.join().is_err() {
                return Err(LinkError::Closed);
            }
        }

        debug!("Closed {}", handle.address);
        Ok(())
    }

    fn set_report_consumer(
        &self,
        handle: &HidHandle,
        consumer: ReportConsumer,
    ) -> Result<(), LinkError> {
        handle.set_consumer(consumer)
    }

    fn enable_message_interface(&self, handle: &HidHandle) -> Result<(), LinkError> {
        self.request(handle, vec![output::STATUS_REQUEST, 0x00])
    }

    fn set_report_mode(&self, handle: &HidHandle, mode: ReportMode) -> Result<(), LinkError> {
        self.request(handle, report_mode_request(mode))
    }

    fn query_calibration(&self, handle: &HidHandle) -> Result<Calibration, LinkError> {
        while handle.memory_replies.try_recv().is_ok() {}

        self.request(
            handle,
            read_memory_request(CALIBRATION_ADDRESS, CALIBRATION_LEN),
        )?;

        let reply = handle
            .memory_replies
            .recv_timeout(self.config.calibration_timeout)
            .map_err(|_| LinkError::NoResponse)?;

        if reply.error != 0 {
            return Err(LinkError::MalformedReply(format!(
                "memory read error {:#x}",
                reply.error
            )));
        }
        if reply.offset as u32 != CALIBRATION_ADDRESS & 0xFFFF {
            return Err(LinkError::MalformedReply(format!(
                "unexpected memory offset {:#06x}",
                reply.offset
            )));
        }

        Calibration::parse(&reply.data)
    }
}

fn read_loop(
    device: HidDevice,
    running: Arc<AtomicBool>,
    consumer: Arc<Mutex<Option<ReportConsumer>>>,
    requests: mpsc::Receiver<OutputRequest>,
    replies: mpsc::Sender<MemoryReply>,
    timeout_ms: i32,
) {
    let mut buf = [0u8; INPUT_REPORT_SIZE];

    while running.load(Ordering::SeqCst) {
        while let Ok(request) = requests.try_recv() {
            trace!("Writing output report {:02x?}", request.data);
            let result = device
                .write(&request.data)
                .map(|_| ())
                .map_err(LinkError::from);
            let _ = request.done.send(result);
        }

        let bytes_read = match device.read_timeout(&mut buf, timeout_ms) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                warn!("Wii Remote read failed, stopping delivery: {}", e);
                break;
            }
        };

        let (frames, memory) = demux(&buf[..bytes_read]);

        if let Some(reply) = memory {
            if replies.send(reply).is_err() {
                trace!("Memory reply dropped, nobody waiting");
            }
        }

        if frames.is_empty() {
            continue;
        }

        let current = lock(&consumer).clone();
        match current {
            Some(deliver) => deliver(&frames),
            None => trace!("No consumer, dropping {} frames", frames.len()),
        }
    }

    debug!("Reader thread stopped");
}

/// Split one input report into tagged frames.
///
/// A memory-read reply is returned separately so it can be routed to a
/// pending query.
pub fn demux(report: &[u8]) -> (Vec<RawFrame>, Option<MemoryReply>) {
    let Some((&id, body)) = report.split_first() else {
        return (Vec::new(), None);
    };

    let layout: &[(u8, usize)] = match id {
        input::STATUS => &[(tag::BUTTONS, BUTTONS_LEN), (tag::STATUS, 4)],
        input::READ_MEMORY | input::ACK | input::BUTTONS => &[(tag::BUTTONS, BUTTONS_LEN)],
        input::BUTTONS_ACCEL => &[
            (tag::BUTTONS, BUTTONS_LEN),
            (tag::ACCELEROMETER, ACCELEROMETER_LEN),
        ],
        input::BUTTONS_ACCEL_IR => &[
            (tag::BUTTONS, BUTTONS_LEN),
            (tag::ACCELEROMETER, ACCELEROMETER_LEN),
            (tag::IR, IR_LEN),
        ],
        input::BUTTONS_ACCEL_EXT => &[
            (tag::BUTTONS, BUTTONS_LEN),
            (tag::ACCELEROMETER, ACCELEROMETER_LEN),
            (tag::EXTENSION, EXTENSION_LEN),
        ],
        _ => &[],
    };

    let needed: usize = layout.iter().map(|(_, len)| len).sum();
    if layout.is_empty() || body.len() < needed {
        trace!("Unhandled input report {:#04x} ({} bytes)", id, report.len());
        return (vec![RawFrame::new(tag::UNKNOWN, report)], None);
    }

    let mut frames = Vec::with_capacity(layout.len());
    let mut offset = 0;
    for &(frame_tag, len) in layout {
        frames.push(RawFrame::new(frame_tag, &body[offset..offset + len]));
        offset += len;
    }

    let memory = (id == input::READ_MEMORY)
        .then(|| parse_memory_reply(&body[BUTTONS_LEN..]))
        .flatten();

    (frames, memory)
}

/// `[SE, AA, AA, data...]`: size-1 in the high nibble, error in the low one
fn parse_memory_reply(body: &[u8]) -> Option<MemoryReply> {
    let (&size_error, rest) = body.split_first()?;
    let offset = u16::from_be_bytes([*rest.first()?, *rest.get(1)?]);
    let size = (size_error >> 4) as usize + 1;
    let data = rest.get(2..2 + size)?.to_vec();

    Some(MemoryReply {
        offset,
        error: size_error & 0x0F,
        data,
    })
}

pub fn report_mode_request(mode: ReportMode) -> Vec<u8> {
    let id = if mode.accelerometer {
        input::BUTTONS_ACCEL
    } else {
        input::BUTTONS
    };
    vec![output::SET_REPORT_MODE, 0x00, id]
}

/// Read from EEPROM: 32-bit big-endian address, 16-bit big-endian size
pub fn read_memory_request(address: u32, len: u16) -> Vec<u8> {
    let mut request = vec![output::READ_MEMORY];
    request.extend_from_slice(&address.to_be_bytes());
    request.extend_from_slice(&len.to_be_bytes());
    request
}
