//! # Bus Manager
//!
//! Owns the set of live bus devices: opening them from user
//! specifications or auto detection, funneling their telegrams through
//! duplicate suppression into the registered listener, supervising
//! their health (dead device removal, scheduled resets, protocol error
//! escalation, inactivity alarms) and draining the outbound send queue.
//!
//! Two locks guard the shared state: the device list and the send
//! queue. Public operations take at most one of them at a time. The
//! device list lock also serializes the supervision tick with framer
//! callbacks, which keeps per-device state single-writer.

use crate::activity::ActivityWindow;
use crate::alarm::{Alarm, AlarmDispatcher, AlarmSink};
use crate::devices::detect::{
    detect_device_on_tty, detect_device_with_command, detect_device_with_file, Detected,
};
use crate::devices::spec::{SendBusContent, SpecifiedDevice};
use crate::devices::{create_framer, BusDeviceFramer, ContentStartsWith, DeviceType, FramedTelegram};
use crate::error::GatewayError;
use crate::linkmode::LinkModeSet;
use crate::serial::{SerialManager, SerialPort};
use crate::telegram::{About, ParserContext};
use crate::util::hex::decode_hex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Callback invoked for every telegram that passes deduplication.
/// Returns true when some meter driver handled the telegram.
pub type TelegramListener = Arc<dyn Fn(&About, &[u8]) -> bool + Send + Sync>;

/// Static gateway configuration for the bus manager.
#[derive(Clone)]
pub struct BusManagerConfig {
    pub use_auto_device_detect: bool,
    pub auto_device_linkmodes: LinkModeSet,
    pub default_device_linkmodes: LinkModeSet,
    /// Preemptive reset period; 23 hours keeps the reset wandering
    /// around the clock instead of hitting the same minute every day.
    pub reset_interval: Duration,
    /// Inactivity alarm timeout; zero disables the alarm.
    pub alarm_timeout: Duration,
    pub alarm_expected_activity: ActivityWindow,
    /// Stop the serial manager when the last device disappears.
    pub exit_on_no_devices: bool,
    pub ignore_duplicate_telegrams: bool,
    /// Ttys that must never be probed.
    pub do_not_probe_ttys: HashSet<String>,
}

impl Default for BusManagerConfig {
    fn default() -> Self {
        BusManagerConfig {
            use_auto_device_detect: false,
            auto_device_linkmodes: LinkModeSet::empty(),
            default_device_linkmodes: LinkModeSet::T1,
            reset_interval: Duration::from_secs(23 * 3600),
            alarm_timeout: Duration::ZERO,
            alarm_expected_activity: ActivityWindow::always(),
            exit_on_no_devices: false,
            ignore_duplicate_telegrams: true,
            do_not_probe_ttys: HashSet::new(),
        }
    }
}

/// How many protocol errors force a device reset.
const PROTOCOL_ERROR_LIMIT: u32 = 20;

/// Settle time between closing and reopening a dongle during reset.
const RESET_SETTLE: Duration = Duration::from_secs(3);

/// One live, opened bus device: framer plus serial handle plus
/// supervision state. Owned exclusively by the bus manager.
pub struct BusDevice {
    pub bus_alias: String,
    pub device_type: DeviceType,
    /// File, tty or command string this device runs on.
    pub device_name: String,
    pub device_id: String,
    framer: Box<dyn BusDeviceFramer>,
    serial: Box<dyn SerialPort>,
    pub link_modes: LinkModeSet,
    link_modes_configured: bool,
    last_received: Instant,
    last_reset: Instant,
    reset_interval: Duration,
    timeout: Duration,
    expected_activity: ActivityWindow,
    protocol_error_count: u32,
}

impl BusDevice {
    /// Human readable identity for logs.
    pub fn hr(&self) -> String {
        let mut s = format!("{}:{}", self.device_name, self.device_type.name());
        if !self.device_id.is_empty() {
            s.push_str(&format!("[{}]", self.device_id));
        }
        s
    }

    pub fn is_working(&self) -> bool {
        self.serial.is_working()
    }

    pub fn protocol_error_detected(&mut self) {
        self.protocol_error_count += 1;
    }

    /// Run inbound bytes through the framer, refreshing the activity
    /// clock when telegrams emerge.
    fn handle_bytes(&mut self, data: &[u8]) -> Vec<FramedTelegram> {
        let frames = self.framer.on_bytes(data);
        if !frames.is_empty() {
            self.last_received = Instant::now();
        }
        frames
    }

    async fn apply_link_modes(&mut self) -> Result<(), GatewayError> {
        if let Some(cmd) = self.framer.link_modes_command(self.link_modes) {
            self.serial.write_all(&cmd).await?;
        }
        Ok(())
    }

    pub async fn set_link_modes(&mut self, lms: LinkModeSet) -> Result<(), GatewayError> {
        self.link_modes = lms;
        self.link_modes_configured = true;
        self.apply_link_modes().await
    }

    pub async fn close(&mut self) {
        self.framer.clear();
        self.serial.close().await;
    }

    /// Close, give the dongle a moment to settle, reopen and restore
    /// the configured link modes.
    pub async fn reset(&mut self) -> Result<(), GatewayError> {
        self.last_reset = Instant::now();
        log::info!("(bus) resetting {}", self.hr());

        if self.serial.is_open() {
            self.serial.close().await;
            tokio::time::sleep(RESET_SETTLE).await;
        }
        self.framer.clear();
        self.serial.open().await?;

        if let Some(cmd) = self.framer.reset_command() {
            self.serial.write_all(&cmd).await?;
        }
        if self.link_modes_configured {
            self.apply_link_modes().await?;
        }
        Ok(())
    }

    pub async fn send_telegram(
        &mut self,
        starts_with: ContentStartsWith,
        content: &[u8],
    ) -> Result<(), GatewayError> {
        let wire = self.framer.send_telegram(starts_with, content)?;
        self.serial.write_all(&wire).await
    }

    /// Periodic health check: scheduled reset, protocol error
    /// escalation, inactivity alarm. Returns false when the failure is
    /// fatal and the serial manager should stop.
    async fn check_status(&mut self, alarms: &AlarmDispatcher) -> bool {
        let now = Instant::now();

        // Scheduled preemptive reset, skipped while data is pending.
        if self.reset_interval > Duration::from_secs(1)
            && now.duration_since(self.last_reset) > self.reset_interval
            && !self.serial.data_pending()
            && !self.serial.is_readonly()
        {
            log::debug!("(bus) regular reset of {}", self.hr());
            if self.reset().await.is_ok() {
                return true;
            }
            alarms.log_alarm(
                Alarm::RegularResetFailure,
                &self.hr(),
                &format!("failed regular reset of {}", self.hr()),
            );
            return true;
        }

        if self.protocol_error_count >= PROTOCOL_ERROR_LIMIT {
            alarms.log_alarm(
                Alarm::DeviceFailure,
                &self.hr(),
                &format!(
                    "too many protocol errors ({}) resetting {}",
                    self.protocol_error_count,
                    self.hr()
                ),
            );
            if self.reset().await.is_ok() {
                self.protocol_error_count = 0;
                return true;
            }
            alarms.log_alarm(
                Alarm::DeviceFailure,
                &self.hr(),
                &format!("failed to reset {}, giving up", self.hr()),
            );
            return false;
        }

        if self.timeout.is_zero() {
            return true;
        }
        let since = now.duration_since(self.last_received);
        if since < self.timeout {
            return true;
        }
        // Rearm so the alarm repeats at most once per timeout period.
        self.last_received = now;

        // Only alarm when the whole timeout window was inside expected
        // activity; otherwise the silence is planned.
        let now_local = chrono::Local::now();
        let then_local = now_local
            - chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::zero());
        if !(self.expected_activity.contains(now_local)
            && self.expected_activity.contains(then_local))
        {
            return true;
        }

        alarms.log_alarm(
            Alarm::DeviceInactivity,
            &self.hr(),
            &format!(
                "{} seconds of inactivity resetting {} (timeout {}s expected {})",
                since.as_secs(),
                self.hr(),
                self.timeout.as_secs(),
                self.expected_activity.pattern()
            ),
        );
        if self.reset().await.is_ok() {
            return true;
        }
        alarms.log_alarm(
            Alarm::DeviceFailure,
            &self.hr(),
            &format!("failed to reset {}, giving up", self.hr()),
        );
        false
    }
}

/// A user specification plus its runtime matching state.
struct SpecifiedState {
    spec: SpecifiedDevice,
    handled: bool,
}

#[derive(Default)]
struct ScanState {
    /// Ttys probed and found not to be wmbus dongles.
    not_serial_wmbus_devices: HashSet<String>,
    /// Rtl-sdr serial numbers that could not be claimed.
    not_swradio_devices: HashSet<String>,
    warned_missing_binaries: bool,
}

/// The bus manager. See the module documentation.
pub struct BusManager {
    config: BusManagerConfig,
    serial_manager: Arc<dyn SerialManager>,
    alarms: AlarmDispatcher,
    devices: Mutex<Vec<BusDevice>>,
    send_queue: StdMutex<VecDeque<SendBusContent>>,
    parser_ctx: StdMutex<ParserContext>,
    listener: StdMutex<Option<TelegramListener>>,
    specified: StdMutex<Vec<SpecifiedState>>,
    scan: StdMutex<ScanState>,
    printed_no_device_warning: AtomicBool,
}

impl BusManager {
    pub fn new(
        config: BusManagerConfig,
        serial_manager: Arc<dyn SerialManager>,
        alarm_sink: Arc<dyn AlarmSink>,
    ) -> Self {
        let mut parser_ctx = ParserContext::new();
        parser_ctx.ignore_duplicate_telegrams = config.ignore_duplicate_telegrams;
        BusManager {
            config,
            serial_manager,
            alarms: AlarmDispatcher::new(alarm_sink),
            devices: Mutex::new(Vec::new()),
            send_queue: StdMutex::new(VecDeque::new()),
            parser_ctx: StdMutex::new(parser_ctx),
            listener: StdMutex::new(None),
            specified: StdMutex::new(Vec::new()),
            scan: StdMutex::new(ScanState::default()),
            printed_no_device_warning: AtomicBool::new(false),
        }
    }

    /// Register the telegram listener all devices feed into.
    pub fn on_telegram(&self, listener: TelegramListener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Declare the user-specified devices (from configuration).
    pub fn set_specified_devices(&self, specs: Vec<SpecifiedDevice>) {
        let mut specified = self.specified.lock().unwrap();
        *specified = specs
            .into_iter()
            .map(|spec| SpecifiedState {
                spec,
                handled: false,
            })
            .collect();
    }

    /// Shared parser context: dedup FIFO, warning throttle, compact
    /// format cache. Telegram parsing borrows it through this lock.
    pub fn parser_context(&self) -> &StdMutex<ParserContext> {
        &self.parser_ctx
    }

    pub async fn device_count(&self) -> usize {
        self.devices.lock().await.len()
    }

    pub async fn remove_all_bus_devices(&self) {
        let mut devices = self.devices.lock().await;
        for dev in devices.iter_mut() {
            dev.close().await;
        }
        devices.clear();
    }

    /// Open a detected device and add it to the live set.
    pub async fn open_bus_device(&self, detected: Detected) -> Result<(), GatewayError> {
        if detected.found_type == DeviceType::Unknown {
            log::debug!("(bus) ignoring unknown device {}", detected.hr());
            return Ok(());
        }

        let spec = &detected.specified_device;
        let mut lms = spec.linkmodes;
        if lms.is_empty() {
            lms = if self.config.use_auto_device_detect {
                self.config.auto_device_linkmodes
            } else {
                LinkModeSet::empty()
            };
            if lms.is_empty() {
                lms = self.config.default_device_linkmodes;
            }
        }

        let device_name = if !detected.found_file.is_empty() {
            detected.found_file.clone()
        } else {
            format!("CMD({})", spec.command)
        };

        let mut serial = self.serial_manager.create_port(&device_name);
        serial.open().await?;
        if let Some(baud) = spec.baud {
            serial.set_baud_rate(baud).await?;
        } else {
            serial.set_baud_rate(detected.found_type.default_baud()).await?;
        }

        let framer = create_framer(detected.found_type, &device_name);
        let mut dev = BusDevice {
            bus_alias: spec.bus_alias.clone(),
            device_type: detected.found_type,
            device_name: device_name.clone(),
            device_id: detected.found_device_id.clone(),
            framer,
            serial,
            link_modes: LinkModeSet::empty(),
            link_modes_configured: false,
            last_received: Instant::now(),
            last_reset: Instant::now(),
            reset_interval: self.config.reset_interval,
            timeout: self.config.alarm_timeout,
            expected_activity: self.config.alarm_expected_activity.clone(),
            protocol_error_count: 0,
        };

        if dev.framer.can_set_link_modes(lms) {
            dev.set_link_modes(lms).await?;
        } else if !lms.is_empty() && detected.found_type != DeviceType::MBus {
            log::warn!(
                "(bus) desired link modes {} cannot be set for {}",
                lms.hr(),
                dev.hr()
            );
        }

        log::info!("(bus) started {} listening on {}", dev.hr(), dev.link_modes.hr());

        self.devices.lock().await.push(dev);
        self.printed_no_device_warning.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Feed raw bytes from the serial event loop into the device that
    /// owns `device_name`. Emerging telegrams pass deduplication and
    /// reach the registered listener in order.
    pub async fn deliver_bytes(&self, device_name: &str, data: &[u8]) {
        let frames = {
            let mut devices = self.devices.lock().await;
            let Some(dev) = devices
                .iter_mut()
                .find(|d| d.device_name == device_name || (!d.bus_alias.is_empty() && d.bus_alias == device_name))
            else {
                log::debug!("(bus) bytes for unknown device {device_name}");
                return;
            };
            dev.handle_bytes(data)
        };

        if frames.is_empty() {
            return;
        }

        let listener = self.listener.lock().unwrap().clone();
        for framed in frames {
            {
                let mut ctx = self.parser_ctx.lock().unwrap();
                if ctx.ignore_duplicate_telegrams && ctx.dedup.seen_before(&framed.frame) {
                    log::debug!("(bus) skipping already handled telegram");
                    continue;
                }
            }
            if let Some(cb) = &listener {
                let handled = cb(&framed.about, &framed.frame);
                if !handled {
                    log::trace!("(bus) telegram from {} not handled", framed.about.device);
                }
            }
        }
    }

    /// Record a framing-level protocol error against a device.
    pub async fn protocol_error_detected(&self, device_name: &str) {
        let mut devices = self.devices.lock().await;
        if let Some(dev) = devices.iter_mut().find(|d| d.device_name == device_name) {
            dev.protocol_error_detected();
        }
    }

    /// Supervision part 1: drop devices whose serial handle died.
    pub async fn check_for_dead_devices(&self) {
        let mut devices = self.devices.lock().await;

        let mut i = 0;
        while i < devices.len() {
            if !devices[i].is_working() {
                let mut dev = devices.remove(i);
                log::info!("(bus) lost {}, closing", dev.hr());
                dev.close().await;
            } else {
                i += 1;
            }
        }

        if devices.is_empty() {
            if self.config.exit_on_no_devices {
                if !self.printed_no_device_warning.swap(true, Ordering::SeqCst) {
                    log::info!("(bus) no device detected, exiting");
                    self.serial_manager.stop();
                }
            } else if !self.printed_no_device_warning.swap(true, Ordering::SeqCst) {
                log::info!("(bus) no device detected, waiting for a device to be plugged in");
            }
        } else {
            self.printed_no_device_warning.store(false, Ordering::SeqCst);
        }
    }

    /// Supervision part 2: per-device health checks.
    pub async fn regular_checkup(&self) {
        let mut devices = self.devices.lock().await;
        let mut fatal = false;
        for dev in devices.iter_mut() {
            if dev.is_working() && !dev.check_status(&self.alarms).await {
                fatal = true;
            }
        }
        drop(devices);
        if fatal {
            self.serial_manager.stop();
        }
    }

    /// Supervision part 3: resolve specified devices and auto-scan for
    /// newly plugged in hardware.
    pub async fn detect_and_configure_devices(&self) {
        self.check_for_dead_devices().await;

        let mut must_auto_find_ttys = self.config.use_auto_device_detect;
        let mut must_auto_find_rtlsdrs = self.config.use_auto_device_detect;

        let specs: Vec<SpecifiedDevice> = {
            let mut specified = self.specified.lock().unwrap();
            for st in specified.iter_mut() {
                st.handled = false;
            }
            specified.iter().map(|s| s.spec.clone()).collect()
        };

        for spec in &specs {
            if !spec.hex_data.is_empty() {
                // An inline hex telegram opens a one-shot simulation
                // device and replays immediately.
                let name = format!("hex:{}", &spec.hex_data[..8.min(spec.hex_data.len())]);
                self.mark_spec_handled(spec);
                let already_open = {
                    let devices = self.devices.lock().await;
                    devices.iter().any(|d| d.device_name == name)
                };
                if !already_open {
                    let detected = Detected::new(spec.clone(), DeviceType::Simulation, &name);
                    let hex = spec.hex_data.clone();
                    match self.open_bus_device(detected).await {
                        Ok(()) => self.deliver_bytes(&name, hex.as_bytes()).await,
                        Err(e) => log::warn!("(bus) could not open {}: {e}", spec.hr()),
                    }
                }
                continue;
            }
            if spec.file.is_empty() && spec.command.is_empty() {
                // No location: auto scan must find the matching device.
                must_auto_find_ttys |= spec.device_type.uses_tty();
                must_auto_find_rtlsdrs |= spec.device_type.uses_rtlsdr();
                continue;
            }
            if self.is_device_open(spec).await {
                self.mark_spec_handled(spec);
                continue;
            }
            if !spec.command.is_empty() {
                let detected = detect_device_with_command(spec);
                self.mark_spec_handled(spec);
                if let Err(e) = self.open_bus_device(detected).await {
                    log::warn!("(bus) could not open {}: {e}", spec.hr());
                }
                continue;
            }
            if !spec.file.is_empty() {
                if self
                    .scan
                    .lock()
                    .unwrap()
                    .not_serial_wmbus_devices
                    .contains(&spec.file)
                {
                    self.mark_spec_handled(spec);
                    continue;
                }
                let mut port = self.serial_manager.create_port(&spec.file);
                match detect_device_with_file(spec, port.as_mut()).await {
                    Ok(detected) => {
                        self.mark_spec_handled(spec);
                        if let Err(e) = self.open_bus_device(detected).await {
                            log::warn!("(bus) could not open {}: {e}", spec.hr());
                        }
                    }
                    Err(GatewayError::DeviceUnresponsive(_)) => {
                        log::debug!("(bus) {} did not respond to probing", spec.file);
                        self.scan
                            .lock()
                            .unwrap()
                            .not_serial_wmbus_devices
                            .insert(spec.file.clone());
                        self.mark_spec_handled(spec);
                    }
                    Err(e) => {
                        log::debug!("(bus) cannot detect {}: {e}", spec.file);
                    }
                }
            }
        }

        if must_auto_find_ttys {
            self.auto_scan_serial_devices().await;
        }
        if must_auto_find_rtlsdrs {
            self.auto_scan_swradio_devices().await;
        }

        // Match every open device back onto the specifications.
        {
            let devices = self.devices.lock().await;
            let mut specified = self.specified.lock().unwrap();
            for dev in devices.iter() {
                if let Some(st) = find_matching_spec(&mut specified, dev.device_type, &dev.device_id)
                {
                    st.handled = true;
                }
            }
        }

        // Anything still unmatched is a missing device.
        let specified = self.specified.lock().unwrap();
        for st in specified.iter() {
            if !st.handled {
                let device = st.spec.hr();
                self.alarms.log_alarm(
                    Alarm::SpecifiedDeviceNotFound,
                    &device,
                    &format!("the device {device} is not working"),
                );
            }
        }
    }

    /// One full supervision pass; drive this from a periodic task.
    pub async fn tick(&self) {
        self.detect_and_configure_devices().await;
        self.regular_checkup().await;
        self.send_queue().await;
    }

    async fn is_device_open(&self, spec: &SpecifiedDevice) -> bool {
        let devices = self.devices.lock().await;
        devices.iter().any(|d| {
            (!spec.file.is_empty() && d.device_name == spec.file)
                || (!spec.command.is_empty() && d.device_name == format!("CMD({})", spec.command))
        })
    }

    fn mark_spec_handled(&self, spec: &SpecifiedDevice) {
        let mut specified = self.specified.lock().unwrap();
        if let Some(st) = specified.iter_mut().find(|st| st.spec == *spec) {
            st.handled = true;
        }
    }

    async fn auto_scan_serial_devices(&self) {
        let ttys = self.serial_manager.list_serial_ttys();

        // A tty that disappeared may come back as something else.
        {
            let mut scan = self.scan.lock().unwrap();
            scan.not_serial_wmbus_devices.retain(|t| ttys.contains(t));
        }

        for tty in ttys {
            if self.config.do_not_probe_ttys.contains("all")
                || self.config.do_not_probe_ttys.contains(&tty)
            {
                continue;
            }
            if self.scan.lock().unwrap().not_serial_wmbus_devices.contains(&tty) {
                continue;
            }
            {
                let devices = self.devices.lock().await;
                if devices.iter().any(|d| d.device_name == tty) {
                    continue;
                }
            }

            let mut port = self.serial_manager.create_port(&tty);
            match detect_device_on_tty(&tty, port.as_mut()).await {
                Ok(Some(mut detected)) => {
                    let matched = self.update_detected_from_specs(&mut detected);
                    if self.config.use_auto_device_detect || matched {
                        if let Err(e) = self.open_bus_device(detected).await {
                            log::warn!("(bus) could not open {tty}: {e}");
                        }
                    }
                }
                Ok(None) => {
                    log::debug!(
                        "(bus) ignoring {tty}, it does not respond as any supported wmbus device"
                    );
                    self.scan
                        .lock()
                        .unwrap()
                        .not_serial_wmbus_devices
                        .insert(tty);
                }
                Err(e) => {
                    log::debug!("(bus) cannot probe {tty}: {e}");
                }
            }
        }
    }

    async fn auto_scan_swradio_devices(&self) {
        let serials = self.serial_manager.list_rtlsdr_serials();
        if serials.is_empty() {
            return;
        }

        let rtl_sdr_found = self.serial_manager.binary_in_path("rtl_sdr");
        let rtl_wmbus_found = self.serial_manager.binary_in_path("rtl_wmbus");
        if !rtl_sdr_found || !rtl_wmbus_found {
            let mut scan = self.scan.lock().unwrap();
            if !scan.warned_missing_binaries {
                scan.warned_missing_binaries = true;
                if !rtl_sdr_found {
                    log::warn!("(bus) found an rtl_sdr dongle but no rtl_sdr binary in path");
                }
                if !rtl_wmbus_found {
                    log::warn!("(bus) found an rtl_sdr dongle but no rtl_wmbus binary in path");
                }
            }
            return;
        }

        {
            let mut scan = self.scan.lock().unwrap();
            scan.not_swradio_devices.retain(|s| serials.contains(s));
        }

        for serialnr in serials {
            if self.scan.lock().unwrap().not_swradio_devices.contains(&serialnr) {
                continue;
            }
            {
                let devices = self.devices.lock().await;
                if devices.iter().any(|d| d.device_id == serialnr) {
                    continue;
                }
            }

            let mut detected = Detected::new(
                SpecifiedDevice::default(),
                DeviceType::RtlWmbus,
                &format!("rtlwmbus[{serialnr}]"),
            );
            detected.found_device_id = serialnr.clone();

            let matched = self.update_detected_from_specs(&mut detected);
            if self.config.use_auto_device_detect || matched {
                if let Err(e) = self.open_bus_device(detected).await {
                    log::warn!("(bus) could not open rtlwmbus[{serialnr}]: {e}");
                    self.scan.lock().unwrap().not_swradio_devices.insert(serialnr);
                }
            }
        }
    }

    /// Match an auto-detected device onto the user specifications and
    /// take over the matching spec's settings. Returns true on a match.
    fn update_detected_from_specs(&self, detected: &mut Detected) -> bool {
        let mut specified = self.specified.lock().unwrap();
        if let Some(st) =
            find_matching_spec(&mut specified, detected.found_type, &detected.found_device_id)
        {
            detected.specified_device = st.spec.clone();
            st.handled = true;
            return true;
        }
        false
    }

    /// Queue outbound content for a bus.
    pub fn queue_send(&self, sbc: SendBusContent) {
        log::debug!("(bus) queued send bus={} {}", sbc.bus, sbc.content);
        self.send_queue.lock().unwrap().push_back(sbc);
    }

    /// Drain the outbound queue: resolve each item's bus, validate the
    /// hex content and hand it to the device. Invalid items are logged
    /// and skipped.
    pub async fn send_queue(&self) {
        let items: Vec<SendBusContent> = {
            let mut queue = self.send_queue.lock().unwrap();
            queue.drain(..).collect()
        };
        if items.is_empty() {
            return;
        }

        let mut devices = self.devices.lock().await;
        for sbc in items {
            let Some(dev) = devices.iter_mut().find(|d| {
                d.bus_alias == sbc.bus || d.device_name == sbc.bus
            }) else {
                log::warn!("(bus) could not send content to non-existent bus {}", sbc.bus);
                continue;
            };
            if sbc.content.len() > 500 {
                log::warn!(
                    "(bus) could not send too long hex, maximum is 500 hex chars, bus={}",
                    sbc.bus
                );
                continue;
            }
            let content = match decode_hex(&sbc.content) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("(bus) could not send invalid hex to bus {}: {e}", sbc.bus);
                    continue;
                }
            };
            if let Err(e) = dev.send_telegram(sbc.starts_with, &content).await {
                log::warn!("(bus) send to {} failed: {e}", sbc.bus);
            }
        }
    }
}

/// Two-pass matching of a detected device onto the specifications:
/// first exact (type, id), then (type, id unset) in declaration order.
fn find_matching_spec<'a>(
    specified: &'a mut [SpecifiedState],
    found_type: DeviceType,
    found_id: &str,
) -> Option<&'a mut SpecifiedState> {
    fn type_matches(spec_type: DeviceType, found: DeviceType) -> bool {
        spec_type == found || (spec_type == DeviceType::Rtl433 && found == DeviceType::RtlWmbus)
    }

    let exact = specified.iter().position(|st| {
        st.spec.file.is_empty()
            && !st.spec.id.is_empty()
            && st.spec.id == found_id
            && type_matches(st.spec.device_type, found_type)
    });
    if let Some(i) = exact {
        return Some(&mut specified[i]);
    }

    let by_type = specified.iter().position(|st| {
        st.spec.file.is_empty()
            && st.spec.id.is_empty()
            && type_matches(st.spec.device_type, found_type)
    });
    by_type.map(move |i| &mut specified[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::RecordingAlarmSink;
    use crate::serial::mock::MockSerialManager;
    use crate::util::hex::hex_to_bytes;
    use std::sync::atomic::AtomicUsize;

    const FRAME_HEX: &str = "1f44ae4c5678341203077a6a000000046d3237a92104fd1700000000026da921";

    fn rawtty_detected(file: &str) -> Detected {
        let spec = SpecifiedDevice::parse(&format!("{file}:rawtty")).unwrap();
        Detected::new(spec.clone(), DeviceType::RawTty, file)
    }

    fn manager_with(config: BusManagerConfig) -> (BusManager, Arc<MockSerialManager>, Arc<RecordingAlarmSink>) {
        let serial = Arc::new(MockSerialManager::new());
        let sink = Arc::new(RecordingAlarmSink::new());
        let mgr = BusManager::new(config, serial.clone(), sink.clone());
        (mgr, serial, sink)
    }

    #[tokio::test]
    async fn test_open_and_deliver() {
        let (mgr, _serial, _) = manager_with(BusManagerConfig::default());
        mgr.open_bus_device(rawtty_detected("/dev/ttyUSB0")).await.unwrap();
        assert_eq!(mgr.device_count().await, 1);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        mgr.on_telegram(Arc::new(move |_about, _frame| {
            seen2.fetch_add(1, Ordering::SeqCst);
            true
        }));

        mgr.deliver_bytes("/dev/ttyUSB0", &hex_to_bytes(FRAME_HEX)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_suppression_between_deliveries() {
        let (mgr, _serial, _) = manager_with(BusManagerConfig::default());
        mgr.open_bus_device(rawtty_detected("/dev/ttyUSB0")).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        mgr.on_telegram(Arc::new(move |_, _| {
            seen2.fetch_add(1, Ordering::SeqCst);
            true
        }));

        let frame = hex_to_bytes(FRAME_HEX);
        mgr.deliver_bytes("/dev/ttyUSB0", &frame).await;
        mgr.deliver_bytes("/dev/ttyUSB0", &frame).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicates_allowed_when_disabled() {
        let config = BusManagerConfig {
            ignore_duplicate_telegrams: false,
            ..BusManagerConfig::default()
        };
        let (mgr, _serial, _) = manager_with(config);
        mgr.open_bus_device(rawtty_detected("/dev/ttyUSB0")).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        mgr.on_telegram(Arc::new(move |_, _| {
            seen2.fetch_add(1, Ordering::SeqCst);
            true
        }));

        let frame = hex_to_bytes(FRAME_HEX);
        mgr.deliver_bytes("/dev/ttyUSB0", &frame).await;
        mgr.deliver_bytes("/dev/ttyUSB0", &frame).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dead_device_is_removed() {
        let (mgr, serial, _) = manager_with(BusManagerConfig::default());
        mgr.open_bus_device(rawtty_detected("/dev/ttyUSB0")).await.unwrap();
        assert_eq!(mgr.device_count().await, 1);

        serial.ports.lock().unwrap()[0].set_working(false);
        mgr.check_for_dead_devices().await;
        assert_eq!(mgr.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_no_device_exit_requests_stop() {
        let config = BusManagerConfig {
            exit_on_no_devices: true,
            ..BusManagerConfig::default()
        };
        let (mgr, serial, _) = manager_with(config);
        mgr.check_for_dead_devices().await;
        assert!(!serial.is_running());
    }

    #[tokio::test]
    async fn test_auto_scan_probes_and_opens() {
        let config = BusManagerConfig {
            use_auto_device_detect: true,
            ..BusManagerConfig::default()
        };
        let (mgr, serial, _) = manager_with(config);
        serial.ttys.lock().unwrap().push("/dev/ttyUSB7".to_string());

        mgr.detect_and_configure_devices().await;
        // The probe port answered nothing, so the tty lands in the
        // negative cache and no device opens.
        assert_eq!(mgr.device_count().await, 0);

        // A second scan must not probe again: port count stays put.
        let ports_after_first = serial.ports.lock().unwrap().len();
        mgr.detect_and_configure_devices().await;
        assert_eq!(serial.ports.lock().unwrap().len(), ports_after_first);
    }

    #[tokio::test]
    async fn test_specified_device_not_found_alarm() {
        let (mgr, _serial, sink) = manager_with(BusManagerConfig::default());
        mgr.set_specified_devices(vec![SpecifiedDevice::parse("im871a[12345678]").unwrap()]);

        mgr.detect_and_configure_devices().await;
        let recorded = sink.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, Alarm::SpecifiedDeviceNotFound);

        // Within the same minute the alarm stays silent.
        mgr.detect_and_configure_devices().await;
        assert_eq!(sink.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_send_queue_validation() {
        let (mgr, serial, _) = manager_with(BusManagerConfig::default());
        let mut spec = SpecifiedDevice::parse("/dev/ttyUSB0:mbus:2400").unwrap();
        spec.bus_alias = "BUS1".to_string();
        let detected = Detected::new(spec, DeviceType::MBus, "/dev/ttyUSB0");
        mgr.open_bus_device(detected).await.unwrap();

        // Valid short frame send.
        mgr.queue_send(SendBusContent::parse("sends:BUS1:5b01").unwrap());
        // Not hex: skipped.
        mgr.queue_send(SendBusContent::parse("sends:BUS1:zzzz").unwrap());
        // Unknown bus: skipped.
        mgr.queue_send(SendBusContent::parse("sends:NOPE:5b01").unwrap());
        mgr.send_queue().await;

        let written: Vec<Vec<u8>> = serial.ports.lock().unwrap()[0].written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0], vec![0x10, 0x5B, 0x01, 0x5C, 0x16]);
    }

    #[tokio::test]
    async fn test_protocol_error_escalation_resets() {
        let (mgr, serial, sink) = manager_with(BusManagerConfig::default());
        mgr.open_bus_device(rawtty_detected("/dev/ttyUSB0")).await.unwrap();

        for _ in 0..PROTOCOL_ERROR_LIMIT {
            mgr.protocol_error_detected("/dev/ttyUSB0").await;
        }
        // Paused time auto-advances through the reset settle sleep.
        tokio::time::pause();
        mgr.regular_checkup().await;

        let recorded = sink.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, Alarm::DeviceFailure);
        // The reset succeeded: the port was reopened.
        assert!(serial.ports.lock().unwrap()[0].state.lock().unwrap().open_count >= 2);
    }
}
