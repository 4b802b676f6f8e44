//! # Serial Collaborator Interface
//!
//! Serial/TTY I/O primitives are not part of the gateway core; this
//! module only defines the seam the core drives them through, plus an
//! in-memory implementation used by the test suite.
//!
//! The contract mirrors the concurrency model of the gateway: reads are
//! performed by the collaborator's event loop which feeds bytes into the
//! bus manager, while the core only ever writes (probes, link mode
//! commands, outbound telegrams) and manages lifecycle.

use crate::error::GatewayError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One serial device (tty, subprocess pipe, file).
#[async_trait]
pub trait SerialPort: Send + Sync {
    /// Device path or identifier, e.g. `/dev/ttyUSB0`.
    fn device(&self) -> &str;

    async fn open(&mut self) -> Result<(), GatewayError>;
    async fn close(&mut self);

    async fn write_all(&mut self, data: &[u8]) -> Result<(), GatewayError>;

    /// Read whatever is available within `timeout`; used by probing.
    async fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, GatewayError>;

    async fn set_baud_rate(&mut self, baud: u32) -> Result<(), GatewayError>;

    fn is_open(&self) -> bool;
    /// False once the underlying device has disappeared.
    fn is_working(&self) -> bool;
    fn is_readonly(&self) -> bool {
        false
    }
    /// Unconsumed inbound bytes are pending.
    fn data_pending(&self) -> bool {
        false
    }
}

/// The serial communication manager collaborator: enumerates candidate
/// devices, creates ports and owns the I/O event loop.
pub trait SerialManager: Send + Sync {
    /// Candidate ttys that may have a wmbus dongle behind them.
    fn list_serial_ttys(&self) -> Vec<String>;

    /// Serial numbers of plugged in rtl-sdr dongles.
    fn list_rtlsdr_serials(&self) -> Vec<String>;

    /// Create (but do not open) a port for a device path.
    fn create_port(&self, device: &str) -> Box<dyn SerialPort>;

    /// Is an executable reachable through PATH? Used to check for
    /// `rtl_sdr` and `rtl_wmbus` before opening swradio devices.
    fn binary_in_path(&self, name: &str) -> bool;

    /// Request the event loop to stop; pending reads are interrupted.
    fn stop(&self);

    fn is_running(&self) -> bool;
}

pub mod mock {
    //! In-memory serial devices for tests: scripted responses, recorded
    //! writes, controllable working state.

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    pub struct MockPortState {
        pub written: Vec<Vec<u8>>,
        pub responses: VecDeque<Vec<u8>>,
        pub open: bool,
        pub working: bool,
        pub baud: u32,
        pub open_count: u32,
    }

    /// Scriptable serial port.
    #[derive(Clone)]
    pub struct MockSerialPort {
        device: String,
        pub state: Arc<Mutex<MockPortState>>,
    }

    impl MockSerialPort {
        pub fn new(device: &str) -> Self {
            MockSerialPort {
                device: device.to_string(),
                state: Arc::new(Mutex::new(MockPortState {
                    working: true,
                    ..MockPortState::default()
                })),
            }
        }

        /// Queue a response returned by the next `read_with_timeout`.
        pub fn push_response(&self, data: &[u8]) {
            self.state.lock().unwrap().responses.push_back(data.to_vec());
        }

        pub fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().written.clone()
        }

        pub fn set_working(&self, working: bool) {
            self.state.lock().unwrap().working = working;
        }
    }

    #[async_trait]
    impl SerialPort for MockSerialPort {
        fn device(&self) -> &str {
            &self.device
        }

        async fn open(&mut self) -> Result<(), GatewayError> {
            let mut st = self.state.lock().unwrap();
            if !st.working {
                return Err(GatewayError::SerialPortError(format!(
                    "cannot open {}",
                    self.device
                )));
            }
            st.open = true;
            st.open_count += 1;
            Ok(())
        }

        async fn close(&mut self) {
            self.state.lock().unwrap().open = false;
        }

        async fn write_all(&mut self, data: &[u8]) -> Result<(), GatewayError> {
            let mut st = self.state.lock().unwrap();
            if !st.open {
                return Err(GatewayError::SerialPortError("port not open".to_string()));
            }
            st.written.push(data.to_vec());
            Ok(())
        }

        async fn read_with_timeout(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize, GatewayError> {
            let mut st = self.state.lock().unwrap();
            match st.responses.pop_front() {
                None => Ok(0),
                Some(resp) => {
                    let n = resp.len().min(buf.len());
                    buf[..n].copy_from_slice(&resp[..n]);
                    Ok(n)
                }
            }
        }

        async fn set_baud_rate(&mut self, baud: u32) -> Result<(), GatewayError> {
            self.state.lock().unwrap().baud = baud;
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.state.lock().unwrap().open
        }

        fn is_working(&self) -> bool {
            self.state.lock().unwrap().working
        }
    }

    /// Scriptable serial manager.
    pub struct MockSerialManager {
        pub ttys: Mutex<Vec<String>>,
        pub rtlsdrs: Mutex<Vec<String>>,
        pub binaries: Mutex<Vec<String>>,
        pub ports: Mutex<Vec<MockSerialPort>>,
        running: AtomicBool,
    }

    impl Default for MockSerialManager {
        fn default() -> Self {
            MockSerialManager {
                ttys: Mutex::new(Vec::new()),
                rtlsdrs: Mutex::new(Vec::new()),
                binaries: Mutex::new(Vec::new()),
                ports: Mutex::new(Vec::new()),
                running: AtomicBool::new(true),
            }
        }
    }

    impl MockSerialManager {
        pub fn new() -> Self {
            MockSerialManager::default()
        }
    }

    impl SerialManager for MockSerialManager {
        fn list_serial_ttys(&self) -> Vec<String> {
            self.ttys.lock().unwrap().clone()
        }

        fn list_rtlsdr_serials(&self) -> Vec<String> {
            self.rtlsdrs.lock().unwrap().clone()
        }

        fn create_port(&self, device: &str) -> Box<dyn SerialPort> {
            let port = MockSerialPort::new(device);
            self.ports.lock().unwrap().push(port.clone());
            Box::new(port)
        }

        fn binary_in_path(&self, name: &str) -> bool {
            self.binaries.lock().unwrap().iter().any(|b| b == name)
        }

        fn stop(&self) {
            self.running.store(false, Ordering::SeqCst);
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }
}
