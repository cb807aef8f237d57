//! BLE gesture-capture coordinator with optional Python bindings.
//!
//! This crate talks to an accelerometer board (Nano 33 IoT sketch) over GATT,
//! runs its countdown/capture handshake and hands back one gesture as an
//! ordered list of (x, y, z) samples in g.
//!
//! # Capture flow
//!
//! 1. [`ConnectionManager`] owns the link (BlueZ with the `bluez` feature, or
//!    the in-process [`SimulatedLink`]).
//! 2. [`run_capture`] subscribes a fresh [`CaptureSession`] to the status and
//!    acceleration characteristics and writes `StartCapture`.
//! 3. The device counts down, streams chunks tagged with sequence numbers (in
//!    any order), then reports `Complete` or `Error`.
//! 4. The session reassembles chunks by sequence number; [`run_capture`]
//!    returns the samples or a [`CaptureError`] after at most the configured
//!    timeout (15 s by default).
//!
//! Malformed notifications are dropped inside the session and never abort a
//! capture.

#[cfg(feature = "bluez")]
mod bluetooth;
mod connection;
mod driver;
mod errors;
pub mod logging;
pub mod protocol;
mod reassembler;
mod session;
pub mod simulator;

#[cfg(feature = "bluez")]
pub use bluetooth::{BluezConnector, BluezLink};
pub use connection::{CaptureSlot, ConnectionManager, GattLink, NotificationHandler};
pub use driver::{run_capture, Capture, CaptureConfig, CaptureRecord, DEFAULT_TIMEOUT};
pub use errors::*;
pub use protocol::{Characteristic, Chunk, Command, Sample, Status};
pub use reassembler::ChunkReassembler;
pub use session::{CaptureSession, SessionOutcome, SessionState, StatusObserver, Transition};
pub use simulator::{SimulatedLink, SimulatorConfig};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::time::Duration;

    use pyo3::exceptions::{PyConnectionError, PyRuntimeError, PyTimeoutError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyDict;
    use tokio::runtime::Runtime;

    use crate::bluetooth::{BluezConnector, BluezLink};
    use crate::protocol::DEFAULT_DEVICE_NAME;
    use crate::{run_capture, Capture, CaptureConfig, CaptureError, ConnectionManager};

    fn capture_err(e: CaptureError) -> PyErr {
        match e {
            CaptureError::Timeout { .. } => PyErr::new::<PyTimeoutError, _>(e.to_string()),
            CaptureError::Link(_) | CaptureError::WriteFailed(_) => {
                PyErr::new::<PyConnectionError, _>(e.to_string())
            }
            _ => PyErr::new::<PyRuntimeError, _>(e.to_string()),
        }
    }

    /// One captured gesture (dataclass-like).
    ///
    /// Attributes:
    ///     timestamp_ms: Completion time in milliseconds since the Unix epoch.
    ///     x, y, z: Equal-length acceleration series in g, in recording order.
    #[pyclass(name = "Capture", frozen)]
    #[derive(Clone)]
    struct PyCapture {
        #[pyo3(get)]
        timestamp_ms: u64,
        #[pyo3(get)]
        x: Vec<f64>,
        #[pyo3(get)]
        y: Vec<f64>,
        #[pyo3(get)]
        z: Vec<f64>,
    }

    #[pymethods]
    impl PyCapture {
        fn __repr__(&self) -> String {
            format!(
                "Capture(samples={}, timestamp_ms={})",
                self.x.len(),
                self.timestamp_ms
            )
        }

        fn __len__(&self) -> usize {
            self.x.len()
        }

        /// Convert to the dataset record layout (timestamp, x, y, z).
        fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
            let dict = PyDict::new(py);
            dict.set_item("timestamp", self.timestamp_ms)?;
            dict.set_item("samples", self.x.len())?;
            dict.set_item("x", self.x.clone())?;
            dict.set_item("y", self.y.clone())?;
            dict.set_item("z", self.z.clone())?;
            Ok(dict)
        }
    }

    impl From<Capture> for PyCapture {
        fn from(c: Capture) -> Self {
            let (x, y, z) = c.axes();
            PyCapture {
                timestamp_ms: c.timestamp_ms,
                x,
                y,
                z,
            }
        }
    }

    /// Connection to the gesture sensor.
    ///
    /// Example:
    ///     >>> device = GestureDevice.connect()
    ///     >>> capture = device.capture()
    ///     >>> print(len(capture))
    ///     >>> device.disconnect()
    #[pyclass(name = "GestureDevice", unsendable)]
    struct PyGestureDevice {
        runtime: Runtime,
        manager: ConnectionManager<BluezLink>,
    }

    #[pymethods]
    impl PyGestureDevice {
        /// Connect to the sensor.
        ///
        /// Args:
        ///     address: MAC address of the board. If omitted, the first device
        ///         whose name starts with `name` is used.
        ///     name: Advertised name prefix to scan for (default: "Nano33IoT").
        ///
        /// Raises:
        ///     ConnectionError: If the device is not found or refuses the connection.
        #[staticmethod]
        #[pyo3(signature = (address=None, name=DEFAULT_DEVICE_NAME))]
        fn connect(address: Option<&str>, name: &str) -> PyResult<Self> {
            crate::logging::init_logging(false);
            let runtime = Runtime::new().map_err(|e| {
                PyErr::new::<PyRuntimeError, _>(format!("tokio runtime init failed: {e}"))
            })?;
            let connector = BluezConnector::default();
            let manager = runtime
                .block_on(async {
                    let address = match address {
                        Some(a) => a.to_string(),
                        None => connector.discover(name).await?,
                    };
                    let link = connector
                        .connect(&address, connector.connect_timeout)
                        .await?;
                    Ok::<_, crate::ConnectionError>(ConnectionManager::new(link))
                })
                .map_err(|e| PyErr::new::<PyConnectionError, _>(e.to_string()))?;
            Ok(PyGestureDevice { runtime, manager })
        }

        /// Run one capture: countdown, gesture, completion.
        ///
        /// Args:
        ///     timeout: Seconds to wait for the device to finish (default: 15).
        ///
        /// Returns:
        ///     Capture with the samples in recording order.
        ///
        /// Raises:
        ///     TimeoutError: If the device does not finish in time.
        ///     ConnectionError: If the start command cannot be sent.
        ///     RuntimeError: If the device reports an error or sends no data.
        #[pyo3(signature = (timeout=15.0))]
        fn capture(&self, timeout: f64) -> PyResult<PyCapture> {
            if !timeout.is_finite() || timeout <= 0.0 {
                return Err(PyErr::new::<PyValueError, _>(
                    "timeout must be a positive number of seconds",
                ));
            }
            let config = CaptureConfig::default().with_timeout(Duration::from_secs_f64(timeout));
            self.runtime
                .block_on(run_capture(&self.manager, &config))
                .map(PyCapture::from)
                .map_err(capture_err)
        }

        /// Close the connection. Calling it twice is harmless.
        fn disconnect(&self) {
            self.runtime.block_on(self.manager.disconnect());
        }

        #[getter]
        fn address(&self) -> String {
            self.manager.address().to_string()
        }

        #[getter]
        fn is_connected(&self) -> bool {
            self.manager.is_connected()
        }

        fn __repr__(&self) -> String {
            format!(
                "GestureDevice(address={}, connected={})",
                self.manager.address(),
                self.manager.is_connected()
            )
        }
    }

    /// The Python module definition
    #[pymodule]
    #[pyo3(name = "_core")]
    fn gesture_capture_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
        m.add_class::<PyGestureDevice>()?;
        m.add_class::<PyCapture>()?;

        m.add("DEFAULT_TIMEOUT_SECS", crate::DEFAULT_TIMEOUT.as_secs_f64())?;
        m.add("DEFAULT_DEVICE_NAME", DEFAULT_DEVICE_NAME)?;

        Ok(())
    }
}
