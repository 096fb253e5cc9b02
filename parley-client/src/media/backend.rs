//! Platform audio seam
//!
//! The graph never talks to audio hardware directly. Capture requests and the
//! speaker output go through [`AudioBackend`], implemented over cpal by
//! [`super::cpal_backend::CpalBackend`].

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::{Handle, RuntimeFlavor};

use super::track::MediaStream;
use crate::error::{PipelineError, PipelineResult};

/// System default device display name
pub const SYSTEM_DEFAULT_DEVICE_NAME: &str = "System Default";

/// How long a synchronous caller waits for a device thread to report
pub const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Audio Device
// =============================================================================

/// Represents an audio device (input or output)
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Device name for display
    pub name: String,
    /// Whether this represents the system default device
    pub is_default: bool,
}

impl AudioDevice {
    pub fn new(name: String, is_default: bool) -> Self {
        Self { name, is_default }
    }

    /// Create the system default device entry
    pub fn system_default() -> Self {
        Self {
            name: SYSTEM_DEFAULT_DEVICE_NAME.to_string(),
            is_default: true,
        }
    }
}

impl std::fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for AudioDevice {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for AudioDevice {}

// =============================================================================
// Backend Traits
// =============================================================================

/// Speaker output fed by the render clock
pub trait OutputSink: Send + Sync {
    /// Queue one rendered quantum for playback
    fn write(&self, samples: &[f32]);

    /// Non-blocking check for a device error raised since the last call
    fn check_error(&self) -> Option<String> {
        None
    }

    /// Release the device
    fn close(&self);
}

/// Access to the platform audio subsystem
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// Capture the named input device (empty or "System Default" for default)
    async fn capture_microphone(&self, device: &str) -> PipelineResult<MediaStream>;

    /// Capture system/application audio
    async fn capture_system_audio(&self) -> PipelineResult<MediaStream>;

    /// Open the named output device
    fn open_output(&self, device: &str) -> PipelineResult<Box<dyn OutputSink>>;

    /// Input devices, "System Default" first
    fn list_input_devices(&self) -> Vec<AudioDevice>;

    /// Output devices, "System Default" first
    fn list_output_devices(&self) -> Vec<AudioDevice>;
}

// =============================================================================
// Device Threads
// =============================================================================

/// Wait for a device thread's ready report from synchronous code
///
/// On a multi-thread tokio runtime the wait runs under `block_in_place`, so
/// the worker's other tasks move to another thread instead of stalling.
pub fn wait_for_device_thread<T>(
    ready: &std_mpsc::Receiver<PipelineResult<T>>,
    timeout: Duration,
) -> PipelineResult<T> {
    let wait = || match ready.recv_timeout(timeout) {
        Ok(result) => result,
        Err(std_mpsc::RecvTimeoutError::Timeout) => Err(PipelineError::Device(
            "Device thread did not report in time".to_string(),
        )),
        Err(std_mpsc::RecvTimeoutError::Disconnected) => {
            Err(PipelineError::Device("Device thread exited".to_string()))
        }
    };
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(wait)
        }
        _ => wait(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_device_system_default() {
        let device = AudioDevice::system_default();
        assert_eq!(device.name, SYSTEM_DEFAULT_DEVICE_NAME);
        assert!(device.is_default);
    }

    #[test]
    fn test_audio_device_equality() {
        let device1 = AudioDevice::new("Test".to_string(), false);
        let device2 = AudioDevice::new("Test".to_string(), true);
        let device3 = AudioDevice::new("Other".to_string(), false);

        assert_eq!(device1, device2);
        assert_ne!(device1, device3);
    }

    #[test]
    fn test_wait_for_device_thread_outside_runtime() {
        let (tx, rx) = std_mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(Ok(7));
        });
        assert_eq!(wait_for_device_thread(&rx, DEVICE_OPEN_TIMEOUT).unwrap(), 7);
    }

    #[test]
    fn test_wait_for_device_thread_reports_exit_and_timeout() {
        let (tx, rx) = std_mpsc::channel::<PipelineResult<()>>();
        drop(tx);
        assert!(matches!(
            wait_for_device_thread(&rx, DEVICE_OPEN_TIMEOUT),
            Err(PipelineError::Device(_))
        ));

        let (_tx, rx) = std_mpsc::channel::<PipelineResult<()>>();
        assert!(matches!(
            wait_for_device_thread(&rx, Duration::from_millis(10)),
            Err(PipelineError::Device(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_wait_for_device_thread_keeps_runtime_responsive() {
        let (tx, rx) = std_mpsc::channel();
        // The only worker runs the waiting task; the sender needs it too
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(Ok("ready"));
        });
        let waiter =
            tokio::spawn(async move { wait_for_device_thread(&rx, DEVICE_OPEN_TIMEOUT) });

        assert_eq!(waiter.await.unwrap().unwrap(), "ready");
        sender.await.unwrap();
    }
}
