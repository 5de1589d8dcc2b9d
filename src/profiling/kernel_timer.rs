//! Kernel timer for measuring device op execution time
//!
//! Device timing records a [`DeviceEvent`] on a stream queue before and after
//! the timed work, so it measures when the queue actually ran the ops rather
//! than when they were enqueued. Host timing uses `Instant` directly.
//!
//! # Example
//!
//! ```rust,ignore
//! use mlpforge::backend::QueueId;
//! use mlpforge::profiling::KernelTimer;
//!
//! let mut timer = KernelTimer::for_kernel("fprop");
//! timer.start(&stream, QueueId::Primary)?;
//! // ... enqueue kernels ...
//! timer.stop(&stream)?;
//! println!("{} took {:.3} ms", timer.name(), timer.elapsed().unwrap_or(0.0));
//! ```

use std::time::Instant;

use crate::backend::{DeviceError, DeviceEvent, DeviceResult, DeviceStream, QueueId};

/// Timer for one kernel or group of kernels
#[derive(Debug)]
pub struct KernelTimer {
    name: String,
    start: Option<TimerStart>,
    stopped: bool,
    elapsed_ms: Option<f32>,
}

#[derive(Debug)]
enum TimerStart {
    Device { event: DeviceEvent, queue: QueueId },
    Cpu { instant: Instant },
}

impl KernelTimer {
    pub fn for_kernel(name: impl Into<String>) -> Self {
        KernelTimer {
            name: name.into(),
            start: None,
            stopped: false,
            elapsed_ms: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record the start event on `queue`
    pub fn start(&mut self, stream: &DeviceStream, queue: QueueId) -> DeviceResult<()> {
        let event = DeviceEvent::new();
        stream.record_event(&event, queue)?;
        self.start = Some(TimerStart::Device { event, queue });
        self.stopped = false;
        self.elapsed_ms = None;
        Ok(())
    }

    pub fn start_cpu(&mut self) {
        self.start = Some(TimerStart::Cpu {
            instant: Instant::now(),
        });
        self.stopped = false;
        self.elapsed_ms = None;
    }

    /// Record the stop event on the start queue and wait for it
    ///
    /// Blocks until the timed ops have run. Fails if the stream reported an
    /// error while they ran.
    pub fn stop(&mut self, stream: &DeviceStream) -> DeviceResult<()> {
        let (start_event, queue) = match &self.start {
            Some(TimerStart::Device { event, queue }) => (event, *queue),
            Some(TimerStart::Cpu { .. }) => {
                return Err(DeviceError::EventError(
                    "Cannot call stop() on a CPU-started timer. Use stop_cpu() instead.".to_string(),
                ))
            }
            None => {
                return Err(DeviceError::EventError(
                    "Timer must be started before stopping".to_string(),
                ))
            }
        };

        let stop_event = DeviceEvent::new();
        stream.record_event(&stop_event, queue)?;
        stop_event.synchronize()?;
        if let Some(err) = stream.last_error()? {
            return Err(err);
        }

        self.elapsed_ms = Some(start_event.elapsed_time(&stop_event)?);
        self.stopped = true;
        Ok(())
    }

    pub fn stop_cpu(&mut self) {
        let stop = Instant::now();
        if let Some(TimerStart::Cpu { instant }) = &self.start {
            self.elapsed_ms = Some(stop.duration_since(*instant).as_secs_f64() as f32 * 1000.0);
            self.stopped = true;
        }
    }

    /// Elapsed milliseconds, `None` until stopped
    pub fn elapsed(&self) -> Option<f32> {
        self.elapsed_ms
    }

    pub fn is_started(&self) -> bool {
        self.start.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

/// Logs the time from creation until drop
#[derive(Debug)]
pub struct ScopedTimer {
    name: String,
    start: Instant,
}

impl ScopedTimer {
    pub fn new(name: impl Into<String>) -> Self {
        ScopedTimer {
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Milliseconds since creation
    pub fn elapsed(&self) -> f32 {
        self.start.elapsed().as_secs_f64() as f32 * 1000.0
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        tracing::debug!("ScopedTimer '{}': {:.3} ms", self.name, self.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Device;
    use std::time::Duration;

    #[test]
    fn test_kernel_timer_creation() {
        let timer = KernelTimer::for_kernel("test_kernel");
        assert_eq!(timer.name(), "test_kernel");
        assert!(!timer.is_started());
        assert!(!timer.is_stopped());
        assert!(timer.elapsed().is_none());
    }

    #[test]
    fn test_device_timing_covers_queued_work() {
        let device = Device::open(0).unwrap();
        let stream = DeviceStream::with_aux_queues(&device, 1).unwrap();
        let mut timer = KernelTimer::for_kernel("sleepy");

        timer.start(&stream, QueueId::Aux(0)).unwrap();
        stream
            .launch(QueueId::Aux(0), "sleep", || {
                std::thread::sleep(Duration::from_millis(10));
                Ok(())
            })
            .unwrap();
        timer.stop(&stream).unwrap();

        assert!(timer.is_stopped());
        let elapsed = timer.elapsed().unwrap();
        assert!(elapsed >= 10.0, "Expected at least 10ms, got {:.2} ms", elapsed);
    }

    #[test]
    fn test_device_timing_reports_op_failure() {
        let device = Device::open(0).unwrap();
        let stream = DeviceStream::new(&device).unwrap();
        let mut timer = KernelTimer::for_kernel("failing");

        timer.start(&stream, QueueId::Primary).unwrap();
        stream
            .launch(QueueId::Primary, "boom", || {
                Err(DeviceError::execution("boom", "injected"))
            })
            .unwrap();
        assert!(timer.stop(&stream).is_err());
        assert!(timer.elapsed().is_none());
    }

    #[test]
    fn test_stop_without_start_fails() {
        let device = Device::open(0).unwrap();
        let stream = DeviceStream::new(&device).unwrap();
        let mut timer = KernelTimer::for_kernel("never_started");
        assert!(timer.stop(&stream).is_err());

        timer.start_cpu();
        assert!(timer.stop(&stream).is_err());
    }

    #[test]
    fn test_kernel_timer_cpu_timing() {
        let mut timer = KernelTimer::for_kernel("cpu_kernel");
        timer.start_cpu();
        assert!(timer.is_started());
        assert!(!timer.is_stopped());

        std::thread::sleep(Duration::from_millis(10));

        timer.stop_cpu();
        assert!(timer.is_stopped());
        let elapsed = timer.elapsed().expect("elapsed should be Some after stop");
        assert!(elapsed >= 10.0, "Expected at least 10ms, got {:.2} ms", elapsed);
        assert!(elapsed < 1000.0, "Expected less than 1000ms, got {:.2} ms", elapsed);
    }

    #[test]
    fn test_scoped_timer_accuracy() {
        let timer = ScopedTimer::new("accuracy_test");
        std::thread::sleep(Duration::from_millis(20));
        let elapsed = timer.elapsed();
        assert!(elapsed >= 20.0, "Expected at least 20ms, got {:.2} ms", elapsed);
        assert_eq!(timer.name(), "accuracy_test");
    }
}
