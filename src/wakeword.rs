//! Wake word detection seam.
//!
//! The detector itself is pluggable; the engine only talks to the
//! [`WakeWordGate`], which adds the pause/resume latch so detections fired
//! by a still-running detector are dropped while the device is busy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;

pub struct DetectorCallbacks {
    /// `(wake_word, full_text)` for each detection.
    pub on_detected: Box<dyn Fn(String, String) + Send + Sync>,
    pub on_error: Box<dyn Fn(String) + Send + Sync>,
}

/// A wake word engine. Implementations run their own capture/inference and
/// report detections through [`DetectorCallbacks`]; they may keep running
/// while paused, the gate discards the results.
pub trait WakeWordDetector: Send + Sync {
    fn set_callbacks(&self, callbacks: DetectorCallbacks);
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
}

/// Pause latch in front of a detector. While paused, detections vanish here
/// instead of reaching the engine; stale triggers from a detector that has
/// not yet observed the pause are filtered the same way.
pub struct WakeWordGate {
    detector: Arc<dyn WakeWordDetector>,
    paused: Arc<AtomicBool>,
}

impl WakeWordGate {
    /// Wires `sink` to receive every detection that passes the gate.
    pub fn new(
        detector: Arc<dyn WakeWordDetector>,
        sink: Box<dyn Fn(String, String) + Send + Sync>,
    ) -> Self {
        let paused = Arc::new(AtomicBool::new(false));
        let gate_paused = paused.clone();
        detector.set_callbacks(DetectorCallbacks {
            on_detected: Box::new(move |word, text| {
                if gate_paused.load(Ordering::SeqCst) {
                    log::debug!("wake word {word:?} ignored while paused");
                    return;
                }
                sink(word, text);
            }),
            on_error: Box::new(|e| log::warn!("wake word detector error: {e}")),
        });
        Self { detector, paused }
    }

    pub fn start(&self) -> Result<()> {
        self.detector.start()
    }

    pub fn stop(&self) -> Result<()> {
        self.detector.stop()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.detector.is_running()
    }
}

/// Detector that never detects anything; for deployments driven purely by
/// push-to-talk.
pub struct NullDetector {
    running: AtomicBool,
}

impl NullDetector {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
        }
    }
}

impl Default for NullDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeWordDetector for NullDetector {
    fn set_callbacks(&self, _callbacks: DetectorCallbacks) {}

    fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Holds the installed callbacks so tests can fire detections manually.
    struct ManualDetector {
        callbacks: Mutex<Option<DetectorCallbacks>>,
        running: AtomicBool,
    }

    impl ManualDetector {
        fn new() -> Self {
            Self {
                callbacks: Mutex::new(None),
                running: AtomicBool::new(false),
            }
        }

        fn trigger(&self, word: &str) {
            if let Some(callbacks) = &*self.callbacks.lock().unwrap() {
                (callbacks.on_detected)(word.to_string(), format!("... {word} ..."));
            }
        }
    }

    impl WakeWordDetector for ManualDetector {
        fn set_callbacks(&self, callbacks: DetectorCallbacks) {
            *self.callbacks.lock().unwrap() = Some(callbacks);
        }
        fn start(&self) -> Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn detections_pass_when_resumed_and_drop_when_paused() {
        let detector = Arc::new(ManualDetector::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let sink_hits = hits.clone();
        let gate = WakeWordGate::new(
            detector.clone(),
            Box::new(move |_, _| {
                sink_hits.fetch_add(1, Ordering::SeqCst);
            }),
        );

        detector.trigger("hey vox");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        gate.pause();
        detector.trigger("hey vox");
        detector.trigger("hey vox");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        gate.resume();
        detector.trigger("hey vox");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn gate_delegates_lifecycle() {
        let detector = Arc::new(ManualDetector::new());
        let gate = WakeWordGate::new(detector.clone(), Box::new(|_, _| {}));
        assert!(!gate.is_running());
        gate.start().unwrap();
        assert!(gate.is_running());
        gate.stop().unwrap();
        assert!(!gate.is_running());
    }
}
