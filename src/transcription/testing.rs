//! Fake loaders, bundles and probes shared by the tests, plus a WAV writer.

use super::resource::{ModelBundle, ModelLoader, SpeechSpan, SAMPLE_RATE};
use crate::device::{ComputeDevice, DeviceProbe};
use anyhow::anyhow;
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

/// Probe returning a fixed device list.
pub struct FixedProbe(pub Vec<ComputeDevice>);

impl DeviceProbe for FixedProbe {
    fn preference_order(&self) -> Vec<ComputeDevice> {
        self.0.clone()
    }
}

/// Probe that takes a while to answer, like a real CUDA probe.
pub struct SlowProbe {
    pub devices: Vec<ComputeDevice>,
    pub delay: Duration,
}

impl DeviceProbe for SlowProbe {
    fn preference_order(&self) -> Vec<ComputeDevice> {
        std::thread::sleep(self.delay);
        self.devices.clone()
    }
}

/// Number of bundles alive right now and the most ever alive at once.
#[derive(Debug, Default)]
pub struct LiveCount {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl LiveCount {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Recognizer that splits audio into one-second spans and returns scripted text.
pub struct ScriptedBundle {
    pub lines: Vec<String>,
    pub next: usize,
    pub fail_with: Option<String>,
    pub recognize_delay: Duration,
    live: Option<Arc<LiveCount>>,
    /// Dropping the bundle blocks until the other side of the barrier arrives
    drop_gate: Option<Arc<Barrier>>,
}

impl ScriptedBundle {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|line| line.to_string()).collect(),
            next: 0,
            fail_with: None,
            recognize_delay: Duration::ZERO,
            live: None,
            drop_gate: None,
        }
    }
}

impl Drop for ScriptedBundle {
    fn drop(&mut self) {
        if let Some(gate) = self.drop_gate.take() {
            gate.wait();
        }
        if let Some(live) = &self.live {
            live.exit();
        }
    }
}

impl ModelBundle for ScriptedBundle {
    fn detect_speech(&self, samples: &[f32]) -> Vec<SpeechSpan> {
        let step = SAMPLE_RATE as usize;
        (0..samples.len())
            .step_by(step)
            .map(|start| start..(start + step).min(samples.len()))
            .collect()
    }

    fn recognize(&mut self, _samples: &[f32]) -> anyhow::Result<String> {
        if !self.recognize_delay.is_zero() {
            std::thread::sleep(self.recognize_delay);
        }
        if let Some(message) = &self.fail_with {
            return Err(anyhow!(message.clone()));
        }
        let line = self.lines.get(self.next).cloned().unwrap_or_default();
        self.next += 1;
        Ok(line)
    }

    fn punctuate(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Loader that counts attempts, sleeps to widen race windows and fails on
/// configured devices.
pub struct FakeLoader {
    pub attempts: AtomicUsize,
    pub delay: Duration,
    pub failures: HashMap<ComputeDevice, String>,
    /// Number of initial attempts that fail with a fatal error
    pub fail_first: AtomicUsize,
    pub lines: Vec<String>,
    pub loaded_on: Mutex<Vec<ComputeDevice>>,
    pub recognize_delay: Duration,
    pub live_bundles: Arc<LiveCount>,
    /// Handed to the first bundle loaded, then gone
    pub drop_gate: Mutex<Option<Arc<Barrier>>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            delay: Duration::from_millis(0),
            failures: HashMap::new(),
            fail_first: AtomicUsize::new(0),
            lines: vec!["hello".to_string()],
            loaded_on: Mutex::new(Vec::new()),
            recognize_delay: Duration::ZERO,
            live_bundles: Arc::new(LiveCount::default()),
            drop_gate: Mutex::new(None),
        }
    }

    pub fn with_recognize_delay(mut self, delay: Duration) -> Self {
        self.recognize_delay = delay;
        self
    }

    pub fn with_drop_gate(self, gate: Arc<Barrier>) -> Self {
        *self.drop_gate.lock().unwrap() = Some(gate);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_on(mut self, device: ComputeDevice, message: &str) -> Self {
        self.failures.insert(device, message.to_string());
        self
    }

    pub fn failing_first(self, count: usize) -> Self {
        self.fail_first.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_lines(mut self, lines: &[&str]) -> Self {
        self.lines = lines.iter().map(|line| line.to_string()).collect();
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self, device: ComputeDevice) -> anyhow::Result<Box<dyn ModelBundle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("weights file is corrupt"));
        }

        if let Some(message) = self.failures.get(&device) {
            return Err(anyhow!(message.clone()));
        }

        self.loaded_on.lock().unwrap().push(device);
        let lines: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        let mut bundle = ScriptedBundle::new(&lines);
        bundle.recognize_delay = self.recognize_delay;
        bundle.drop_gate = self.drop_gate.lock().unwrap().take();
        self.live_bundles.enter();
        bundle.live = Some(Arc::clone(&self.live_bundles));
        Ok(Box::new(bundle))
    }
}

/// 16-bit PCM WAV with a sine tone in every channel.
pub fn wav_bytes(sample_rate: u32, channels: u16, frames: u32) -> Vec<u8> {
    let data_size = frames * u32::from(channels) * 2;
    let mut buf = Vec::with_capacity(44 + data_size as usize);

    buf.extend_from_slice(b"RIFF");
    buf.write_u32::<LittleEndian>(36 + data_size).unwrap();
    buf.extend_from_slice(b"WAVE");
    buf.extend_from_slice(b"fmt ");
    buf.write_u32::<LittleEndian>(16).unwrap();
    buf.write_u16::<LittleEndian>(1).unwrap();
    buf.write_u16::<LittleEndian>(channels).unwrap();
    buf.write_u32::<LittleEndian>(sample_rate).unwrap();
    buf.write_u32::<LittleEndian>(sample_rate * u32::from(channels) * 2).unwrap();
    buf.write_u16::<LittleEndian>(channels * 2).unwrap();
    buf.write_u16::<LittleEndian>(16).unwrap();
    buf.extend_from_slice(b"data");
    buf.write_u32::<LittleEndian>(data_size).unwrap();

    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let value = (0.25 * (t * 440.0 * std::f32::consts::TAU).sin() * i16::MAX as f32) as i16;
        for _ in 0..channels {
            buf.write_i16::<LittleEndian>(value).unwrap();
        }
    }
    buf
}
