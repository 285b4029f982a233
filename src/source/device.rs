//! CPAL input device source.

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig as CpalStreamConfig};
use ringbuf::traits::{Producer, Split};
use ringbuf::HeapRb;

use crate::format::f32_to_i16;
use crate::source::{RingSource, Source};
use crate::TransportError;

/// Lists all available input devices.
pub fn list_input_devices() -> Result<Vec<String>, TransportError> {
    let devices = cpal::default_host()
        .input_devices()
        .map_err(|e| TransportError::custom(e.to_string()))?;
    Ok(devices.filter_map(|d| d.name().ok()).collect())
}

/// Gets the name of the default input device, if any.
pub fn default_input_device_name() -> Option<String> {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| d.name().ok())
}

/// Configuration for device capture.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device name, or `None` for the system default input.
    pub device_name: Option<String>,
    /// Ring buffer capacity in samples.
    pub buffer_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            // 30 seconds at 48kHz stereo
            buffer_capacity: 48000 * 2 * 30,
        }
    }
}

/// A source capturing 16-bit PCM from a CPAL input device.
///
/// The CPAL stream is not `Send` on every platform, so it lives on a
/// dedicated capture thread for the lifetime of the open source. The audio
/// callback pushes into a ring buffer that a [`RingSource`] drains.
pub struct DeviceSource {
    config: DeviceConfig,
    name: String,
    capture: Option<CaptureThread>,
    format: Option<(u32, u16)>,
}

struct CaptureThread {
    ring: RingSource,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl DeviceSource {
    /// Creates a source for the configured device. Nothing is opened yet.
    pub fn new(config: DeviceConfig) -> Self {
        let name = format!(
            "device:{}",
            config.device_name.as_deref().unwrap_or("default")
        );
        Self {
            config,
            name,
            capture: None,
            format: None,
        }
    }

    /// Returns the negotiated (sample rate, channels) once open.
    pub fn native_format(&self) -> Option<(u32, u16)> {
        self.format
    }

    fn find_device(name: Option<&str>) -> Result<Device, TransportError> {
        let host = cpal::default_host();
        let Some(name) = name else {
            return host
                .default_input_device()
                .ok_or_else(|| TransportError::custom("no default input device configured"));
        };
        let devices = host
            .input_devices()
            .map_err(|e| TransportError::custom(e.to_string()))?;
        for device in devices {
            if device.name().is_ok_and(|n| n == name) {
                return Ok(device);
            }
        }
        Err(TransportError::custom(format!("device not found: {name}")))
    }

    fn build_stream(
        device: &Device,
        mut producer: ringbuf::HeapProd<i16>,
    ) -> Result<(Stream, u32, u16), TransportError> {
        let supported = device
            .default_input_config()
            .map_err(|e| TransportError::custom(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config: CpalStreamConfig = supported.into();
        let on_error = |err: cpal::StreamError| tracing::error!("Audio stream error: {}", err);

        let stream = match sample_format {
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    // Non-blocking push - drops samples if the reader fell behind
                    let _ = producer.push_slice(data);
                },
                on_error,
                None,
            ),
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        let _ = producer.try_push(f32_to_i16(sample));
                    }
                },
                on_error,
                None,
            ),
            format => {
                return Err(TransportError::Format {
                    reason: format!("unsupported sample format: {format:?}"),
                })
            }
        }
        .map_err(|e| TransportError::custom(e.to_string()))?;

        stream
            .play()
            .map_err(|e| TransportError::custom(e.to_string()))?;
        Ok((stream, config.sample_rate.0, config.channels))
    }
}

impl Source for DeviceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.capture.is_some() {
            return Ok(());
        }

        let (producer, consumer) = HeapRb::<i16>::new(self.config.buffer_capacity).split();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let device_name = self.config.device_name.clone();

        let handle = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let started = Self::find_device(device_name.as_deref())
                    .and_then(|device| Self::build_stream(&device, producer));
                match started {
                    Ok((stream, rate, channels)) => {
                        let _ = ready_tx.send(Ok((rate, channels)));
                        // Hold the stream until close() or the source is dropped
                        let _ = stop_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| TransportError::io("spawn capture thread", e))?;

        let format = ready_rx
            .recv()
            .map_err(|_| TransportError::custom("capture thread exited during startup"))?;
        let format = match format {
            Ok(format) => format,
            Err(e) => {
                let _ = handle.join();
                return Err(e);
            }
        };

        tracing::info!(
            device = %self.name,
            sample_rate = format.0,
            channels = format.1,
            "capture started"
        );

        let mut ring = RingSource::with_name(self.name.clone(), consumer);
        ring.open()?;
        self.format = Some(format);
        self.capture = Some(CaptureThread {
            ring,
            stop_tx,
            handle,
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.capture.is_some()
    }

    fn can_read(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        match self.capture {
            Some(ref mut capture) => capture.ring.can_read(timeout),
            None => Ok(false),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.capture {
            Some(ref mut capture) => capture.ring.read(buf),
            None => Err(TransportError::NotOpen),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if let Some(capture) = self.capture.take() {
            let _ = capture.stop_tx.send(());
            if capture.handle.join().is_err() {
                tracing::warn!(device = %self.name, "capture thread panicked");
            }
            tracing::info!(device = %self.name, "capture stopped");
        }
        Ok(())
    }
}

impl Drop for DeviceSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
