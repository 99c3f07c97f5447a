//! Mic level capture using CPAL
//!
//! Computes one RMS level per input callback and forwards it to the mic monitor.
//! Only the level leaves the callback; no audio is buffered or stored.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Level capture on one input device.
pub struct LevelCapture {
    device: Device,
    stream_config: StreamConfig,
}

impl LevelCapture {
    /// Open the device named (or indexed) by `device`; empty selects the default input.
    pub fn new(device: &str) -> VoiceResult<Self> {
        let host = cpal::default_host();
        let device = if device.trim().is_empty() {
            host.default_input_device()
                .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?
        } else {
            select_device(&host, device.trim())?
        };

        info!("🎤 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

        let default_config = device.default_input_config()?;
        if default_config.sample_format() != SampleFormat::F32 {
            return Err(VoiceError::Config(format!(
                "input device must deliver f32 samples, got {:?}",
                default_config.sample_format()
            )));
        }

        Ok(Self {
            device,
            stream_config: default_config.config(),
        })
    }

    /// Start the stream. Keep the returned `Stream` alive for as long as levels are needed.
    pub fn start(self, level_tx: mpsc::UnboundedSender<f32>) -> VoiceResult<Stream> {
        let channels = self.stream_config.channels.max(1) as usize;
        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let level = rms_mono(data, channels);
                let _ = level_tx.send(level);
            },
            move |err| {
                warn!("Audio stream error: {}", err);
            },
            None,
        )?;
        stream.play()?;
        info!("✅ Mic level capture started");
        Ok(stream)
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for device in host.input_devices()? {
            if let Ok(name) = device.name() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

fn select_device(host: &cpal::Host, wanted: &str) -> VoiceResult<Device> {
    let index = wanted.parse::<usize>().ok();
    for (i, device) in host.input_devices()?.enumerate() {
        if index == Some(i) {
            return Ok(device);
        }
        if device.name().map(|n| n == wanted).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(VoiceError::AudioDevice(format!("input device not found: {}", wanted)))
}

/// RMS of interleaved samples after averaging channels down to mono.
fn rms_mono(data: &[f32], channels: usize) -> f32 {
    if data.is_empty() {
        return 0.0;
    }
    let frames = data.chunks(channels);
    let count = frames.len() as f32;
    let sum: f32 = frames
        .map(|frame| {
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            mono * mono
        })
        .sum();
    (sum / count).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms_mono(&[], 1), 0.0);
        assert_eq!(rms_mono(&[0.0; 64], 1), 0.0);
    }

    #[test]
    fn rms_averages_channels() {
        let level = rms_mono(&[0.5, 0.5, -0.5, -0.5], 2);
        assert!((level - 0.5).abs() < 1e-6);
    }
}
