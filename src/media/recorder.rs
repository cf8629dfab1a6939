use anyhow::Result;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::{fs::File, io::BufWriter, path::Path};
use tracing::info;

pub struct RecorderConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
        }
    }
}

/// Local WAV recording sink. Purely additive: attaching or dropping it never
/// touches negotiation or call state.
pub struct WavSink {
    path: String,
    writer: Option<WavWriter<BufWriter<File>>>,
    samples_written: u64,
}

impl WavSink {
    pub fn create<P: AsRef<Path>>(path: P, config: &RecorderConfig) -> Result<Self> {
        let spec = WavSpec {
            channels: config.channels,
            sample_rate: config.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let path_str = path.as_ref().to_string_lossy().to_string();
        let writer = WavWriter::create(path.as_ref(), spec)?;
        info!(path = path_str, "recording sink opened");
        Ok(Self {
            path: path_str,
            writer: Some(writer),
            samples_written: 0,
        })
    }

    pub fn write_samples(&mut self, samples: &[i16]) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            for &sample in samples {
                writer.write_sample(sample)?;
            }
            self.samples_written += samples.len() as u64;
        }
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn finalize(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            info!(
                path = self.path,
                samples = self.samples_written,
                "recording sink finalized"
            );
        }
        Ok(())
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        self.finalize().ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wav_sink_writes_playable_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.wav");
        let mut sink = WavSink::create(&path, &RecorderConfig::default()).unwrap();
        let tone: Vec<i16> = (0..480).map(|i| ((i % 48) * 100) as i16).collect();
        sink.write_samples(&tone).unwrap();
        assert_eq!(sink.samples_written(), 480);
        sink.finalize().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 48000);
        assert_eq!(reader.len(), 480);
    }
}
