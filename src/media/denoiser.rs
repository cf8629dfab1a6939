use nnnoiseless::DenoiseState;
use std::sync::{
    atomic::{AtomicU8, Ordering},
    Mutex,
};

pub const MAX_SUPPRESSION_LEVEL: u8 = 3;

/// Noise suppression over mono PCM frames. The level mixes the denoised
/// signal against the dry input: 0 bypasses, 3 is fully denoised.
pub struct NoiseReducer {
    denoiser: Mutex<Box<DenoiseState<'static>>>,
    level: AtomicU8,
}

impl NoiseReducer {
    pub fn new(level: u8) -> Self {
        Self {
            denoiser: Mutex::new(DenoiseState::new()),
            level: AtomicU8::new(level.min(MAX_SUPPRESSION_LEVEL)),
        }
    }

    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Acquire)
    }

    pub fn set_level(&self, level: u8) {
        self.level
            .store(level.min(MAX_SUPPRESSION_LEVEL), Ordering::Release);
    }

    /// Process a frame in place. Expects 48kHz mono samples.
    pub fn process(&self, samples: &mut [i16]) {
        let level = self.level();
        if level == 0 || samples.is_empty() {
            return;
        }
        let wet_gain = level as f32 / MAX_SUPPRESSION_LEVEL as f32;
        let dry_gain = 1.0 - wet_gain;

        let input_f32: Vec<f32> = samples.iter().map(|&s| s as f32).collect();
        let mut denoiser = self.denoiser.lock().unwrap();
        let mut out_chunk = vec![0.0f32; DenoiseState::FRAME_SIZE];
        let mut padded;

        let mut offset = 0;
        while offset < samples.len() {
            let chunk_len = (samples.len() - offset).min(DenoiseState::FRAME_SIZE);
            let input_chunk = if chunk_len < DenoiseState::FRAME_SIZE {
                padded = vec![0.0f32; DenoiseState::FRAME_SIZE];
                padded[..chunk_len].copy_from_slice(&input_f32[offset..offset + chunk_len]);
                &padded
            } else {
                &input_f32[offset..offset + DenoiseState::FRAME_SIZE]
            };

            denoiser.process_frame(&mut out_chunk, input_chunk);

            for i in 0..chunk_len {
                let mixed = out_chunk[i] * wet_gain + input_f32[offset + i] * dry_gain;
                samples[offset + i] = mixed.clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
            offset += chunk_len;
        }
    }
}
