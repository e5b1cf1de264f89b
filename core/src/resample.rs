//! Sample-rate conversion for devices that do not run at the modem's
//! nominal 48 kHz, plus multi-channel downmixing for capture paths.

/// Downmix interleaved multi-channel audio to mono by averaging each
/// frame.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler between two sample rates.
pub fn resample(samples: &[f32], from_rate: usize, to_rate: usize) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let step = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / step).ceil() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx];
            let b = samples[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
