use super::AudioClip;

/// 300 s clip: a sustained three-note chord for the first 60 s, then sparse
/// noise bursts (15% of 200 ms blocks) from a fixed-seed LCG.
pub(crate) fn synthetic_head_clip(sample_rate: u32) -> AudioClip {
    let sr = sample_rate as usize;
    let mut samples = Vec::with_capacity(300 * sr);
    for i in 0..60 * sr {
        let t = i as f32 / sample_rate as f32;
        let v = [220.0f32, 277.2, 329.6]
            .iter()
            .map(|f| 0.2 * (2.0 * std::f32::consts::PI * f * t).sin())
            .sum::<f32>();
        samples.push(v);
    }

    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (state >> 33) as f32 / (1u64 << 31) as f32
    };

    let block = sr / 5;
    for _ in 0..(240 * 5) {
        let burst = next() < 0.15;
        for _ in 0..block {
            let noise = next() - 0.5;
            samples.push(if burst { 0.8 * noise } else { 0.0 });
        }
    }
    AudioClip::new(samples, sample_rate)
}

/// Write a clip as a 16-bit mono WAV.
pub(crate) fn write_wav(path: &std::path::Path, clip: &AudioClip) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: clip.sample_rate(),
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for &s in clip.samples() {
        writer
            .write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}
