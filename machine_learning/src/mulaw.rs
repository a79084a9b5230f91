//! Mu-law companding between continuous signals in `[-1, 1]` and `n_quant` discrete classes.

/// Quantizes a sample into one of `n_quant` classes.
pub fn mu_encode(x: f32, n_quant: usize) -> usize {
    let mu = (n_quant - 1) as f32;
    let x = x.clamp(-1.0, 1.0);
    let y = x.signum() * (1.0 + mu * x.abs()).ln() / (1.0 + mu).ln();
    (((y + 1.0) / 2.0 * mu) + 0.5).floor().clamp(0.0, mu) as usize
}

/// Expands a class back into a sample in `[-1, 1]`.
pub fn mu_decode(q: usize, n_quant: usize) -> f32 {
    let mu = (n_quant - 1) as f32;
    let y = 2.0 * (q.min(n_quant - 1) as f32) / mu - 1.0;
    y.signum() * ((1.0 + mu).powf(y.abs()) - 1.0) / mu
}

/// Encodes a whole signal.
pub fn encode_signal(signal: &[f32], n_quant: usize) -> Vec<usize> {
    signal.iter().map(|&x| mu_encode(x, n_quant)).collect()
}

/// Decodes a whole sequence of classes.
pub fn decode_signal(classes: &[usize], n_quant: usize) -> Vec<f32> {
    classes.iter().map(|&q| mu_decode(q, n_quant)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extremes_map_to_extreme_classes() {
        assert_eq!(mu_encode(-1.0, 256), 0);
        assert_eq!(mu_encode(1.0, 256), 255);
        assert_eq!(mu_encode(5.0, 256), 255);
        assert!((mu_decode(0, 256) + 1.0).abs() < 1e-5);
        assert!((mu_decode(255, 256) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn decoding_is_close_to_the_signal() {
        for x in [-0.7_f32, -0.05, 0.0, 0.01, 0.3, 0.95] {
            let back = mu_decode(mu_encode(x, 256), 256);
            assert!((back - x).abs() < 0.02 + 0.05 * x.abs(), "{x} -> {back}");
        }
    }
}
