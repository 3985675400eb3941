// src/backend/fused.rs
//
// Host fused strategy. Differences from the reference path, all deliberate:
// one-sweep moment statistics, a per-channel reciprocal stddev
// `rstd = 1/sqrt(variance + ε)` precomputed once and reused everywhere,
// normalize+affine collapsed into a single sweep, a 0.99 rolling decay,
// and no `saved_normalized` write — backward recomputes the normalized
// value from `saved_input`. Parity with the reference strategy is bounded
// by the cross-backend tests.

use crate::backend::cpu::{cumulative_update, rolling_update};
use crate::backend::number::NormoxF;
use crate::backend::{
    BackwardPass, Dims, InferPass, NormBackend, TrainPass, CUMULATIVE_ALPHA, FAST_ROLLING_DECAY,
};

#[derive(Debug, Default)]
pub struct FusedNorm<T: NormoxF> {
    /// Per-channel reciprocal stddev scratch, sized lazily.
    rstd: Vec<T>,
}

impl<T: NormoxF> FusedNorm<T> {
    fn ensure_scratch(&mut self, channels: usize) {
        if self.rstd.len() != channels {
            self.rstd = vec![T::zero(); channels];
        }
    }
}

impl<T: NormoxF> NormBackend<T> for FusedNorm<T> {
    fn name(&self) -> &'static str {
        "fused"
    }

    fn default_decay(&self) -> T {
        T::from_f64(FAST_ROLLING_DECAY).expect("decay constant must fit the element type")
    }

    fn forward_train(&mut self, pass: TrainPass<'_, T>) -> Result<(), String> {
        let TrainPass {
            dims,
            decay,
            cumulative,
            output,
            saved_input,
            saved_normalized: _,
            mean,
            variance,
            mean_avg,
            variance_avg,
            rolling_mean,
            rolling_variance,
            scales,
            biases,
        } = pass;
        let Dims { batch, channels, spatial } = dims;
        let eps = T::variance_epsilon();
        let inv_n = T::one()
            / T::from_usize(batch * spatial).expect("element count must fit the element type");

        saved_input.copy_from_slice(output);

        // One-sweep moments: E[x] and E[x²] per channel, variance floored
        // at zero against rounding in the moment difference.
        for c in 0..channels {
            let mut sum = T::zero();
            let mut sum_sq = T::zero();
            for b in 0..batch {
                for s in 0..spatial {
                    let v = output[b * channels * spatial + c * spatial + s];
                    sum += v;
                    sum_sq += v * v;
                }
            }
            let m = sum * inv_n;
            mean[c] = m;
            variance[c] = (sum_sq * inv_n - m * m).max(T::zero());
        }

        match cumulative {
            None => rolling_update(decay, mean, variance, rolling_mean, rolling_variance),
            Some(sub) => {
                let alpha =
                    T::from_f64(CUMULATIVE_ALPHA).expect("blend constant must fit the element type");
                cumulative_update(alpha, mean, variance, mean_avg, variance_avg);
                if sub.is_last() {
                    rolling_update(decay, mean, variance, rolling_mean, rolling_variance);
                }
            }
        }

        self.ensure_scratch(channels);
        for c in 0..channels {
            self.rstd[c] = T::one() / (variance[c] + eps).sqrt();
        }

        // Normalize + affine in one sweep; saved_normalized stays untouched.
        for b in 0..batch {
            for c in 0..channels {
                for s in 0..spatial {
                    let idx = b * channels * spatial + c * spatial + s;
                    output[idx] = (output[idx] - mean[c]) * self.rstd[c] * scales[c] + biases[c];
                }
            }
        }
        Ok(())
    }

    fn forward_infer(&mut self, pass: InferPass<'_, T>) -> Result<(), String> {
        let InferPass { dims, output, rolling_mean, rolling_variance, scales, biases } = pass;
        let Dims { batch, channels, spatial } = dims;
        let eps = T::variance_epsilon();

        for c in 0..channels {
            let rstd = T::one() / (rolling_variance[c] + eps).sqrt();
            for b in 0..batch {
                for s in 0..spatial {
                    let idx = b * channels * spatial + c * spatial + s;
                    output[idx] = (output[idx] - rolling_mean[c]) * rstd * scales[c] + biases[c];
                }
            }
        }
        Ok(())
    }

    fn backward(&mut self, pass: BackwardPass<'_, T>) -> Result<(), String> {
        let BackwardPass {
            dims,
            delta,
            saved_input,
            saved_normalized: _,
            mean,
            variance,
            mean_grad,
            variance_grad,
            scale_grad,
            bias_grad,
            scales,
        } = pass;
        let Dims { batch, channels, spatial } = dims;
        let eps = T::variance_epsilon();
        let half = T::from_f64(0.5).expect("constant must fit the element type");
        let two = T::from_f64(2.0).expect("constant must fit the element type");
        let inv_n = T::one()
            / T::from_usize(batch * spatial).expect("element count must fit the element type");

        self.ensure_scratch(channels);

        // Single reduction sweep: Σδ and Σδ·x̂ per channel cover every
        // accumulator. The scale on delta is folded in analytically, so the
        // parameter gradients still see the un-rescaled delta.
        for c in 0..channels {
            let rstd = T::one() / (variance[c] + eps).sqrt();
            self.rstd[c] = rstd;

            let mut delta_sum = T::zero();
            let mut delta_norm_sum = T::zero();
            for b in 0..batch {
                for s in 0..spatial {
                    let idx = b * channels * spatial + c * spatial + s;
                    let normalized = (saved_input[idx] - mean[c]) * rstd;
                    delta_sum += delta[idx];
                    delta_norm_sum += delta[idx] * normalized;
                }
            }

            bias_grad[c] += delta_sum;
            scale_grad[c] += delta_norm_sum;
            mean_grad[c] = -scales[c] * delta_sum * rstd;
            // (variance+ε)^(-1.5) expressed through the precomputed rstd:
            // Σδγ(x-mean) * rstd³ = γ * (Σδ·x̂/rstd) * rstd³ = γ·Σδ·x̂·rstd².
            variance_grad[c] = -half * scales[c] * delta_norm_sum * rstd * rstd;
        }

        // Single transform sweep for the input gradient.
        for b in 0..batch {
            for c in 0..channels {
                for s in 0..spatial {
                    let idx = b * channels * spatial + c * spatial + s;
                    delta[idx] = scales[c] * delta[idx] * self.rstd[c]
                        + variance_grad[c] * two * (saved_input[idx] - mean[c]) * inv_n
                        + mean_grad[c] * inv_n;
                }
            }
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        self.rstd.clear();
    }
}
