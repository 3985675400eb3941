// src/backend/cpu.rs
//
// Reference per-channel normalization kernels over contiguous NCHW slices,
// plus the strategy object that composes them. Every kernel is pure given
// pre-sized output slices: no allocation, no side effects beyond the
// documented writes. Flat indexing convention throughout:
// `index = b*channels*spatial + c*spatial + s`.

use crate::backend::number::NormoxF;
use crate::backend::{
    BackwardPass, Dims, InferPass, NormBackend, TrainPass, CUMULATIVE_ALPHA, ROLLING_DECAY,
};

fn count<T: NormoxF>(n: usize) -> T {
    T::from_usize(n).expect("element count must fit the element type")
}

/// Per-channel mean over the batch and spatial extent:
/// `mean[c] = (1/(batch*spatial)) * Σ input[b,c,s]`.
pub fn channel_mean<T: NormoxF>(
    input: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
    mean: &mut [T],
) {
    debug_assert_eq!(input.len(), batch * channels * spatial);
    debug_assert_eq!(mean.len(), channels);

    let scale = T::one() / count(batch * spatial);
    for c in 0..channels {
        let mut sum = T::zero();
        for b in 0..batch {
            for s in 0..spatial {
                sum += input[b * channels * spatial + c * spatial + s];
            }
        }
        mean[c] = sum * scale;
    }
}

/// Biased (population) per-channel variance — no Bessel correction:
/// `variance[c] = (1/(batch*spatial)) * Σ (input[b,c,s] - mean[c])²`.
pub fn channel_variance<T: NormoxF>(
    input: &[T],
    mean: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
    variance: &mut [T],
) {
    debug_assert_eq!(input.len(), batch * channels * spatial);
    debug_assert_eq!(variance.len(), channels);

    let scale = T::one() / count(batch * spatial);
    for c in 0..channels {
        let mut sum = T::zero();
        for b in 0..batch {
            for s in 0..spatial {
                let diff = input[b * channels * spatial + c * spatial + s] - mean[c];
                sum += diff * diff;
            }
        }
        variance[c] = sum * scale;
    }
}

/// In-place normalization with the given statistics:
/// `x[b,c,s] = (x[b,c,s] - mean[c]) / (sqrt(variance[c]) + ε)`.
/// ε is added after the square root; the backward input-gradient first term
/// uses the same placement.
pub fn normalize<T: NormoxF>(
    x: &mut [T],
    mean: &[T],
    variance: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
) {
    let eps = T::norm_epsilon();
    for b in 0..batch {
        for c in 0..channels {
            let denom = variance[c].sqrt() + eps;
            for s in 0..spatial {
                let idx = b * channels * spatial + c * spatial + s;
                x[idx] = (x[idx] - mean[c]) / denom;
            }
        }
    }
}

/// In-place per-channel scaling: `x[b,c,s] *= scales[c]`.
pub fn apply_scale<T: NormoxF>(
    x: &mut [T],
    scales: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
) {
    for b in 0..batch {
        for c in 0..channels {
            for s in 0..spatial {
                x[b * channels * spatial + c * spatial + s] *= scales[c];
            }
        }
    }
}

/// In-place per-channel bias: `x[b,c,s] += biases[c]`.
pub fn apply_bias<T: NormoxF>(
    x: &mut [T],
    biases: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
) {
    for b in 0..batch {
        for c in 0..channels {
            for s in 0..spatial {
                x[b * channels * spatial + c * spatial + s] += biases[c];
            }
        }
    }
}

/// Accumulates the scale gradient:
/// `scale_grad[c] += Σ delta[b,c,s] * normalized[b,c,s]`.
/// Accumulates rather than overwrites — the optimizer decays the
/// accumulator instead of clearing it.
pub fn scale_gradient<T: NormoxF>(
    normalized: &[T],
    delta: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
    scale_grad: &mut [T],
) {
    debug_assert_eq!(normalized.len(), delta.len());
    for c in 0..channels {
        let mut sum = T::zero();
        for b in 0..batch {
            for s in 0..spatial {
                let idx = b * channels * spatial + c * spatial + s;
                sum += delta[idx] * normalized[idx];
            }
        }
        scale_grad[c] += sum;
    }
}

/// Accumulates the bias gradient: `bias_grad[c] += Σ delta[b,c,s]`.
pub fn bias_gradient<T: NormoxF>(
    bias_grad: &mut [T],
    delta: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
) {
    for c in 0..channels {
        let mut sum = T::zero();
        for b in 0..batch {
            for s in 0..spatial {
                sum += delta[b * channels * spatial + c * spatial + s];
            }
        }
        bias_grad[c] += sum;
    }
}

/// Gradient of the loss w.r.t. the per-channel mean:
/// `mean_grad[c] = (-1/sqrt(variance[c]+ε)) * Σ delta[b,c,s]`.
/// Deliberately omits the variance cross-term of the full derivation;
/// Σ(x-mean) is identically zero over the batch, so the omitted term only
/// ever carries rounding noise. Changing this formula changes trained-model
/// behavior — it pairs with `input_gradient` below.
pub fn mean_gradient<T: NormoxF>(
    delta: &[T],
    variance: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
    mean_grad: &mut [T],
) {
    let eps = T::variance_epsilon();
    for c in 0..channels {
        let mut sum = T::zero();
        for b in 0..batch {
            for s in 0..spatial {
                sum += delta[b * channels * spatial + c * spatial + s];
            }
        }
        mean_grad[c] = sum * (-T::one() / (variance[c] + eps).sqrt());
    }
}

/// Gradient of the loss w.r.t. the per-channel variance:
/// `variance_grad[c] = -0.5 * Σ delta[b,c,s]*(x[b,c,s]-mean[c]) * (variance[c]+ε)^(-1.5)`.
/// ε goes inside the power, unlike the normalize denominator.
pub fn variance_gradient<T: NormoxF>(
    x: &[T],
    delta: &[T],
    mean: &[T],
    variance: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
    variance_grad: &mut [T],
) {
    let eps = T::variance_epsilon();
    let half = T::from_f64(0.5).expect("constant must fit the element type");
    let exp = T::from_f64(-1.5).expect("constant must fit the element type");
    for c in 0..channels {
        let mut sum = T::zero();
        for b in 0..batch {
            for s in 0..spatial {
                let idx = b * channels * spatial + c * spatial + s;
                sum += delta[idx] * (x[idx] - mean[c]);
            }
        }
        variance_grad[c] = -half * sum * (variance[c] + eps).powf(exp);
    }
}

/// Rewrites `delta` in place with the gradient w.r.t. the raw input:
/// `delta[b,c,s] = delta[b,c,s]/(sqrt(variance[c])+ε)
///              + variance_grad[c]*2*(x[b,c,s]-mean[c])/(batch*spatial)
///              + mean_grad[c]/(batch*spatial)`.
/// Consumes and produces the same buffer. Note the ε placement in the first
/// term matches `normalize`, not `mean_gradient`.
#[allow(clippy::too_many_arguments)]
pub fn input_gradient<T: NormoxF>(
    x: &[T],
    mean: &[T],
    variance: &[T],
    mean_grad: &[T],
    variance_grad: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
    delta: &mut [T],
) {
    let eps = T::norm_epsilon();
    let two = T::from_f64(2.0).expect("constant must fit the element type");
    let inv_n = T::one() / count::<T>(batch * spatial);
    for b in 0..batch {
        for c in 0..channels {
            let denom = variance[c].sqrt() + eps;
            for s in 0..spatial {
                let idx = b * channels * spatial + c * spatial + s;
                delta[idx] = delta[idx] / denom
                    + variance_grad[c] * two * (x[idx] - mean[c]) * inv_n
                    + mean_grad[c] * inv_n;
            }
        }
    }
}

/// `y[i] += alpha * x[i]`
pub fn axpy<T: NormoxF>(alpha: T, x: &[T], y: &mut [T]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * *xi;
    }
}

/// `x[i] *= alpha`
pub fn scal<T: NormoxF>(alpha: T, x: &mut [T]) {
    for xi in x.iter_mut() {
        *xi *= alpha;
    }
}

/// `x[i] = value`
pub fn fill<T: NormoxF>(x: &mut [T], value: T) {
    for xi in x.iter_mut() {
        *xi = value;
    }
}

/// Folds the per-batch statistics into the rolling estimates:
/// `rolling[c] = decay*rolling[c] + (1-decay)*stat[c]`.
pub fn rolling_update<T: NormoxF>(
    decay: T,
    mean: &[T],
    variance: &[T],
    rolling_mean: &mut [T],
    rolling_variance: &mut [T],
) {
    scal(decay, rolling_mean);
    axpy(T::one() - decay, mean, rolling_mean);
    scal(decay, rolling_variance);
    axpy(T::one() - decay, variance, rolling_variance);
}

/// Cumulative variant: blend the per-batch statistics into the running
/// estimates, then overwrite the working statistics with those estimates so
/// backward sees the values that were actually applied. The working variance
/// is floored at zero on the way out.
pub fn cumulative_update<T: NormoxF>(
    alpha: T,
    mean: &mut [T],
    variance: &mut [T],
    mean_avg: &mut [T],
    variance_avg: &mut [T],
) {
    scal(T::one() - alpha, mean_avg);
    axpy(alpha, mean, mean_avg);
    scal(T::one() - alpha, variance_avg);
    axpy(alpha, variance, variance_avg);

    mean.copy_from_slice(mean_avg);
    for (v, avg) in variance.iter_mut().zip(variance_avg.iter()) {
        *v = avg.max(T::zero());
    }
}

/// Replaces every NaN/Inf entry with zero and reports how many were
/// repaired. Opt-in: nothing in the forward/backward chain calls this
/// unless the execution context asks for it.
pub fn sanitize_nonfinite<T: NormoxF>(x: &mut [T]) -> usize {
    let mut repaired = 0;
    for v in x.iter_mut() {
        if !v.is_finite() {
            *v = T::zero();
            repaired += 1;
        }
    }
    repaired
}

/// Counts NaN/Inf entries without modifying anything.
pub fn count_nonfinite<T: NormoxF>(x: &[T]) -> usize {
    x.iter().filter(|v| !v.is_finite()).count()
}

/// Gradient of the frozen-statistics transform w.r.t. `x`:
/// `delta[b,c,s] *= scales[c] / sqrt(variance[c] + ε)`.
/// ε sits inside the square root here, this is the reciprocal-stddev form.
pub fn inference_gradient<T: NormoxF>(
    delta: &mut [T],
    scales: &[T],
    variance: &[T],
    batch: usize,
    channels: usize,
    spatial: usize,
) {
    let eps = T::variance_epsilon();
    for b in 0..batch {
        for c in 0..channels {
            let factor = scales[c] / (variance[c] + eps).sqrt();
            for s in 0..spatial {
                delta[b * channels * spatial + c * spatial + s] *= factor;
            }
        }
    }
}

/// Reference compute strategy: two-pass statistics, separate
/// normalize/scale/bias sweeps, 0.9 rolling decay. This is the yardstick
/// the fused paths are measured against.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceNorm;

impl<T: NormoxF> NormBackend<T> for ReferenceNorm {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn default_decay(&self) -> T {
        T::from_f64(ROLLING_DECAY).expect("decay constant must fit the element type")
    }

    fn forward_train(&mut self, pass: TrainPass<'_, T>) -> Result<(), String> {
        let TrainPass {
            dims,
            decay,
            cumulative,
            output,
            saved_input,
            saved_normalized,
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

        saved_input.copy_from_slice(output);
        channel_mean(output, batch, channels, spatial, mean);
        channel_variance(output, mean, batch, channels, spatial, variance);

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

        normalize(output, mean, variance, batch, channels, spatial);
        saved_normalized.copy_from_slice(output);
        apply_scale(output, scales, batch, channels, spatial);
        apply_bias(output, biases, batch, channels, spatial);
        Ok(())
    }

    fn forward_infer(&mut self, pass: InferPass<'_, T>) -> Result<(), String> {
        let InferPass { dims, output, rolling_mean, rolling_variance, scales, biases } = pass;
        let Dims { batch, channels, spatial } = dims;

        normalize(output, rolling_mean, rolling_variance, batch, channels, spatial);
        apply_scale(output, scales, batch, channels, spatial);
        apply_bias(output, biases, batch, channels, spatial);
        Ok(())
    }

    fn backward(&mut self, pass: BackwardPass<'_, T>) -> Result<(), String> {
        let BackwardPass {
            dims,
            delta,
            saved_input,
            saved_normalized,
            mean,
            variance,
            mean_grad,
            variance_grad,
            scale_grad,
            bias_grad,
            scales,
        } = pass;
        let Dims { batch, channels, spatial } = dims;

        // Dependency order matters: the parameter gradients consume the
        // un-rescaled delta, the statistic gradients consume the rescaled one.
        scale_gradient(saved_normalized, delta, batch, channels, spatial, scale_grad);
        bias_gradient(bias_grad, delta, batch, channels, spatial);
        apply_scale(delta, scales, batch, channels, spatial);
        mean_gradient(delta, variance, batch, channels, spatial, mean_grad);
        variance_gradient(
            saved_input,
            delta,
            mean,
            variance,
            batch,
            channels,
            spatial,
            variance_grad,
        );
        input_gradient(
            saved_input,
            mean,
            variance,
            mean_grad,
            variance_grad,
            batch,
            channels,
            spatial,
            delta,
        );
        Ok(())
    }
}
