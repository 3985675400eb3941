// src/nn/batchnorm.rs
//
// Batch-normalization layer over NCHW activations. The layer owns every
// buffer (parameters, statistics, activations) as host ndarray storage; the
// compute strategy only ever sees borrowed slices through the pass structs,
// so reference, fused and device paths are swappable per layer without any
// caller change.

use crate::backend::cpu::{axpy, count_nonfinite, inference_gradient, sanitize_nonfinite, scal};
use crate::backend::number::{NormoxCudaF, NormoxF};
use crate::backend::{
    create_backend, default_backend, Backend, BackwardPass, Dims, InferPass, NormBackend,
    Subdivision, TrainPass,
};
use crate::nn::{ExecutionContext, LayerError};
use ndarray::{Array, Array1, ArrayD, ArrayView1, ArrayViewD, ArrayViewMutD, Dimension, IxDyn};

/// Whether the layer stands alone in the network graph or is embedded as the
/// normalization stage of a host layer (convolutional or fully connected).
/// Standalone layers copy their input into `output` on forward and their
/// input gradient into the upstream buffer on backward; embedded layers work
/// on buffers the host stages in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Standalone,
    Embedded,
}

#[derive(Debug)]
pub struct BatchNorm<T: NormoxCudaF> {
    kind: LayerKind,
    batch: usize,
    channels: usize,
    width: usize,
    height: usize,
    /// Default mode; an execution context can override it per pass.
    train: bool,
    /// Rolling decay override. `None` defers to the strategy's default
    /// (0.9 reference, 0.99 fused/device).
    decay: Option<T>,
    cumulative: bool,
    backend: Backend,
    strategy: Box<dyn NormBackend<T>>,

    scales: Array1<T>,
    biases: Array1<T>,
    scale_grad: Array1<T>,
    bias_grad: Array1<T>,

    mean: Array1<T>,
    variance: Array1<T>,
    mean_avg: Array1<T>,
    variance_avg: Array1<T>,
    rolling_mean: Array1<T>,
    rolling_variance: Array1<T>,
    mean_grad: Array1<T>,
    variance_grad: Array1<T>,

    output: ArrayD<T>,
    delta: ArrayD<T>,
    saved_input: ArrayD<T>,
    saved_normalized: ArrayD<T>,
}

fn checked_elements(
    what: &'static str,
    batch: usize,
    channels: usize,
    height: usize,
    width: usize,
) -> Result<usize, LayerError> {
    height
        .checked_mul(width)
        .and_then(|s| s.checked_mul(channels))
        .and_then(|n| n.checked_mul(batch))
        .ok_or(LayerError::Allocation { what, shape: [batch, channels, height, width] })
}

fn slice<'a, T: NormoxF, D: Dimension>(
    array: &'a Array<T, D>,
    what: &'static str,
) -> Result<&'a [T], LayerError> {
    array
        .as_slice()
        .ok_or_else(|| LayerError::Backend(format!("{} buffer is not contiguous", what)))
}

fn slice_mut<'a, T: NormoxF, D: Dimension>(
    array: &'a mut Array<T, D>,
    what: &'static str,
) -> Result<&'a mut [T], LayerError> {
    array
        .as_slice_mut()
        .ok_or_else(|| LayerError::Backend(format!("{} buffer is not contiguous", what)))
}

impl<T: NormoxCudaF> BatchNorm<T> {
    /// Standalone normalization layer over a `batch x channels x height x
    /// width` activation tensor.
    pub fn new(
        batch: usize,
        width: usize,
        height: usize,
        channels: usize,
        train: bool,
    ) -> Result<Self, LayerError> {
        Self::with_kind(LayerKind::Standalone, batch, width, height, channels, train)
    }

    /// Normalization stage embedded in a convolutional host layer.
    pub fn embedded(
        batch: usize,
        width: usize,
        height: usize,
        channels: usize,
        train: bool,
    ) -> Result<Self, LayerError> {
        Self::with_kind(LayerKind::Embedded, batch, width, height, channels, train)
    }

    /// Embedded variant for a fully connected host: one channel per output
    /// neuron over a 1x1 spatial extent.
    pub fn for_connected(batch: usize, outputs: usize, train: bool) -> Result<Self, LayerError> {
        Self::with_kind(LayerKind::Embedded, batch, 1, 1, outputs, train)
    }

    fn with_kind(
        kind: LayerKind,
        batch: usize,
        width: usize,
        height: usize,
        channels: usize,
        train: bool,
    ) -> Result<Self, LayerError> {
        checked_elements("activation buffers", batch, channels, height, width)?;

        // Prefer the build's default backend, but a missing accelerator must
        // not make construction fail on machines without one.
        let (backend, strategy) = match create_backend::<T>(default_backend()) {
            Ok(strategy) => (default_backend(), strategy),
            Err(e) => {
                log::warn!(
                    "batchnorm backend {} unavailable ({}), falling back to reference",
                    default_backend(),
                    e
                );
                (Backend::Reference, create_backend::<T>(Backend::Reference).map_err(LayerError::Backend)?)
            }
        };

        let shape = IxDyn(&[batch, channels, height, width]);
        let zeros1 = || Array1::from_elem(channels, T::zero());
        let zeros4 = || ArrayD::from_elem(shape.clone(), T::zero());

        log::debug!(
            "batchnorm layer: {} x {} x {} image, {} backend",
            width,
            height,
            channels,
            backend
        );

        Ok(Self {
            kind,
            batch,
            channels,
            width,
            height,
            train,
            decay: None,
            cumulative: false,
            backend,
            strategy,
            scales: Array1::from_elem(channels, T::one()),
            biases: zeros1(),
            scale_grad: zeros1(),
            bias_grad: zeros1(),
            mean: zeros1(),
            variance: zeros1(),
            mean_avg: zeros1(),
            variance_avg: zeros1(),
            rolling_mean: zeros1(),
            rolling_variance: zeros1(),
            mean_grad: zeros1(),
            variance_grad: zeros1(),
            output: zeros4(),
            delta: zeros4(),
            saved_input: zeros4(),
            saved_normalized: zeros4(),
        })
    }

    /// Routes compute through an explicitly chosen strategy. Unlike the
    /// constructor default there is no fallback: asking for an unreachable
    /// device is an error.
    pub fn with_backend(mut self, backend: Backend) -> Result<Self, LayerError> {
        self.strategy = create_backend(backend).map_err(LayerError::Backend)?;
        self.backend = backend;
        Ok(self)
    }

    /// Pins the rolling decay instead of the strategy default. Mixing decays
    /// across train/resume cycles corrupts the running estimates, so pick one
    /// per deployment and keep it.
    pub fn with_decay(mut self, decay: T) -> Self {
        self.decay = Some(decay);
        self
    }

    /// Switches statistics to the cumulative variant: batch statistics are
    /// blended into persistent averages and those averages drive the
    /// normalization, with the rolling estimates refreshed once per full
    /// accumulation cycle.
    pub fn with_cumulative(mut self) -> Self {
        self.cumulative = true;
        self
    }

    // ============= ACCESSORS =============

    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Per-sample input element count; identity spatial mapping, so equal to
    /// `outputs()`.
    pub fn inputs(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn outputs(&self) -> usize {
        self.inputs()
    }

    /// Effective rolling decay for the next training pass.
    pub fn decay(&self) -> T {
        self.decay.unwrap_or_else(|| self.strategy.default_decay())
    }

    pub fn output(&self) -> ArrayViewD<'_, T> {
        self.output.view()
    }

    /// Embedded hosts stage their raw activations here before `forward`.
    pub fn output_mut(&mut self) -> ArrayViewMutD<'_, T> {
        self.output.view_mut()
    }

    pub fn delta(&self) -> ArrayViewD<'_, T> {
        self.delta.view()
    }

    /// The upstream gradient is staged here before `backward`.
    pub fn delta_mut(&mut self) -> ArrayViewMutD<'_, T> {
        self.delta.view_mut()
    }

    pub fn scales(&self) -> ArrayView1<'_, T> {
        self.scales.view()
    }

    pub fn biases(&self) -> ArrayView1<'_, T> {
        self.biases.view()
    }

    pub fn scale_grad(&self) -> ArrayView1<'_, T> {
        self.scale_grad.view()
    }

    pub fn bias_grad(&self) -> ArrayView1<'_, T> {
        self.bias_grad.view()
    }

    pub fn mean(&self) -> ArrayView1<'_, T> {
        self.mean.view()
    }

    pub fn variance(&self) -> ArrayView1<'_, T> {
        self.variance.view()
    }

    pub fn rolling_mean(&self) -> ArrayView1<'_, T> {
        self.rolling_mean.view()
    }

    pub fn rolling_variance(&self) -> ArrayView1<'_, T> {
        self.rolling_variance.view()
    }

    pub fn saved_normalized(&self) -> ArrayViewD<'_, T> {
        self.saved_normalized.view()
    }

    fn dims(&self) -> Dims {
        Dims { batch: self.batch, channels: self.channels, spatial: self.height * self.width }
    }

    // ============= FORWARD / BACKWARD / UPDATE =============

    pub fn forward(&mut self, ctx: &ExecutionContext<'_, T>) -> Result<(), LayerError> {
        let dims = self.dims();
        let elements = dims.elements();

        if self.kind == LayerKind::Standalone {
            let input = ctx
                .input
                .ok_or(LayerError::ShapeMismatch { expected: elements, got: 0 })?;
            if input.len() != elements {
                return Err(LayerError::ShapeMismatch { expected: elements, got: input.len() });
            }
            slice_mut(&mut self.output, "output")?.copy_from_slice(input);
        }

        if ctx.adversarial {
            // Adversarial samples are normalized with the frozen rolling
            // statistics and must not disturb any accumulator, even when the
            // context asks for training.
            return self.run_infer(dims);
        }

        if ctx.train.unwrap_or(self.train) {
            self.run_train(dims, ctx.subdivision)
        } else {
            self.run_infer(dims)
        }
    }

    fn run_train(&mut self, dims: Dims, subdivision: Option<Subdivision>) -> Result<(), LayerError> {
        let decay = self.decay.unwrap_or_else(|| self.strategy.default_decay());
        let cumulative = if self.cumulative {
            Some(subdivision.unwrap_or(Subdivision { index: 0, total: 1 }))
        } else {
            None
        };

        let pass = TrainPass {
            dims,
            decay,
            cumulative,
            output: slice_mut(&mut self.output, "output")?,
            saved_input: slice_mut(&mut self.saved_input, "saved_input")?,
            saved_normalized: slice_mut(&mut self.saved_normalized, "saved_normalized")?,
            mean: slice_mut(&mut self.mean, "mean")?,
            variance: slice_mut(&mut self.variance, "variance")?,
            mean_avg: slice_mut(&mut self.mean_avg, "mean_avg")?,
            variance_avg: slice_mut(&mut self.variance_avg, "variance_avg")?,
            rolling_mean: slice_mut(&mut self.rolling_mean, "rolling_mean")?,
            rolling_variance: slice_mut(&mut self.rolling_variance, "rolling_variance")?,
            scales: slice(&self.scales, "scales")?,
            biases: slice(&self.biases, "biases")?,
        };
        self.strategy.forward_train(pass).map_err(LayerError::Backend)
    }

    fn run_infer(&mut self, dims: Dims) -> Result<(), LayerError> {
        let pass = InferPass {
            dims,
            output: slice_mut(&mut self.output, "output")?,
            rolling_mean: slice(&self.rolling_mean, "rolling_mean")?,
            rolling_variance: slice(&self.rolling_variance, "rolling_variance")?,
            scales: slice(&self.scales, "scales")?,
            biases: slice(&self.biases, "biases")?,
        };
        self.strategy.forward_infer(pass).map_err(LayerError::Backend)
    }

    pub fn backward(&mut self, ctx: &mut ExecutionContext<'_, T>) -> Result<(), LayerError> {
        let dims = self.dims();
        let elements = dims.elements();

        if ctx.adversarial {
            // The adversarial forward froze the statistics, so the gradient
            // is just the frozen transform's: delta *= scale/sqrt(rolling+ε).
            inference_gradient(
                slice_mut(&mut self.delta, "delta")?,
                slice(&self.scales, "scales")?,
                slice(&self.rolling_variance, "rolling_variance")?,
                dims.batch,
                dims.channels,
                dims.spatial,
            );
        } else {
            if !ctx.train.unwrap_or(self.train) {
                // An inference forward never wrote the per-batch statistics;
                // the chain runs against the rolling ones instead.
                self.mean.assign(&self.rolling_mean);
                self.variance.assign(&self.rolling_variance);
            }

            let pass = BackwardPass {
                dims,
                delta: slice_mut(&mut self.delta, "delta")?,
                saved_input: slice(&self.saved_input, "saved_input")?,
                saved_normalized: slice(&self.saved_normalized, "saved_normalized")?,
                mean: slice(&self.mean, "mean")?,
                variance: slice(&self.variance, "variance")?,
                mean_grad: slice_mut(&mut self.mean_grad, "mean_grad")?,
                variance_grad: slice_mut(&mut self.variance_grad, "variance_grad")?,
                scale_grad: slice_mut(&mut self.scale_grad, "scale_grad")?,
                bias_grad: slice_mut(&mut self.bias_grad, "bias_grad")?,
                scales: slice(&self.scales, "scales")?,
            };
            self.strategy.backward(pass).map_err(LayerError::Backend)?;

            if ctx.sanitize_gradients {
                let repaired = sanitize_nonfinite(slice_mut(&mut self.scale_grad, "scale_grad")?)
                    + sanitize_nonfinite(slice_mut(&mut self.bias_grad, "bias_grad")?);
                if repaired > 0 {
                    log::warn!(
                        "batchnorm backward repaired {} non-finite gradient entries",
                        repaired
                    );
                }
            }
        }

        if self.kind == LayerKind::Standalone {
            if let Some(upstream) = ctx.upstream_delta.as_deref_mut() {
                if upstream.len() != elements {
                    return Err(LayerError::ShapeMismatch {
                        expected: elements,
                        got: upstream.len(),
                    });
                }
                upstream.copy_from_slice(slice(&self.delta, "delta")?);
            }
        }
        Ok(())
    }

    /// Momentum-SGD step for the two parameter vectors this layer owns:
    /// apply `learning_rate/batch` times the accumulated gradient, then decay
    /// the accumulator by `momentum`. Weight decay is accepted for interface
    /// symmetry with other layer kinds but never applied to normalization
    /// parameters.
    pub fn update(
        &mut self,
        batch: usize,
        learning_rate: T,
        momentum: T,
        _weight_decay: T,
    ) -> Result<(), LayerError> {
        let rate =
            learning_rate / T::from_usize(batch).expect("batch count must fit the element type");

        axpy(rate, slice(&self.bias_grad, "bias_grad")?, slice_mut(&mut self.biases, "biases")?);
        scal(momentum, slice_mut(&mut self.bias_grad, "bias_grad")?);

        axpy(rate, slice(&self.scale_grad, "scale_grad")?, slice_mut(&mut self.scales, "scales")?);
        scal(momentum, slice_mut(&mut self.scale_grad, "scale_grad")?);
        Ok(())
    }

    /// Reallocates the four activation buffers for a new spatial resolution,
    /// preserving no content. Parameters and statistics are per channel and
    /// survive untouched. Backend scratch is invalidated.
    pub fn resize(&mut self, width: usize, height: usize) -> Result<(), LayerError> {
        let elements =
            checked_elements("activation buffers", self.batch, self.channels, height, width)?;
        self.width = width;
        self.height = height;

        let shape = IxDyn(&[self.batch, self.channels, height, width]);
        self.output = ArrayD::from_elem(shape.clone(), T::zero());
        self.delta = ArrayD::from_elem(shape.clone(), T::zero());
        self.saved_input = ArrayD::from_elem(shape.clone(), T::zero());
        self.saved_normalized = ArrayD::from_elem(shape, T::zero());
        self.strategy.invalidate();

        log::debug!(
            "batchnorm layer resized to {} x {} x {} ({} elements)",
            width,
            height,
            self.channels,
            elements
        );
        Ok(())
    }

    // ============= PERSISTED STATE =============

    /// Appends the persisted parameter arrays in their fixed order: biases,
    /// scales, rolling mean, rolling variance.
    pub fn write_state(&self, out: &mut Vec<T>) -> Result<(), LayerError> {
        out.extend_from_slice(slice(&self.biases, "biases")?);
        out.extend_from_slice(slice(&self.scales, "scales")?);
        out.extend_from_slice(slice(&self.rolling_mean, "rolling_mean")?);
        out.extend_from_slice(slice(&self.rolling_variance, "rolling_variance")?);
        Ok(())
    }

    /// Restores the persisted arrays from a blob prefix written by
    /// [`write_state`](Self::write_state); returns the number of elements
    /// consumed so a persistence collaborator can walk a larger stream.
    pub fn read_state(&mut self, data: &[T]) -> Result<usize, LayerError> {
        let c = self.channels;
        let needed = 4 * c;
        if data.len() < needed {
            return Err(LayerError::ShapeMismatch { expected: needed, got: data.len() });
        }

        slice_mut(&mut self.biases, "biases")?.copy_from_slice(&data[..c]);
        slice_mut(&mut self.scales, "scales")?.copy_from_slice(&data[c..2 * c]);
        slice_mut(&mut self.rolling_mean, "rolling_mean")?.copy_from_slice(&data[2 * c..3 * c]);
        let rolling_variance = slice_mut(&mut self.rolling_variance, "rolling_variance")?;
        rolling_variance.copy_from_slice(&data[3 * c..needed]);

        // Rolling variance must stay non-negative whatever the blob holds.
        let mut clamped = 0;
        for v in rolling_variance.iter_mut() {
            if *v < T::zero() {
                *v = T::zero();
                clamped += 1;
            }
        }
        if clamped > 0 {
            log::warn!(
                "batchnorm state restored with {} negative rolling-variance entries, clamped to zero",
                clamped
            );
        }
        Ok(needed)
    }

    /// Diagnostic scan over the parameter, gradient and statistic arrays.
    pub fn assert_finite(&self) -> Result<(), LayerError> {
        let arrays: [(&'static str, &Array1<T>); 8] = [
            ("scales", &self.scales),
            ("biases", &self.biases),
            ("scale_grad", &self.scale_grad),
            ("bias_grad", &self.bias_grad),
            ("mean", &self.mean),
            ("variance", &self.variance),
            ("rolling_mean", &self.rolling_mean),
            ("rolling_variance", &self.rolling_variance),
        ];
        for (name, array) in arrays {
            let count = count_nonfinite(slice(array, name)?);
            if count > 0 {
                return Err(LayerError::NumericalInstability { array: name, count });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EPSILON, VARIANCE_EPSILON};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn reference_layer(
        batch: usize,
        width: usize,
        height: usize,
        channels: usize,
        train: bool,
    ) -> BatchNorm<f64> {
        BatchNorm::new(batch, width, height, channels, train)
            .and_then(|l| l.with_backend(Backend::Reference))
            .unwrap()
    }

    fn stage_delta(layer: &mut BatchNorm<f64>, values: &[f64]) {
        layer.delta_mut().as_slice_mut().unwrap().copy_from_slice(values);
    }

    #[test]
    fn two_element_channel_statistics_and_gradients() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        let input = [1.0, 3.0];
        layer
            .forward(&ExecutionContext::new().with_input(&input).with_train(true))
            .unwrap();

        assert_relative_eq!(layer.mean()[0], 2.0);
        assert_relative_eq!(layer.variance()[0], 1.0);
        let expected = 1.0 / (1.0 + EPSILON);
        assert_relative_eq!(layer.output().as_slice().unwrap()[0], -expected, epsilon = 1e-12);
        assert_relative_eq!(layer.output().as_slice().unwrap()[1], expected, epsilon = 1e-12);

        stage_delta(&mut layer, &[1.0, 1.0]);
        layer.backward(&mut ExecutionContext::new().with_train(true)).unwrap();
        assert_abs_diff_eq!(layer.scale_grad()[0], 0.0, epsilon = 1e-9);
        assert_relative_eq!(layer.bias_grad()[0], 2.0);
    }

    #[test]
    fn training_normalization_has_zero_mean_unit_variance() {
        let (batch, channels, height, width) = (4, 3, 2, 2);
        let mut layer = reference_layer(batch, width, height, channels, true);
        let mut rng = StdRng::seed_from_u64(7);
        let normal = Normal::new(1.5, 2.0).unwrap();
        let input: Vec<f64> =
            (0..batch * channels * height * width).map(|_| normal.sample(&mut rng)).collect();
        layer
            .forward(&ExecutionContext::new().with_input(&input).with_train(true))
            .unwrap();

        let normalized = layer.saved_normalized();
        let normalized = normalized.as_slice().unwrap();
        let spatial = height * width;
        let n = (batch * spatial) as f64;
        for c in 0..channels {
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            for b in 0..batch {
                for s in 0..spatial {
                    let v = normalized[b * channels * spatial + c * spatial + s];
                    sum += v;
                    sum_sq += v * v;
                }
            }
            assert_abs_diff_eq!(sum / n, 0.0, epsilon = 1e-9);
            assert_abs_diff_eq!(sum_sq / n, 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn rolling_statistics_converge_geometrically() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        let input = [1.0, 3.0];
        let steps = 5;
        for _ in 0..steps {
            layer
                .forward(&ExecutionContext::new().with_input(&input).with_train(true))
                .unwrap();
        }
        // From a zero start under a constant statistic:
        // rolling after k steps = (1 - decay^k) * statistic.
        let expect = |stat: f64| (1.0 - 0.9f64.powi(steps)) * stat;
        assert_relative_eq!(layer.rolling_mean()[0], expect(2.0), epsilon = 1e-12);
        assert_relative_eq!(layer.rolling_variance()[0], expect(1.0), epsilon = 1e-12);
    }

    #[test]
    fn inference_with_batch_statistics_reproduces_training_output() {
        let input = [0.5, 1.5, 2.0, 4.0, -1.0, 0.0, 3.0, 1.0];

        let mut trained = reference_layer(4, 1, 1, 2, true);
        trained
            .forward(&ExecutionContext::new().with_input(&input).with_train(true))
            .unwrap();
        let train_out = trained.output().as_slice().unwrap().to_vec();

        let mut frozen = reference_layer(4, 1, 1, 2, true);
        let mut state = vec![0.0, 0.0, 1.0, 1.0];
        state.extend_from_slice(trained.mean().as_slice().unwrap());
        state.extend_from_slice(trained.variance().as_slice().unwrap());
        frozen.read_state(&state).unwrap();
        frozen
            .forward(&ExecutionContext::new().with_input(&input).with_train(false))
            .unwrap();

        for (got, want) in frozen.output().as_slice().unwrap().iter().zip(train_out.iter()) {
            assert_relative_eq!(*got, *want, epsilon = 1e-12);
        }
    }

    #[test]
    fn state_blob_round_trips_in_fixed_order() {
        let mut layer = reference_layer(1, 1, 1, 3, true);
        let blob =
            vec![0.1, 0.2, 0.3, 1.1, 1.2, 1.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];
        assert_eq!(layer.read_state(&blob).unwrap(), 12);

        assert_relative_eq!(layer.biases()[2], 0.3);
        assert_relative_eq!(layer.scales()[0], 1.1);
        assert_relative_eq!(layer.rolling_mean()[1], 0.5);
        assert_relative_eq!(layer.rolling_variance()[2], 0.9);

        let mut out = Vec::new();
        layer.write_state(&mut out).unwrap();
        assert_eq!(out, blob);
    }

    #[test]
    fn restored_negative_rolling_variance_is_clamped() {
        let mut layer = reference_layer(1, 1, 1, 1, true);
        layer.read_state(&[0.0, 1.0, 0.0, -0.5]).unwrap();
        assert_eq!(layer.rolling_variance()[0], 0.0);
    }

    #[test]
    fn short_state_blob_is_rejected() {
        let mut layer = reference_layer(1, 1, 1, 3, true);
        let err = layer.read_state(&[0.0; 7]).unwrap_err();
        match err {
            LayerError::ShapeMismatch { expected, got } => {
                assert_eq!(expected, 12);
                assert_eq!(got, 7);
            }
            other => panic!("expected shape mismatch, got {}", other),
        }
    }

    #[test]
    fn gradients_accumulate_across_backward_calls() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        layer
            .forward(&ExecutionContext::new().with_input(&[1.0, 3.0]).with_train(true))
            .unwrap();

        stage_delta(&mut layer, &[1.0, 1.0]);
        layer.backward(&mut ExecutionContext::new().with_train(true)).unwrap();
        let first_mean_grad = layer.mean_grad[0];
        assert_relative_eq!(layer.bias_grad()[0], 2.0);

        // Backward consumes delta in place, so restage it.
        stage_delta(&mut layer, &[1.0, 1.0]);
        layer.backward(&mut ExecutionContext::new().with_train(true)).unwrap();
        assert_relative_eq!(layer.bias_grad()[0], 4.0);
        // Statistic gradients are scratch: recomputed, not accumulated.
        assert_relative_eq!(layer.mean_grad[0], first_mean_grad, epsilon = 1e-12);
    }

    #[test]
    fn update_applies_rate_then_decays_accumulators() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        layer
            .forward(&ExecutionContext::new().with_input(&[1.0, 3.0]).with_train(true))
            .unwrap();
        stage_delta(&mut layer, &[1.0, 1.0]);
        layer.backward(&mut ExecutionContext::new().with_train(true)).unwrap();

        layer.update(2, 0.1, 0.9, 0.0005).unwrap();
        // bias += (0.1/2) * 2.0, then the accumulator decays by 0.9.
        assert_relative_eq!(layer.biases()[0], 0.1, epsilon = 1e-9);
        assert_relative_eq!(layer.bias_grad()[0], 1.8, epsilon = 1e-9);
        // scale_grad was ~0, so the scale stays put and no weight decay bites.
        assert_abs_diff_eq!(layer.scales()[0], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn backward_matches_finite_difference_gradients() {
        let base = [0.5, -1.25, 2.0, 0.75, 3.0, 1.5, -0.5, 0.25];
        let weights = [0.3, -0.7, 1.1, 0.2, -0.4, 0.9, 0.6, -1.3];
        let state = [0.2, -0.1, 1.3, 0.7, 0.0, 0.0, 0.0, 0.0];

        let loss = |layer: &mut BatchNorm<f64>, input: &[f64]| -> f64 {
            layer
                .forward(&ExecutionContext::new().with_input(input).with_train(true))
                .unwrap();
            layer
                .output()
                .as_slice()
                .unwrap()
                .iter()
                .zip(weights.iter())
                .map(|(y, w)| y * w)
                .sum()
        };

        let mut layer = reference_layer(2, 2, 1, 2, true);
        layer.read_state(&state).unwrap();
        loss(&mut layer, &base);
        stage_delta(&mut layer, &weights);
        layer.backward(&mut ExecutionContext::new().with_train(true)).unwrap();
        let analytic_input = layer.delta().as_slice().unwrap().to_vec();
        let analytic_scale = layer.scale_grad().to_vec();
        let analytic_bias = layer.bias_grad().to_vec();

        let h = 1e-5;
        for i in 0..base.len() {
            let mut plus = base;
            plus[i] += h;
            let mut minus = base;
            minus[i] -= h;
            let numeric = (loss(&mut layer, &plus) - loss(&mut layer, &minus)) / (2.0 * h);
            assert_relative_eq!(analytic_input[i], numeric, max_relative = 1e-3, epsilon = 1e-6);
        }

        for c in 0..2 {
            let mut plus = state;
            plus[2 + c] += h;
            let mut minus = state;
            minus[2 + c] -= h;
            layer.read_state(&plus).unwrap();
            let up = loss(&mut layer, &base);
            layer.read_state(&minus).unwrap();
            let down = loss(&mut layer, &base);
            assert_relative_eq!(
                analytic_scale[c],
                (up - down) / (2.0 * h),
                max_relative = 1e-3,
                epsilon = 1e-6
            );

            let mut plus = state;
            plus[c] += h;
            let mut minus = state;
            minus[c] -= h;
            layer.read_state(&plus).unwrap();
            let up = loss(&mut layer, &base);
            layer.read_state(&minus).unwrap();
            let down = loss(&mut layer, &base);
            assert_relative_eq!(
                analytic_bias[c],
                (up - down) / (2.0 * h),
                max_relative = 1e-3,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn resize_preserves_parameters_and_reallocates_buffers() {
        let mut layer = reference_layer(2, 2, 2, 3, true);
        let blob: Vec<f64> = (0..12).map(|i| i as f64 * 0.25).collect();
        layer.read_state(&blob).unwrap();

        layer.resize(4, 3).unwrap();
        assert_eq!(layer.output().len(), 2 * 3 * 4 * 3);
        assert_eq!(layer.delta().len(), 2 * 3 * 4 * 3);
        assert_eq!(layer.outputs(), 3 * 4 * 3);
        assert!(layer.output().iter().all(|v| *v == 0.0));

        let mut state = Vec::new();
        layer.write_state(&mut state).unwrap();
        assert_eq!(state, blob);
    }

    #[test]
    fn oversized_shapes_are_rejected() {
        let err = BatchNorm::<f64>::new(usize::MAX, 2, 2, 2, true).unwrap_err();
        assert!(matches!(err, LayerError::Allocation { .. }));

        let mut layer = reference_layer(2, 2, 2, 3, true);
        let err = layer.resize(usize::MAX, 2).unwrap_err();
        assert!(matches!(err, LayerError::Allocation { .. }));
    }

    #[test]
    fn inference_forward_keeps_training_state_untouched() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        layer.read_state(&[0.5, 2.0, 1.0, 4.0]).unwrap();
        layer
            .forward(&ExecutionContext::new().with_input(&[3.0, 5.0]).with_train(false))
            .unwrap();

        let denom = 4.0f64.sqrt() + EPSILON;
        assert_relative_eq!(
            layer.output().as_slice().unwrap()[0],
            (3.0 - 1.0) / denom * 2.0 + 0.5,
            epsilon = 1e-12
        );
        assert!(layer.saved_normalized().iter().all(|v| *v == 0.0));
        assert_relative_eq!(layer.rolling_mean()[0], 1.0);
        assert_eq!(layer.mean()[0], 0.0);
    }

    #[test]
    fn adversarial_pass_freezes_statistics_and_uses_frozen_gradient() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        layer.read_state(&[0.0, 2.0, 1.0, 4.0]).unwrap();
        let ctx = ExecutionContext::new()
            .with_input(&[3.0, 5.0])
            .with_train(true)
            .with_adversarial(true);
        layer.forward(&ctx).unwrap();

        // Training was requested, yet nothing moved.
        assert_relative_eq!(layer.rolling_mean()[0], 1.0);
        assert_eq!(layer.mean()[0], 0.0);
        assert!(layer.saved_normalized().iter().all(|v| *v == 0.0));

        stage_delta(&mut layer, &[1.0, 2.0]);
        let mut bctx = ExecutionContext::new().with_train(true).with_adversarial(true);
        layer.backward(&mut bctx).unwrap();

        let factor = 2.0 / (4.0 + VARIANCE_EPSILON).sqrt();
        assert_relative_eq!(layer.delta().as_slice().unwrap()[0], factor, epsilon = 1e-12);
        assert_relative_eq!(layer.delta().as_slice().unwrap()[1], 2.0 * factor, epsilon = 1e-12);
        assert_eq!(layer.bias_grad()[0], 0.0);
        assert_eq!(layer.scale_grad()[0], 0.0);
    }

    #[test]
    fn inference_backward_substitutes_rolling_statistics() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        layer.read_state(&[0.0, 1.0, 5.0, 9.0]).unwrap();
        layer
            .forward(&ExecutionContext::new().with_input(&[1.0, 3.0]).with_train(true))
            .unwrap();
        // rolling = 0.9*old + 0.1*batch
        assert_relative_eq!(layer.rolling_mean()[0], 4.7, epsilon = 1e-12);
        assert_relative_eq!(layer.rolling_variance()[0], 8.2, epsilon = 1e-12);

        stage_delta(&mut layer, &[1.0, 1.0]);
        layer.backward(&mut ExecutionContext::new().with_train(false)).unwrap();
        assert_relative_eq!(layer.mean()[0], 4.7, epsilon = 1e-12);
        assert_relative_eq!(layer.variance()[0], 8.2, epsilon = 1e-12);
    }

    #[test]
    fn wrong_input_length_is_rejected_before_any_write() {
        let mut layer = reference_layer(2, 2, 2, 3, true);
        let short = vec![0.0; 5];
        let err = layer
            .forward(&ExecutionContext::new().with_input(&short).with_train(true))
            .unwrap_err();
        match err {
            LayerError::ShapeMismatch { expected, got } => {
                assert_eq!(expected, 2 * 3 * 2 * 2);
                assert_eq!(got, 5);
            }
            other => panic!("expected shape mismatch, got {}", other),
        }
        assert!(layer.output().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn embedded_layer_normalizes_staged_output_in_place() {
        let mut layer = BatchNorm::<f64>::embedded(2, 1, 1, 2, true)
            .and_then(|l| l.with_backend(Backend::Reference))
            .unwrap();
        layer
            .output_mut()
            .as_slice_mut()
            .unwrap()
            .copy_from_slice(&[1.0, 10.0, 3.0, 30.0]);
        // No staged context input: embedded layers read their own output.
        layer.forward(&ExecutionContext::new().with_train(true)).unwrap();

        assert_relative_eq!(layer.mean()[0], 2.0);
        assert_relative_eq!(layer.mean()[1], 20.0);
        let out = layer.output().as_slice().unwrap().to_vec();
        assert_abs_diff_eq!(out[0], -1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(out[1], -1.0, epsilon = 1e-4);
    }

    #[test]
    fn standalone_backward_copies_delta_upstream() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        layer
            .forward(&ExecutionContext::new().with_input(&[1.0, 3.0]).with_train(true))
            .unwrap();
        stage_delta(&mut layer, &[1.0, 1.0]);

        let mut upstream = vec![7.0, 7.0];
        let mut ctx =
            ExecutionContext::new().with_train(true).with_upstream_delta(&mut upstream);
        layer.backward(&mut ctx).unwrap();

        assert_eq!(upstream.as_slice(), layer.delta().as_slice().unwrap());
        // A constant shift of the input leaves the normalized output alone,
        // so a uniform delta comes back as (nearly) zero input gradient.
        assert_abs_diff_eq!(upstream[0], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn cumulative_statistics_refresh_rolling_on_last_subdivision_only() {
        let mut layer = reference_layer(2, 1, 1, 1, true).with_cumulative();

        layer
            .forward(
                &ExecutionContext::new()
                    .with_input(&[1.0, 3.0])
                    .with_train(true)
                    .with_subdivision(Subdivision { index: 0, total: 2 }),
            )
            .unwrap();
        // Working statistics now hold the blended averages, not the batch's.
        assert_relative_eq!(layer.mean()[0], 0.02, epsilon = 1e-12);
        assert_relative_eq!(layer.variance()[0], 0.01, epsilon = 1e-12);
        assert_eq!(layer.rolling_mean()[0], 0.0);

        layer
            .forward(
                &ExecutionContext::new()
                    .with_input(&[5.0, 9.0])
                    .with_train(true)
                    .with_subdivision(Subdivision { index: 1, total: 2 }),
            )
            .unwrap();
        // avg = 0.99*previous + 0.01*batch: mean 0.99*0.02 + 0.07, variance
        // 0.99*0.01 + 0.04.
        assert_relative_eq!(layer.mean()[0], 0.0898, epsilon = 1e-12);
        assert_relative_eq!(layer.variance()[0], 0.0499, epsilon = 1e-12);
        // Rolling refreshed once, from the cumulative estimate.
        assert_relative_eq!(layer.rolling_mean()[0], 0.1 * 0.0898, epsilon = 1e-12);
    }

    #[test]
    fn sanitize_flag_repairs_poisoned_gradients() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        layer
            .forward(&ExecutionContext::new().with_input(&[1.0, 3.0]).with_train(true))
            .unwrap();
        stage_delta(&mut layer, &[f64::NAN, 1.0]);
        layer
            .backward(&mut ExecutionContext::new().with_train(true).with_sanitize_gradients(true))
            .unwrap();

        assert_eq!(layer.bias_grad()[0], 0.0);
        assert_eq!(layer.scale_grad()[0], 0.0);
        assert!(layer.assert_finite().is_ok());
    }

    #[test]
    fn unsanitized_poison_is_reported_by_the_finite_scan() {
        let mut layer = reference_layer(2, 1, 1, 1, true);
        layer
            .forward(&ExecutionContext::new().with_input(&[1.0, 3.0]).with_train(true))
            .unwrap();
        stage_delta(&mut layer, &[f64::NAN, 1.0]);
        layer.backward(&mut ExecutionContext::new().with_train(true)).unwrap();

        match layer.assert_finite().unwrap_err() {
            LayerError::NumericalInstability { array, count } => {
                assert_eq!(array, "scale_grad");
                assert_eq!(count, 1);
            }
            other => panic!("expected instability report, got {}", other),
        }
    }

    #[test]
    fn connected_host_maps_outputs_to_channels() {
        let layer = BatchNorm::<f64>::for_connected(4, 16, true)
            .and_then(|l| l.with_backend(Backend::Reference))
            .unwrap();
        assert_eq!(layer.kind(), LayerKind::Embedded);
        assert_eq!(layer.channels(), 16);
        assert_eq!(layer.outputs(), 16);
        assert_eq!(layer.output().len(), 64);
    }

    #[test]
    fn strategy_defaults_decide_the_rolling_decay() {
        let reference = reference_layer(2, 1, 1, 1, true);
        assert_relative_eq!(reference.decay(), 0.9);

        let fused = BatchNorm::<f64>::new(2, 1, 1, 1, true)
            .and_then(|l| l.with_backend(Backend::Fused))
            .unwrap();
        assert_relative_eq!(fused.decay(), 0.99);

        let pinned = reference_layer(2, 1, 1, 1, true).with_decay(0.95);
        assert_relative_eq!(pinned.decay(), 0.95);
    }
}
