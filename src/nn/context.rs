// src/nn/context.rs
use crate::backend::number::NormoxF;
use crate::backend::Subdivision;

/// Per-pass state the surrounding executor hands to a layer. Mirrors what a
/// network loop knows at call time: the staged input, where the gradient for
/// the previous layer should land, and which of the alternate paths apply.
#[derive(Debug, Default)]
pub struct ExecutionContext<'a, T: NormoxF> {
    /// Input for this pass. Only standalone layers read it; embedded layers
    /// are handed their input through the host layer's output buffer.
    pub input: Option<&'a [T]>,
    /// Gradient buffer of the preceding layer. Standalone layers copy their
    /// input gradient into it during backward.
    pub upstream_delta: Option<&'a mut [T]>,
    /// Overrides the layer's constructed mode for this pass: training
    /// (batch statistics) vs. inference (rolling ones). `None` keeps the
    /// layer's own flag.
    pub train: Option<bool>,
    /// Adversarial sample generation: normalize with frozen rolling
    /// statistics and keep every accumulator untouched.
    pub adversarial: bool,
    /// Zero out non-finite parameter gradients after backward.
    pub sanitize_gradients: bool,
    /// Position within a gradient-accumulation split, for the cumulative
    /// statistics variant.
    pub subdivision: Option<Subdivision>,
}

impl<'a, T: NormoxF> ExecutionContext<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: &'a [T]) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_upstream_delta(mut self, delta: &'a mut [T]) -> Self {
        self.upstream_delta = Some(delta);
        self
    }

    pub fn with_train(mut self, train: bool) -> Self {
        self.train = Some(train);
        self
    }

    pub fn with_adversarial(mut self, adversarial: bool) -> Self {
        self.adversarial = adversarial;
        self
    }

    pub fn with_sanitize_gradients(mut self, sanitize: bool) -> Self {
        self.sanitize_gradients = sanitize;
        self
    }

    pub fn with_subdivision(mut self, subdivision: Subdivision) -> Self {
        self.subdivision = Some(subdivision);
        self
    }
}
