//! LoRA (Low-Rank Adaptation) support
//!
//! Adapters are attached to projection layers as low-rank `(down, up)` pairs
//! and mixed into the base projection at run time. How strongly each adapter
//! contributes is not stored on the layers: it lives in an [`AdapterScope`]
//! that is passed into every forward call. The scope hands out guards that
//! change the scale of named adapters, or switch adapters off for named
//! layers, and put the previous state back when they are dropped. That covers
//! normal returns, `?` early returns and panics alike, so a scale set for
//! one computation can never leak into the next.
//!
//! ```ignore
//! let scope = AdapterScope::new();
//! let _scale = scope.set_scale(&["subject"], 3.0);
//! {
//!     // Main-stream projections run without adapters here
//!     let _off = scope.enable(&[&attn.to_q, &attn.to_k, &attn.to_v], false);
//!     let q = attn.to_q.forward(x, &scope);
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use crate::error::LoraError;

/// LoRA weight pair (down/up projections) belonging to one named adapter
#[derive(Module, Debug)]
pub struct LoraAdapter<B: Backend> {
    /// Down projection: [rank, in_features]
    pub lora_down: Tensor<B, 2>,
    /// Up projection: [out_features, rank]
    pub lora_up: Tensor<B, 2>,
    /// Adapter name, the key scales are looked up by
    #[module(skip)]
    pub name: String,
    /// Alpha scaling factor
    #[module(skip)]
    pub alpha: f32,
    /// Rank of the LoRA matrices
    #[module(skip)]
    pub rank: usize,
}

impl<B: Backend> LoraAdapter<B> {
    /// Create a new LoRA weight pair
    pub fn new(
        name: impl Into<String>,
        lora_down: Tensor<B, 2>,
        lora_up: Tensor<B, 2>,
        alpha: f32,
    ) -> Self {
        let rank = lora_down.dims()[0];
        Self {
            lora_down,
            lora_up,
            name: name.into(),
            alpha,
            rank,
        }
    }

    fn effective_scale(&self, scale: f32) -> f32 {
        scale * self.alpha / self.rank as f32
    }

    /// Compute the delta weight in Burn's `[in_features, out_features]` layout
    pub fn delta_weight(&self, scale: f32) -> Tensor<B, 2> {
        let delta = self.lora_up.clone().matmul(self.lora_down.clone());
        delta.transpose() * self.effective_scale(scale)
    }

    /// Low-rank contribution for a flattened input `[n, in_features]`
    ///
    /// Computes: x @ down.T @ up.T * scale
    pub fn forward(&self, x: Tensor<B, 2>, scale: f32) -> Tensor<B, 2> {
        let down = x.matmul(self.lora_down.clone().transpose());
        let up = down.matmul(self.lora_up.clone().transpose());
        up * self.effective_scale(scale)
    }
}

/// Linear projection that can carry any number of named LoRA adapters
#[derive(Module, Debug)]
pub struct LoraLinear<B: Backend> {
    /// Frozen base projection
    pub base: Linear<B>,
    /// Attached adapters
    pub adapters: Vec<LoraAdapter<B>>,
    /// Dotted layer path, e.g. `transformer_blocks.0.attn.to_q`
    #[module(skip)]
    pub path: String,
}

impl<B: Backend> LoraLinear<B> {
    /// Wraps an existing linear layer with no adapters attached
    pub fn new(base: Linear<B>, path: impl Into<String>) -> Self {
        Self {
            base,
            adapters: Vec::new(),
            path: path.into(),
        }
    }

    /// Initializes a biased linear layer of the given size
    pub fn init(d_input: usize, d_output: usize, path: impl Into<String>, device: &B::Device) -> Self {
        Self::new(
            LinearConfig::new(d_input, d_output)
                .with_bias(true)
                .init(device),
            path,
        )
    }

    /// Input features
    pub fn d_input(&self) -> usize {
        self.base.weight.dims()[0]
    }

    /// Output features
    pub fn d_output(&self) -> usize {
        self.base.weight.dims()[1]
    }

    /// Attaches an adapter after checking its shapes against the base layer
    pub fn attach(&mut self, adapter: LoraAdapter<B>) -> Result<(), LoraError> {
        let [rank, d_in] = adapter.lora_down.dims();
        let [d_out, up_rank] = adapter.lora_up.dims();

        let mismatch = |detail: String| LoraError::ShapeMismatch {
            layer: self.path.clone(),
            adapter: adapter.name.clone(),
            detail,
        };
        if d_in != self.d_input() || d_out != self.d_output() {
            return Err(mismatch(format!(
                "adapter maps {} -> {}, layer maps {} -> {}",
                d_in,
                d_out,
                self.d_input(),
                self.d_output()
            )));
        }
        if rank != up_rank {
            return Err(mismatch(format!("down rank {} != up rank {}", rank, up_rank)));
        }
        if self.adapters.iter().any(|a| a.name == adapter.name) {
            return Err(LoraError::DuplicateAdapter {
                layer: self.path.clone(),
                adapter: adapter.name,
            });
        }

        self.adapters.push(adapter);
        Ok(())
    }

    /// Projects `x`, mixing in every adapter at the scale `scope` reports
    ///
    /// # Arguments
    ///
    /// * `x` - Input of shape `[..., in_features]`
    /// * `scope` - Current adapter scale and enable state
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>, scope: &AdapterScope) -> Tensor<B, D> {
        let active: Vec<(&LoraAdapter<B>, f32)> = self
            .adapters
            .iter()
            .map(|adapter| (adapter, scope.effective_scale(&self.path, &adapter.name)))
            .filter(|(_, scale)| *scale != 0.0)
            .collect();

        if active.is_empty() {
            return self.base.forward(x);
        }

        let dims = x.dims();
        let rows = dims[..D - 1].iter().product::<usize>();
        let flat = x.clone().reshape([rows, self.d_input()]);

        let mut delta = Tensor::<B, 2>::zeros([rows, self.d_output()], &flat.device());
        for (adapter, scale) in active {
            delta = delta + adapter.forward(flat.clone(), scale);
        }

        let mut out_dims = dims;
        out_dims[D - 1] = self.d_output();
        self.base.forward(x) + delta.reshape(out_dims)
    }

    /// Base weight with every active adapter merged in
    ///
    /// Returns the `[in_features, out_features]` weight that [`Self::forward`]
    /// effectively applies under `scope`.
    pub fn merged_weight(&self, scope: &AdapterScope) -> Tensor<B, 2> {
        self.adapters
            .iter()
            .fold(self.base.weight.val(), |weight, adapter| {
                let scale = scope.effective_scale(&self.path, &adapter.name);
                if scale == 0.0 {
                    weight
                } else {
                    weight + adapter.delta_weight(scale)
                }
            })
    }
}

/// Named collection of adapter weights, keyed by layer path
pub struct AdapterSet<B: Backend> {
    /// Adapter name shared by every entry
    pub name: String,
    /// `(down, up, alpha)` per layer path
    pub weights: HashMap<String, (Tensor<B, 2>, Tensor<B, 2>, f32)>,
}

impl<B: Backend> AdapterSet<B> {
    /// Create an empty adapter set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            weights: HashMap::new(),
        }
    }

    /// Add the low-rank pair for one layer
    pub fn insert(&mut self, path: impl Into<String>, down: Tensor<B, 2>, up: Tensor<B, 2>, alpha: f32) {
        self.weights.insert(path.into(), (down, up, alpha));
    }

    /// Attaches this set's adapter to every layer it has weights for
    ///
    /// Returns the number of layers that received an adapter. Every entry of
    /// the set must match one of `layers`.
    pub fn attach_to<'a, I>(&self, layers: I) -> Result<usize, LoraError>
    where
        I: IntoIterator<Item = &'a mut LoraLinear<B>>,
        B: 'a,
    {
        let mut matched = Vec::new();
        for layer in layers {
            if let Some((down, up, alpha)) = self.weights.get(&layer.path) {
                layer.attach(LoraAdapter::new(self.name.clone(), down.clone(), up.clone(), *alpha))?;
                matched.push(layer.path.clone());
            }
        }

        let mut unmatched: Vec<&String> = self
            .weights
            .keys()
            .filter(|path| !matched.contains(*path))
            .collect();
        unmatched.sort();
        if let Some(layer) = unmatched.first() {
            return Err(LoraError::MissingLayer {
                set: self.name.clone(),
                layer: (*layer).clone(),
            });
        }
        Ok(matched.len())
    }
}

#[derive(Debug, Default)]
struct ScopeState {
    /// Adapter name -> scale; adapters not listed run at 1.0
    scales: HashMap<String, f32>,
    /// Layer path -> adapters switched off
    disabled: HashMap<String, bool>,
}

/// Run-time adapter state shared by every [`LoraLinear`] forward call
#[derive(Debug, Default)]
pub struct AdapterScope {
    state: Mutex<ScopeState>,
}

impl AdapterScope {
    /// A scope with every adapter enabled at scale 1.0
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        // State is plain data; a panic elsewhere cannot leave it half-written
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current scale of a named adapter
    pub fn scale(&self, adapter: &str) -> f32 {
        self.lock().scales.get(adapter).copied().unwrap_or(1.0)
    }

    /// Whether adapters on the layer at `path` currently contribute
    pub fn is_enabled(&self, path: &str) -> bool {
        !self.lock().disabled.get(path).copied().unwrap_or(false)
    }

    /// Scale a given adapter contributes with on a given layer
    pub fn effective_scale(&self, path: &str, adapter: &str) -> f32 {
        let state = self.lock();
        if state.disabled.get(path).copied().unwrap_or(false) {
            0.0
        } else {
            state.scales.get(adapter).copied().unwrap_or(1.0)
        }
    }

    /// Sets the scale of the named adapters until the guard is dropped
    pub fn set_scale<S: AsRef<str>>(&self, adapters: &[S], scale: f32) -> ScaleGuard<'_> {
        let mut state = self.lock();
        let previous = adapters
            .iter()
            .map(|name| {
                let name = name.as_ref().to_string();
                let prev = state.scales.insert(name.clone(), scale);
                (name, prev)
            })
            .collect();
        tracing::debug!(count = adapters.len(), scale, "adapter scale set");
        ScaleGuard {
            scope: self,
            previous,
        }
    }

    /// Keeps or switches off the adapters of `layers` until the guard is dropped
    ///
    /// `enabled == true` leaves the layers in whatever state they are in;
    /// `enabled == false` makes them compute with their base weight only.
    pub fn enable<B: Backend>(&self, layers: &[&LoraLinear<B>], enabled: bool) -> LayerGuard<'_> {
        let paths: Vec<&str> = layers.iter().map(|layer| layer.path.as_str()).collect();
        self.enable_paths(&paths, enabled)
    }

    /// Same as [`Self::enable`], addressing layers by path
    pub fn enable_paths(&self, paths: &[&str], enabled: bool) -> LayerGuard<'_> {
        if enabled {
            return LayerGuard {
                scope: self,
                previous: Vec::new(),
            };
        }

        let mut state = self.lock();
        let previous = paths
            .iter()
            .map(|path| {
                let prev = state.disabled.insert(path.to_string(), true);
                (path.to_string(), prev)
            })
            .collect();
        LayerGuard {
            scope: self,
            previous,
        }
    }
}

/// Restores adapter scales on drop
#[must_use = "the scale is restored as soon as the guard is dropped"]
pub struct ScaleGuard<'a> {
    scope: &'a AdapterScope,
    previous: Vec<(String, Option<f32>)>,
}

impl Drop for ScaleGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.scope.lock();
        // Reverse order so a name listed twice ends at its original value
        for (name, prev) in self.previous.drain(..).rev() {
            match prev {
                Some(scale) => state.scales.insert(name, scale),
                None => state.scales.remove(&name),
            };
        }
    }
}

/// Restores layer enable state on drop
#[must_use = "the layers are re-enabled as soon as the guard is dropped"]
pub struct LayerGuard<'a> {
    scope: &'a AdapterScope,
    previous: Vec<(String, Option<bool>)>,
}

impl Drop for LayerGuard<'_> {
    fn drop(&mut self) {
        if self.previous.is_empty() {
            return;
        }
        let mut state = self.scope.lock();
        for (path, prev) in self.previous.drain(..).rev() {
            match prev {
                Some(disabled) => state.disabled.insert(path, disabled),
                None => state.disabled.remove(&path),
            };
        }
    }
}
