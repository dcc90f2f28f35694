//! Core Building Blocks for Multi-Stream Diffusion Transformers
//!
//! This crate provides the layers shared by the Flux block implementations in
//! `burn-omini-dit`.
//!
//! # Modules
//!
//! ## Attention
//!
//! - [`attention`] - Scaled dot-product attention with hard or additive masks
//!
//! ## Normalization Layers
//!
//! - [`layernorm`] - Layer normalization (optionally without affine)
//! - [`rmsnorm`] - RMS normalization (query/key normalization)
//!
//! ## Position Encodings
//!
//! - [`rope`] - Rotary embeddings computed from N-axis position ids
//!
//! ## Conditioning
//!
//! - [`embedding`] - Sinusoidal timestep embedding + MLP
//!
//! ## Adaptation and Precision
//!
//! - [`lora`] - LoRA adapters and the scoped scale state they run under
//! - [`precision`] - Half-precision overflow guard
//!
//! # Example
//!
//! ```ignore
//! use burn_omini_core::rope::FluxPosEmbed;
//!
//! let rotary = FluxPosEmbed::flux().forward(position_ids);
//! let q = rotary.apply(q);
//! ```

pub mod attention;
pub mod embedding;
pub mod error;
pub mod layernorm;
pub mod lora;
pub mod precision;
pub mod rmsnorm;
pub mod rope;

pub use error::LoraError;
