//! Flux Transformer Blocks with Condition Streams
//!
//! This crate runs Flux dual-stream and single-stream blocks on up to four
//! token streams at once: text context, the noisy image latents, and one or
//! two condition images encoded as extra latent tokens.
//!
//! # Streams
//!
//! Condition tokens share the main stream's projection weights but keep their
//! own timestep modulation and residual path. All present streams take part
//! in one joint attention whose mask is chosen by [`BlockOptions`]:
//!
//! - **Bias**: log condition factors added to cross-stream scores
//! - **Isolated**: conditions and the rest never see each other
//! - **One-way**: conditions only see conditions
//! - **Full**: plain joint attention
//!
//! # Adapters
//!
//! Condition-specific LoRA adapters attach to every projection by path. The
//! main stream runs with them switched off unless `latent_lora` is set.
//!
//! # Example
//!
//! ```ignore
//! let (model, runtime) = OminiFluxConfig::flux_dev().init::<B>(&device)?;
//! let encoded = Condition::parse("subject", image)?.encode(&vae, false)?;
//! let input = OminiFluxInput::new(latents, ids, text, pooled, t).with_condition(encoded);
//! let velocity = model.forward(input, &runtime, &BlockOptions::default(), &scope)?;
//! ```

pub mod attention;
pub mod condition;
pub mod config;
pub mod double_block;
pub mod error;
pub mod mask;
pub mod modulation;
pub mod single_block;
pub mod stream;
pub mod transformer;

pub use attention::JointAttention;
pub use condition::{Condition, ConditionKind, EncodedCondition, ImageEncoder};
pub use config::BlockOptions;
pub use double_block::DoubleStreamBlock;
pub use error::{BlockError, ConditionError, ConfigError};
pub use mask::MaskPolicy;
pub use single_block::SingleStreamBlock;
pub use stream::{ConditionSlot, StreamLayout, StreamRole, Streams};
pub use transformer::{OminiFlux, OminiFluxConfig, OminiFluxInput, OminiFluxRuntime};
