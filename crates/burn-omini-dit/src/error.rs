use burn_omini_core::LoraError;
use thiserror::Error;

use crate::stream::StreamRole;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BlockError {
    #[error("{role} stream has {channels} channels, which {heads} heads of width {head_dim} do not cover")]
    HeadMismatch {
        role: StreamRole,
        channels: usize,
        heads: usize,
        head_dim: usize,
    },

    #[error("{role} stream has batch size {found}, expected {expected}")]
    BatchMismatch {
        role: StreamRole,
        expected: usize,
        found: usize,
    },

    #[error("no timestep embedding supplied for the {0} stream")]
    MissingEmbedding(StreamRole),

    #[error("rotary embedding for the {role} stream covers {rotary} positions, stream has {tokens}")]
    RotaryMismatch {
        role: StreamRole,
        rotary: usize,
        tokens: usize,
    },

    #[error("rotary embedding for the {role} stream is {rotary} wide, heads are {head_dim} wide")]
    RotaryWidth {
        role: StreamRole,
        rotary: usize,
        head_dim: usize,
    },

    #[error("position ids for the {role} stream carry {found} axes, expected {expected}")]
    PositionAxes {
        role: StreamRole,
        found: usize,
        expected: usize,
    },

    #[error("{0} stream is not accepted here")]
    UnsupportedStream(StreamRole),

    #[error(transparent)]
    Lora(#[from] LoraError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionError {
    #[error("condition type `{0}` not implemented")]
    NotImplemented(String),

    #[error("latent grid {height}x{width} cannot be packed into 2x2 patches")]
    OddLatentSize { height: usize, width: usize },

    #[error("condition image must be [1, 3, H, W], got {0:?}")]
    InvalidImage([usize; 4]),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("hidden size {hidden} is not divisible by {heads} heads")]
    HeadSplit { hidden: usize, heads: usize },

    #[error("rotary axes cover {axes} channels, heads are {head_dim} wide")]
    AxesMismatch { axes: usize, head_dim: usize },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
