use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoraError {
    #[error("adapter `{adapter}` on `{layer}`: {detail}")]
    ShapeMismatch {
        layer: String,
        adapter: String,
        detail: String,
    },

    #[error("adapter `{adapter}` is already attached to `{layer}`")]
    DuplicateAdapter { layer: String, adapter: String },

    #[error("adapter set `{set}` has no weights for `{layer}`")]
    MissingLayer { set: String, layer: String },
}
