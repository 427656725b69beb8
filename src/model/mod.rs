pub mod attention;
pub mod config;
pub mod embedding;
pub mod head;
pub mod init;
pub mod layers;
pub mod mode;
pub mod transformer;

// Re-exports for convenience
pub use attention::SelfAttention;
pub use config::{Topology, ViTConfig};
pub use embedding::{PatchEmbed, PositionalEmbedding};
pub use head::{SegmentationHead, upsample_bilinear};
pub use layers::{LayerNorm, Mlp, TransformerBlock};
pub use mode::Mode;
pub use transformer::{SegViT, load_model, load_model_from_bytes};
