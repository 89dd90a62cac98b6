pub mod device_map;
pub mod error;
pub mod generator;
pub mod loader;
pub mod persist;
pub mod postprocess;
pub mod prompt;
pub mod stable_diffusion;
mod util;

pub use device_map::*;
pub use error::GenerateError;
pub use generator::Generator;
pub use loader::PipelineLoader;
pub use prompt::EnhancedPrompt;
pub use stable_diffusion::SdLoader;

use image::DynamicImage;
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

/// All generated images are square RGB at this edge length.
pub const IMAGE_WIDTH: usize = 512;
pub const IMAGE_HEIGHT: usize = 512;

pub const DEFAULT_STEPS: usize = 30;
pub const DEFAULT_GUIDANCE: f64 = 7.5;

/// One end-to-end generation request as accepted at the surface.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub steps: usize,
    pub guidance: f64,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            steps: DEFAULT_STEPS,
            guidance: DEFAULT_GUIDANCE,
            seed: None,
        }
    }
}

/// What the pipeline actually consumes: the enriched prompt pair plus
/// sampling parameters, dimensions already fixed.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub positive: String,
    pub negative: String,
    pub steps: usize,
    pub guidance: f64,
    pub seed: Option<u64>,
    pub width: usize,
    pub height: usize,
}

/// The opaque text-to-image capability. Implementations are not assumed to
/// tolerate concurrent invocation; the generator serializes calls.
pub trait ImagePipeline: Send + 'static {
    fn run(&mut self, request: &PipelineRequest) -> anyhow::Result<DynamicImage>;
}
