use anyhow::Result;

use crate::ImagePipeline;

/// Constructs a pipeline. The load is blocking and expensive (weight
/// download, device placement); the generator invokes it at most once per
/// process, from a blocking thread.
pub trait PipelineLoader: Send + Sync + 'static {
    type Pipeline: ImagePipeline;

    fn load(&self) -> Result<Self::Pipeline>;
}
