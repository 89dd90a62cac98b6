//! The pipeline cache and the generation request lifecycle.
//!
//! One pipeline handle exists per process. It is constructed lazily on the
//! first request; concurrent first requests await the same load instead of
//! duplicating it. The pipeline itself is not assumed safe for concurrent
//! invocation, so inference runs under a mutex on a blocking thread.

use std::path::PathBuf;
use std::sync::Arc;

use image::RgbImage;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::{
    persist, postprocess, EnhancedPrompt, GenerateError, GenerationRequest, ImagePipeline,
    PipelineLoader, PipelineRequest, IMAGE_HEIGHT, IMAGE_WIDTH,
};

type SharedPipeline<P> = Arc<Mutex<P>>;

pub struct Generator<L: PipelineLoader> {
    loader: Arc<L>,
    pipeline: OnceCell<SharedPipeline<L::Pipeline>>,
    output_dir: PathBuf,
}

impl<L: PipelineLoader> Generator<L> {
    pub fn new(loader: L) -> Self {
        Self::with_output_dir(loader, persist::OUTPUT_DIR)
    }

    pub fn with_output_dir(loader: L, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            loader: Arc::new(loader),
            pipeline: OnceCell::new(),
            output_dir: output_dir.into(),
        }
    }

    /// Runs one end-to-end generation request and returns the finished
    /// 512x512 RGB image.
    pub async fn generate(&self, request: GenerationRequest) -> Result<RgbImage, GenerateError> {
        if request.prompt.trim().is_empty() {
            return Err(GenerateError::EmptyPrompt);
        }
        if request.steps == 0 {
            return Err(GenerateError::Validation("steps must be positive"));
        }
        if !(request.guidance > 0.0) {
            return Err(GenerateError::Validation("guidance must be positive"));
        }

        let pipeline = self.pipeline().await?;
        let enhanced = EnhancedPrompt::from_prompt(&request.prompt);
        let run = PipelineRequest {
            positive: enhanced.positive,
            negative: enhanced.negative,
            steps: request.steps,
            guidance: request.guidance,
            seed: request.seed,
            width: IMAGE_WIDTH,
            height: IMAGE_HEIGHT,
        };

        info!(
            prompt = %request.prompt,
            steps = run.steps,
            guidance = run.guidance,
            seed = ?run.seed,
            "generating image"
        );
        let image = tokio::task::spawn_blocking(move || pipeline.lock().run(&run))
            .await
            .map_err(|e| GenerateError::Generation(anyhow::anyhow!("generation task failed: {e}")))?
            .map_err(GenerateError::Generation)?;

        let image = postprocess::refine(image);

        // Fire and forget; a failed write is only visible in the logs.
        let dir = self.output_dir.clone();
        let prompt = request.prompt.clone();
        let copy = image.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = persist::save(&dir, &prompt, &copy) {
                warn!("could not save image: {e}");
            }
        });

        Ok(image)
    }

    /// Returns the process-wide pipeline handle, loading it on first use.
    /// Late arrivals during the load await the same initialization.
    async fn pipeline(&self) -> Result<SharedPipeline<L::Pipeline>, GenerateError> {
        self.pipeline
            .get_or_try_init(|| async {
                info!("loading pipeline, the first request may take a while");
                let loader = Arc::clone(&self.loader);
                let pipeline = tokio::task::spawn_blocking(move || loader.load())
                    .await
                    .map_err(|e| {
                        GenerateError::Generation(anyhow::anyhow!("pipeline load task failed: {e}"))
                    })?
                    .map_err(GenerateError::Generation)?;
                info!("pipeline loaded");
                Ok(Arc::new(Mutex::new(pipeline)))
            })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt;
    use image::DynamicImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakePipeline {
        runs: Arc<AtomicUsize>,
        last: Arc<Mutex<Option<PipelineRequest>>>,
    }

    impl ImagePipeline for FakePipeline {
        fn run(&mut self, request: &PipelineRequest) -> anyhow::Result<DynamicImage> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(request.clone());
            let shade = request.seed.unwrap_or(0) as u8;
            let buffer = image::RgbImage::from_pixel(
                request.width as u32,
                request.height as u32,
                image::Rgb([shade, shade, shade]),
            );
            Ok(DynamicImage::ImageRgb8(buffer))
        }
    }

    #[derive(Default)]
    struct FakeLoader {
        loads: Arc<AtomicUsize>,
        runs: Arc<AtomicUsize>,
        last: Arc<Mutex<Option<PipelineRequest>>>,
        load_delay: Option<Duration>,
    }

    impl PipelineLoader for FakeLoader {
        type Pipeline = FakePipeline;

        fn load(&self) -> anyhow::Result<FakePipeline> {
            if let Some(delay) = self.load_delay {
                std::thread::sleep(delay);
            }
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(FakePipeline {
                runs: self.runs.clone(),
                last: self.last.clone(),
            })
        }
    }

    fn generator(loader: FakeLoader) -> Generator<FakeLoader> {
        let dir = tempfile::tempdir().unwrap();
        Generator::with_output_dir(loader, dir.keep())
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_before_any_load() {
        let loader = FakeLoader::default();
        let loads = loader.loads.clone();
        let generator = generator(loader);

        for prompt in ["", "   ", "\t\n"] {
            let err = generator
                .generate(GenerationRequest::new(prompt))
                .await
                .unwrap_err();
            assert!(matches!(err, GenerateError::EmptyPrompt));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_positive_parameters_are_rejected() {
        let loader = FakeLoader::default();
        let loads = loader.loads.clone();
        let generator = generator(loader);

        let mut request = GenerationRequest::new("a red fox");
        request.steps = 0;
        assert!(matches!(
            generator.generate(request).await.unwrap_err(),
            GenerateError::Validation(_)
        ));

        let mut request = GenerationRequest::new("a red fox");
        request.guidance = 0.0;
        assert!(matches!(
            generator.generate(request).await.unwrap_err(),
            GenerateError::Validation(_)
        ));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pipeline_loads_once_across_requests() {
        let loader = FakeLoader::default();
        let loads = loader.loads.clone();
        let runs = loader.runs.clone();
        let generator = generator(loader);

        for _ in 0..3 {
            generator
                .generate(GenerationRequest::new("a red fox"))
                .await
                .unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_share_one_load() {
        let loader = FakeLoader {
            load_delay: Some(Duration::from_millis(50)),
            ..FakeLoader::default()
        };
        let loads = loader.loads.clone();
        let generator = Arc::new(generator(loader));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let generator = Arc::clone(&generator);
                tokio::spawn(
                    async move { generator.generate(GenerationRequest::new("race")).await },
                )
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pipeline_receives_enhanced_prompts_and_fixed_dimensions() {
        let loader = FakeLoader::default();
        let last = loader.last.clone();
        let generator = generator(loader);

        let mut request = GenerationRequest::new("a red fox");
        request.seed = Some(42);
        generator.generate(request).await.unwrap();

        let run = last.lock().clone().unwrap();
        assert!(run.positive.starts_with("a red fox, "));
        assert!(run.positive.ends_with(&prompt::QUALITY_MODIFIERS.join(", ")));
        assert_eq!(run.negative, prompt::NEGATIVE_MODIFIERS.join(", "));
        assert_eq!((run.width, run.height), (IMAGE_WIDTH, IMAGE_HEIGHT));
        assert_eq!(run.seed, Some(42));
    }

    #[tokio::test]
    async fn seeded_requests_reproduce_the_same_image() {
        let loader = FakeLoader::default();
        let generator = generator(loader);

        let mut request = GenerationRequest::new("a red fox");
        request.seed = Some(42);
        let first = generator.generate(request.clone()).await.unwrap();
        let second = generator.generate(request).await.unwrap();
        assert_eq!(first.as_raw(), second.as_raw());
    }

    #[tokio::test]
    async fn persistence_failure_does_not_change_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let generator = Generator::with_output_dir(FakeLoader::default(), &blocker);
        let image = generator
            .generate(GenerationRequest::new("a red fox"))
            .await
            .unwrap();
        assert_eq!(image.dimensions(), (IMAGE_WIDTH as u32, IMAGE_HEIGHT as u32));
    }
}
