//! Candle-backed Stable Diffusion v1.5 pipeline.
//!
//! The model is consumed as an external capability: weights come from the
//! hub, the scheduler and network components come from candle-transformers.
//! The stock DDIM schedule is replaced with Euler Ancestral, which holds up
//! better at the same step count.

use anyhow::{anyhow, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::SchedulerConfig,
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::sync::ApiBuilder;
use image::DynamicImage;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::{
    dtype_for, tensor_to_image, DeviceMap, ImagePipeline, PipelineLoader, PipelineRequest,
    IMAGE_HEIGHT, IMAGE_WIDTH,
};

pub const MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";

const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const TOKENIZER_FILE: &str = "tokenizer.json";
const CLIP_WEIGHTS: &str = "text_encoder/model.safetensors";
const VAE_WEIGHTS: &str = "vae/diffusion_pytorch_model.safetensors";
const UNET_WEIGHTS: &str = "unet/diffusion_pytorch_model.safetensors";

// Attention slicing trades a little speed for a lot of peak memory.
const SLICED_ATTENTION_SIZE: usize = 128;
const VAE_SCALE: f64 = 0.18215;

/// Loads the Stable Diffusion components from the hub. The token must
/// authorize weight downloads; its presence is checked at startup, long
/// before this runs.
pub struct SdLoader {
    model_id: String,
    token: String,
    device_map: DeviceMap,
}

impl SdLoader {
    pub fn new(model_id: impl Into<String>, token: impl Into<String>, device_map: DeviceMap) -> Self {
        Self {
            model_id: model_id.into(),
            token: token.into(),
            device_map,
        }
    }
}

impl PipelineLoader for SdLoader {
    type Pipeline = SdPipeline;

    fn load(&self) -> Result<SdPipeline> {
        let device = self.device_map.device().context("failed to set up device")?;
        let dtype = dtype_for(&device);
        info!(model = %self.model_id, ?device, ?dtype, "loading pipeline");

        let sliced_attention_size = if device.is_cuda() {
            Some(SLICED_ATTENTION_SIZE)
        } else {
            None
        };
        let sd_config = StableDiffusionConfig::v1_5(
            sliced_attention_size,
            Some(IMAGE_HEIGHT),
            Some(IMAGE_WIDTH),
        );

        let api = ApiBuilder::new()
            .with_token(Some(self.token.clone()))
            .build()
            .context("failed to set up the hub client")?;

        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get(TOKENIZER_FILE)
            .context("failed to get the CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load the CLIP tokenizer")?;
        let pad_token = sd_config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .ok_or_else(|| anyhow!("pad token {pad_token:?} missing from tokenizer vocab"))?;

        let repo = api.model(self.model_id.clone());
        let clip_weights = repo
            .get(CLIP_WEIGHTS)
            .context("failed to get text encoder weights")?;
        // CLIP stays in full precision; embeddings are cast afterwards.
        let text_encoder = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            clip_weights,
            &device,
            DType::F32,
        )
        .context("failed to build the text encoder")?;

        let vae_weights = repo.get(VAE_WEIGHTS).context("failed to get VAE weights")?;
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to build the VAE")?;

        let unet_weights = repo
            .get(UNET_WEIGHTS)
            .context("failed to get UNet weights")?;
        // Best effort: only when compiled in and running on CUDA.
        let use_flash_attn = cfg!(feature = "flash-attn") && device.is_cuda();
        let unet = sd_config
            .build_unet(unet_weights, &device, 4, use_flash_attn, dtype)
            .context("failed to build the UNet")?;

        info!("pipeline components ready");
        Ok(SdPipeline {
            device,
            dtype,
            sd_config,
            tokenizer,
            pad_id,
            text_encoder,
            vae,
            unet,
        })
    }
}

/// The loaded pipeline: tokenizer, text encoder, UNet and VAE pinned to one
/// device. Lives for the rest of the process once constructed.
pub struct SdPipeline {
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    text_encoder: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl SdPipeline {
    /// CLIP-encodes a prompt, padded or truncated to the context window.
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.sd_config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            warn!("prompt is longer than {max_len} tokens, truncating");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_encoder.forward(&tokens)?)
    }
}

impl ImagePipeline for SdPipeline {
    fn run(&mut self, request: &PipelineRequest) -> Result<DynamicImage> {
        // The CPU backend rejects set_seed; there the initial latents come
        // from a host-side RNG seeded below, and the per-step ancestral
        // noise stays unseeded.
        if let Some(seed) = request.seed {
            if self.device.is_cpu() {
                warn!("the CPU rng cannot be seeded; only the initial latents are reproducible");
            } else {
                self.device.set_seed(seed)?;
            }
        }

        let mut scheduler = EulerAncestralDiscreteSchedulerConfig::default().build(request.steps)?;

        let uncond_embeddings = self.encode_prompt(&request.negative)?;
        let cond_embeddings = self.encode_prompt(&request.positive)?;
        let text_embeddings =
            Tensor::cat(&[uncond_embeddings, cond_embeddings], 0)?.to_dtype(self.dtype)?;

        let latent_shape = (1, 4, request.height / 8, request.width / 8);
        let mut latents = (initial_noise(latent_shape, request.seed, &self.device)?
            * scheduler.init_noise_sigma())?
        .to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred =
                (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * request.guidance)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!("denoising step {}/{}", index + 1, request.steps);
        }

        let image = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?.clamp(0f32, 1f32)?.to_device(&Device::Cpu)?;
        let image = (image.to_dtype(DType::F32)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}

/// Standard-normal latent noise. On an accelerator a seed already went
/// through the device RNG; on the CPU the noise is drawn from a host RNG
/// seeded here instead.
fn initial_noise(
    shape: (usize, usize, usize, usize),
    seed: Option<u64>,
    device: &Device,
) -> Result<Tensor> {
    match seed {
        Some(seed) if device.is_cpu() => {
            let (b, c, h, w) = shape;
            let mut rng = StdRng::seed_from_u64(seed);
            let noise: Vec<f32> = (0..b * c * h * w)
                .map(|_| StandardNormal.sample(&mut rng))
                .collect();
            Ok(Tensor::from_vec(noise, shape, device)?)
        }
        _ => Ok(Tensor::randn(0f32, 1f32, shape, device)?),
    }
}
