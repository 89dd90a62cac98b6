//! Prompt enrichment: a fixed quality suffix on the positive side and a
//! fixed detractor list on the negative side. Pure and deterministic.

/// Appended to every prompt, in this order.
pub const QUALITY_MODIFIERS: [&str; 7] = [
    "highly detailed",
    "8k uhd",
    "ultra-detailed",
    "masterpiece",
    "best quality",
    "photorealistic",
    "sharp focus",
];

/// The negative prompt, independent of the input.
pub const NEGATIVE_MODIFIERS: [&str; 9] = [
    "low quality",
    "blurry",
    "pixelated",
    "distorted",
    "bad anatomy",
    "bad hands",
    "text",
    "watermark",
    "signature",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedPrompt {
    pub positive: String,
    pub negative: String,
}

impl EnhancedPrompt {
    pub fn from_prompt(prompt: &str) -> Self {
        Self {
            positive: format!("{}, {}", prompt, QUALITY_MODIFIERS.join(", ")),
            negative: NEGATIVE_MODIFIERS.join(", "),
        }
    }
}
