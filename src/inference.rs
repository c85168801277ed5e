use std::sync::Arc;

use image::RgbImage;

use crate::error::InferenceError;
use crate::model::Classifier;

pub const NSFW_LABEL: &str = "nsfw";

/// Verdict for a single image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub is_flagged: bool,
    pub certainty: f32,
}

#[derive(Clone)]
pub struct InferenceService {
    classifier: Arc<dyn Classifier>,
}

impl InferenceService {
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self { classifier }
    }

    /// Flags the image when the most likely label is `nsfw`. Uses argmax, not a threshold.
    pub fn infer(&self, image: &RgbImage) -> Result<Decision, InferenceError> {
        let distribution = self
            .classifier
            .classify(image)
            .map_err(|e| InferenceError::Failure(e.to_string()))?;

        tracing::debug!(distribution = ?distribution.iter().collect::<Vec<_>>(), "Classified image");

        let (label, certainty) = distribution
            .top()
            .ok_or_else(|| InferenceError::Failure("model returned no classes".into()))?;

        Ok(Decision {
            is_flagged: label.eq_ignore_ascii_case(NSFW_LABEL),
            certainty,
        })
    }
}
