use std::fs;
use std::future::Future;
use std::path::Path;

use image::{imageops::FilterType, RgbImage};
use serde::Deserialize;
use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Tensor};
use tracing::{info, warn};

use crate::error::{ModelError, StartupError};
use crate::utils::{self, Config};

pub const GRAPH_FILE: &str = "frozen_graph.pb";
pub const CLASS_LIST_FILE: &str = "class_list.txt";
pub const PREPROCESSOR_FILE: &str = "preprocessor_config.json";

const INPUT_OPERATION: &str = "pixel_values";
const OUTPUT_OPERATION: &str = "Identity";

/// Cache misses trigger one download and one more load attempt, never more.
const MAX_LOAD_RETRIES: usize = 1;

/// Label probabilities in model output order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassDistribution {
    classes: Vec<(String, f32)>,
}

impl ClassDistribution {
    pub fn new(classes: Vec<(String, f32)>) -> Self {
        Self { classes }
    }

    pub fn from_logits(labels: &[String], logits: &[f32]) -> Result<Self, ModelError> {
        if labels.len() != logits.len() {
            return Err(ModelError::OutputMismatch {
                expected: labels.len(),
                got: logits.len(),
            });
        }

        Ok(Self::new(labels.iter().cloned().zip(softmax(logits)).collect()))
    }

    /// Highest-probability class. Ties go to the earliest label.
    pub fn top(&self) -> Option<(&str, f32)> {
        let mut best: Option<(&str, f32)> = None;
        for (label, prob) in &self.classes {
            match best {
                Some((_, p)) if *prob <= p => {}
                _ => best = Some((label.as_str(), *prob)),
            }
        }
        best
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.classes.iter().map(|(l, p)| (l.as_str(), *p))
    }
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

pub trait Classifier: Send + Sync {
    fn classify(&self, image: &RgbImage) -> Result<ClassDistribution, ModelError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

/// Subset of a Hugging Face `preprocessor_config.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub size: ImageSize,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
    pub do_rescale: bool,
    pub do_normalize: bool,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            size: ImageSize {
                height: 224,
                width: 224,
            },
            image_mean: [0.5; 3],
            image_std: [0.5; 3],
            rescale_factor: 1.0 / 255.0,
            do_rescale: true,
            do_normalize: true,
        }
    }
}

impl PreprocessorConfig {
    fn load(path: &Path) -> Result<Self, ModelError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn normalize(&self, channel: usize, value: u8) -> f32 {
        let mut v = value as f32;
        if self.do_rescale {
            v *= self.rescale_factor;
        }
        if self.do_normalize {
            v = (v - self.image_mean[channel]) / self.image_std[channel];
        }
        v
    }

    /// Resizes and normalizes into channels-first `[3, H, W]` order.
    pub fn pixel_values(&self, image: &RgbImage) -> Vec<f32> {
        let (width, height) = (self.size.width, self.size.height);
        let resized = image::imageops::resize(image, width, height, FilterType::Triangle);

        let plane = (width * height) as usize;
        let mut values = vec![0f32; 3 * plane];
        for (i, pixel) in resized.pixels().enumerate() {
            for c in 0..3 {
                values[c * plane + i] = self.normalize(c, pixel[c]);
            }
        }
        values
    }
}

/// A frozen TensorFlow graph plus its label list and preprocessing settings.
pub struct Model {
    session: Session,
    graph: Graph,
    labels: Vec<String>,
    preprocessor: PreprocessorConfig,
}

impl Model {
    pub fn from_dir(dir: &Path) -> Result<Self, ModelError> {
        let mut graph = Graph::new();
        let model_bytes = fs::read(dir.join(GRAPH_FILE))?;
        graph.import_graph_def(&model_bytes, &ImportGraphDefOptions::new())?;

        for name in [INPUT_OPERATION, OUTPUT_OPERATION] {
            if graph.operation_by_name(name)?.is_none() {
                return Err(ModelError::MissingOperation(name));
            }
        }

        let session = Session::new(&SessionOptions::new(), &graph)?;

        let labels: Vec<String> = fs::read_to_string(dir.join(CLASS_LIST_FILE))?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        if labels.is_empty() {
            return Err(ModelError::NoLabels);
        }

        let preprocessor = PreprocessorConfig::load(&dir.join(PREPROCESSOR_FILE))?;

        Ok(Model {
            session,
            graph,
            labels,
            preprocessor,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    fn input_tensor(&self, image: &RgbImage) -> Tensor<f32> {
        let size = &self.preprocessor.size;
        let values = self.preprocessor.pixel_values(image);

        let mut tensor = Tensor::new(&[1, 3, size.height as u64, size.width as u64]);
        tensor.copy_from_slice(&values);
        tensor
    }
}

impl Classifier for Model {
    fn classify(&self, image: &RgbImage) -> Result<ClassDistribution, ModelError> {
        let input_tensor = self.input_tensor(image);

        let input_operation = self
            .graph
            .operation_by_name(INPUT_OPERATION)?
            .ok_or(ModelError::MissingOperation(INPUT_OPERATION))?;
        let output_operation = self
            .graph
            .operation_by_name(OUTPUT_OPERATION)?
            .ok_or(ModelError::MissingOperation(OUTPUT_OPERATION))?;

        let mut args = SessionRunArgs::new();
        args.add_feed(&input_operation, 0, &input_tensor);
        let output_token = args.request_fetch(&output_operation, 0);
        self.session.run(&mut args)?;

        let output_tensor: Tensor<f32> = args.fetch(output_token)?;
        ClassDistribution::from_logits(&self.labels, &output_tensor)
    }
}

/// Loads the model from the cache directory, downloading it first if needed.
pub async fn load(config: &Config) -> Result<Model, StartupError> {
    let dir = config.model_dir.as_path();
    let model = load_with_retry(|| Model::from_dir(dir), || utils::fetch_artifacts(config)).await?;
    info!(labels = ?model.labels(), dir = %dir.display(), "Model loaded");
    Ok(model)
}

pub async fn load_with_retry<T, L, F, Fut>(mut load: L, mut fetch: F) -> Result<T, StartupError>
where
    L: FnMut() -> Result<T, ModelError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ModelError>>,
{
    let mut retries = 0;
    loop {
        let err = match load() {
            Ok(model) => return Ok(model),
            Err(err) => err,
        };

        if retries == MAX_LOAD_RETRIES {
            return Err(StartupError::Load(err));
        }
        retries += 1;

        warn!(error = %err, "Cached model unavailable, fetching from remote");
        fetch().await.map_err(StartupError::Fetch)?;
    }
}
