use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, Axis};
use ort::{GraphOptimizationLevel, Session};

const INPUT_SIZE: u32 = 224;
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Top prediction for an image. Only `label` is used downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify encoded image bytes (JPEG, PNG or GIF).
    async fn classify(&self, image: &[u8]) -> anyhow::Result<Classification>;
}

/// ImageNet classifier backed by an ONNX session (MobileNet and friends).
///
/// Loaded once at startup and shared read-only between requests.
pub struct OnnxClassifier {
    inner: Arc<Inner>,
}

struct Inner {
    session: Session,
    input_name: String,
    output_name: String,
    labels: Vec<String>,
}

impl OnnxClassifier {
    pub fn load(
        model_path: impl AsRef<Path>,
        labels_path: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let model_path = model_path.as_ref();
        let labels_path = labels_path.as_ref();

        let labels = std::fs::read_to_string(labels_path)
            .with_context(|| format!("failed to read labels from {}", labels_path.display()))?;
        let labels = parse_labels(&labels);
        if labels.is_empty() {
            return Err(anyhow!("no labels found in {}", labels_path.display()));
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)
            .with_context(|| format!("failed to load model {}", model_path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or(anyhow!("model has no inputs"))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or(anyhow!("model has no outputs"))?;

        tracing::info!(
            "loaded classifier {} ({} labels)",
            model_path.display(),
            labels.len()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                session,
                input_name,
                output_name,
                labels,
            }),
        })
    }
}

#[async_trait]
impl Classifier for OnnxClassifier {
    async fn classify(&self, image: &[u8]) -> anyhow::Result<Classification> {
        let bytes = image.to_vec();
        let inner = self.inner.clone();

        // decoding a small but highly compressed file can take a long time
        tokio::task::spawn_blocking(move || {
            let image = decode_image(&bytes)?;
            inner.run(&image)
        })
        .await
        .context("classification task panicked")?
    }
}

fn decode_image(bytes: &[u8]) -> anyhow::Result<DynamicImage> {
    image::load_from_memory(bytes).context("failed to decode image")
}

impl Inner {
    fn run(&self, image: &DynamicImage) -> anyhow::Result<Classification> {
        let input = preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input.view()]?)?;

        let logits = outputs
            .get(self.output_name.as_str())
            .ok_or(anyhow!("output not found"))?
            .try_extract_tensor::<f32>()?;
        let logits: Vec<f32> = logits.iter().copied().collect();

        top_prediction(&logits, &self.labels)
    }
}

/// Resize to 224x224 and lay out as a normalized NCHW tensor.
fn preprocess(image: &DynamicImage) -> Array4<f32> {
    let resized = image
        .resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::Triangle)
        .to_rgb8();

    let size = INPUT_SIZE as usize;
    let mut array = ndarray::Array3::<f32>::zeros((3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            array[[c, y as usize, x as usize]] = (value - MEAN[c]) / STD[c];
        }
    }
    array.insert_axis(Axis(0))
}

/// Softmax + argmax over the logits.
///
/// A model with exactly one more output than there are labels reserves index 0
/// for a background class, which is skipped.
fn top_prediction(logits: &[f32], labels: &[String]) -> anyhow::Result<Classification> {
    let offset = if logits.len() == labels.len() + 1 {
        1
    } else if logits.len() == labels.len() {
        0
    } else {
        return Err(anyhow!(
            "model produced {} scores for {} labels",
            logits.len(),
            labels.len()
        ));
    };
    let logits = &logits[offset..];

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return Err(anyhow!("model produced no finite scores"));
    }
    let exp: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();

    let (index, best) = exp
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .ok_or(anyhow!("model produced no scores"))?;
    let confidence = best / sum;

    tracing::debug!("top class {} ({:.3})", labels[index], confidence);

    Ok(Classification {
        label: labels[index].clone(),
        confidence,
    })
}

/// One label per line. Accepts plain names, `n02099601 golden retriever` synset
/// lines, and comma separated synonyms (first one wins).
fn parse_labels(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let line = match line.split_once(' ') {
                Some((id, rest)) if is_synset_id(id) => rest,
                _ => line,
            };
            line.split(',').next().unwrap_or(line).trim().to_string()
        })
        .collect()
}

fn is_synset_id(token: &str) -> bool {
    token.len() == 9 && token.starts_with('n') && token[1..].bytes().all(|b| b.is_ascii_digit())
}
