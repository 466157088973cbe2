use std::{path::Path, sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use tokio::sync::Semaphore;

use crate::{classifier::Classifier, error::AppError, generator::CaptionGenerator};

/// Number of captions produced per image.
pub const CAPTION_COUNT: usize = 3;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Upper bound on each external call (classification, generation).
    pub call_timeout: Duration,
    /// How many pipeline runs may be in flight at once; further runs wait.
    pub max_concurrent: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_concurrent: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionResult {
    pub description: String,
    pub captions: Vec<String>,
}

/// Classify an image, then turn the label into captions.
pub struct CaptionPipeline {
    classifier: Arc<dyn Classifier>,
    generator: Arc<dyn CaptionGenerator>,
    gate: Semaphore,
    call_timeout: Duration,
}

impl CaptionPipeline {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        generator: Arc<dyn CaptionGenerator>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            classifier,
            generator,
            gate: Semaphore::new(options.max_concurrent.max(1)),
            call_timeout: options.call_timeout,
        }
    }

    pub async fn process(&self, image_path: &Path) -> Result<CaptionResult, AppError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| AppError::Unhandled(anyhow!(e)))?;

        tracing::info!("classifying {}", image_path.display());
        let description = self
            .classify(image_path)
            .await
            .map_err(AppError::Classification)?;
        tracing::info!("image classified as {:?}", description);

        let captions = self
            .generate(&description)
            .await
            .map_err(AppError::Generation)?;
        tracing::info!("generated {} captions", captions.len());

        Ok(CaptionResult {
            description,
            captions,
        })
    }

    async fn classify(&self, image_path: &Path) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(image_path)
            .await
            .with_context(|| format!("failed to read {}", image_path.display()))?;

        let classification = tokio::time::timeout(self.call_timeout, self.classifier.classify(&bytes))
            .await
            .map_err(|_| anyhow!("classification timed out after {:?}", self.call_timeout))??;
        tracing::debug!(
            "classification confidence {:.3}",
            classification.confidence
        );

        let label = classification.label.trim().to_string();
        if label.is_empty() {
            return Err(anyhow!("classifier returned an empty label"));
        }
        Ok(label)
    }

    async fn generate(&self, description: &str) -> anyhow::Result<Vec<String>> {
        let captions = tokio::time::timeout(
            self.call_timeout,
            self.generator.generate(description, CAPTION_COUNT),
        )
        .await
        .map_err(|_| anyhow!("caption generation timed out after {:?}", self.call_timeout))??;

        if captions.len() != CAPTION_COUNT {
            return Err(anyhow!(
                "expected {} captions, got {}",
                CAPTION_COUNT,
                captions.len()
            ));
        }
        Ok(captions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classification;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClassifier {
        label: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _image: &[u8]) -> anyhow::Result<Classification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Classification {
                label: self.label.to_string(),
                confidence: 0.9,
            })
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl Classifier for FailingClassifier {
        async fn classify(&self, _image: &[u8]) -> anyhow::Result<Classification> {
            Err(anyhow!("model exploded"))
        }
    }

    struct HangingClassifier;

    #[async_trait]
    impl Classifier for HangingClassifier {
        async fn classify(&self, _image: &[u8]) -> anyhow::Result<Classification> {
            std::future::pending().await
        }
    }

    /// Each call waits for a permit the test hands out.
    struct GatedGenerator {
        release: Semaphore,
    }

    #[async_trait]
    impl CaptionGenerator for GatedGenerator {
        async fn generate(&self, description: &str, count: usize) -> anyhow::Result<Vec<String>> {
            self.release.acquire().await?.forget();
            Ok(vec![description.to_string(); count])
        }
    }

    struct EchoGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CaptionGenerator for EchoGenerator {
        async fn generate(&self, description: &str, count: usize) -> anyhow::Result<Vec<String>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..count)
                .map(|i| format!("{description} #{i} (run {call})"))
                .collect())
        }
    }

    struct FailingGenerator;

    #[async_trait]
    impl CaptionGenerator for FailingGenerator {
        async fn generate(&self, _description: &str, _count: usize) -> anyhow::Result<Vec<String>> {
            Err(anyhow!("401 invalid api key"))
        }
    }

    struct HangingGenerator;

    #[async_trait]
    impl CaptionGenerator for HangingGenerator {
        async fn generate(&self, _description: &str, _count: usize) -> anyhow::Result<Vec<String>> {
            std::future::pending().await
        }
    }

    struct ShortGenerator;

    #[async_trait]
    impl CaptionGenerator for ShortGenerator {
        async fn generate(&self, _description: &str, _count: usize) -> anyhow::Result<Vec<String>> {
            Ok(vec!["just one".to_string()])
        }
    }

    fn image_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"\x89PNG\r\n\x1a\n").unwrap();
        file
    }

    fn classifier(label: &'static str) -> Arc<FixedClassifier> {
        Arc::new(FixedClassifier {
            label,
            calls: AtomicUsize::new(0),
        })
    }

    #[test_log::test(tokio::test)]
    async fn produces_description_and_three_captions() {
        let file = image_file();
        let pipeline = CaptionPipeline::new(
            classifier("golden retriever"),
            Arc::new(EchoGenerator {
                calls: AtomicUsize::new(0),
            }),
            PipelineOptions::default(),
        );

        let result = pipeline.process(file.path()).await.unwrap();
        assert_eq!(result.description, "golden retriever");
        assert_eq!(result.captions.len(), CAPTION_COUNT);
        assert!(result.captions.iter().all(|c| !c.is_empty()));
    }

    #[test_log::test(tokio::test)]
    async fn description_is_stable_across_runs() {
        let file = image_file();
        let pipeline = CaptionPipeline::new(
            classifier("tabby"),
            Arc::new(EchoGenerator {
                calls: AtomicUsize::new(0),
            }),
            PipelineOptions::default(),
        );

        let first = pipeline.process(file.path()).await.unwrap();
        let second = pipeline.process(file.path()).await.unwrap();
        assert_eq!(first.description, second.description);
        assert_ne!(first.captions, second.captions);
    }

    #[test_log::test(tokio::test)]
    async fn classification_failure_skips_generation() {
        let file = image_file();
        let generator = Arc::new(EchoGenerator {
            calls: AtomicUsize::new(0),
        });
        let pipeline = CaptionPipeline::new(
            Arc::new(FailingClassifier),
            generator.clone(),
            PipelineOptions::default(),
        );

        let err = pipeline.process(file.path()).await.unwrap_err();
        assert!(matches!(err, AppError::Classification(_)));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test)]
    async fn missing_file_is_a_classification_error() {
        let pipeline = CaptionPipeline::new(
            classifier("tabby"),
            Arc::new(EchoGenerator {
                calls: AtomicUsize::new(0),
            }),
            PipelineOptions::default(),
        );

        let err = pipeline
            .process(Path::new("/definitely/not/here.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Classification(_)));
    }

    #[test_log::test(tokio::test)]
    async fn generation_failure_after_successful_classification() {
        let file = image_file();
        let classifier = classifier("espresso");
        let pipeline = CaptionPipeline::new(
            classifier.clone(),
            Arc::new(FailingGenerator),
            PipelineOptions::default(),
        );

        let err = pipeline.process(file.path()).await.unwrap_err();
        assert!(matches!(err, AppError::Generation(_)));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test(tokio::test)]
    async fn wrong_caption_count_is_rejected() {
        let file = image_file();
        let pipeline = CaptionPipeline::new(
            classifier("espresso"),
            Arc::new(ShortGenerator),
            PipelineOptions::default(),
        );

        let err = pipeline.process(file.path()).await.unwrap_err();
        assert!(matches!(err, AppError::Generation(_)));
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test_log::test(tokio::test)]
    async fn permit_is_held_for_the_whole_run() {
        let file = image_file();
        let path = file.path().to_path_buf();
        let classifier = classifier("tabby");
        let generator = Arc::new(GatedGenerator {
            release: Semaphore::new(0),
        });
        let pipeline = Arc::new(CaptionPipeline::new(
            classifier.clone(),
            generator.clone(),
            PipelineOptions {
                call_timeout: Duration::from_secs(30),
                max_concurrent: 1,
            },
        ));

        let first = tokio::spawn({
            let pipeline = pipeline.clone();
            let path = path.clone();
            async move { pipeline.process(&path).await }
        });
        // first run is parked inside generation, still holding its permit
        wait_until(|| classifier.calls.load(Ordering::SeqCst) == 1).await;

        let second = tokio::spawn({
            let pipeline = pipeline.clone();
            let path = path.clone();
            async move { pipeline.process(&path).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert!(!second.is_finished());

        generator.release.add_permits(2);
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.description, "tabby");
        assert_eq!(second.captions.len(), CAPTION_COUNT);
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn hung_classification_times_out_without_generating() {
        let file = image_file();
        let generator = Arc::new(EchoGenerator {
            calls: AtomicUsize::new(0),
        });
        let pipeline = CaptionPipeline::new(
            Arc::new(HangingClassifier),
            generator.clone(),
            PipelineOptions {
                call_timeout: Duration::from_secs(5),
                max_concurrent: 1,
            },
        );

        let err = pipeline.process(file.path()).await.unwrap_err();
        match err {
            AppError::Classification(e) => assert!(e.to_string().contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn hung_generation_times_out() {
        let file = image_file();
        let pipeline = CaptionPipeline::new(
            classifier("espresso"),
            Arc::new(HangingGenerator),
            PipelineOptions {
                call_timeout: Duration::from_secs(5),
                max_concurrent: 1,
            },
        );

        let err = pipeline.process(file.path()).await.unwrap_err();
        match err {
            AppError::Generation(e) => assert!(e.to_string().contains("timed out")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
