use std::sync::Arc;

use anyhow::Context;
use caption_studio::{
    classifier::OnnxClassifier,
    config::Config,
    generator::OpenAiGenerator,
    router, telemetry,
    upload::UploadPolicy,
    AppState, CaptionPipeline, PipelineOptions,
};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("server failed: {:#}", e);
        eprintln!("Error starting server: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();
    telemetry::init_tracing();
    match dotenv {
        Ok(path) => tracing::debug!(".env read from {}", path.display()),
        Err(e) => tracing::debug!("no .env loaded: {}", e),
    }

    let config = Config::from_env()?;
    if config.openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set, caption generation will fail");
    }

    let classifier = {
        let model_path = config.classifier_model_path.clone();
        let labels_path = config.classifier_labels_path.clone();
        tokio::task::spawn_blocking(move || OnnxClassifier::load(model_path, labels_path))
            .await
            .context("classifier loading panicked")??
    };
    let generator = OpenAiGenerator::new(
        &config.openai_base_url,
        config.openai_api_key.clone(),
        &config.openai_model,
    );

    let pipeline = CaptionPipeline::new(
        Arc::new(classifier),
        Arc::new(generator),
        PipelineOptions {
            call_timeout: config.call_timeout,
            max_concurrent: config.max_concurrent_jobs,
        },
    );

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("failed to create {}", config.upload_dir.display()))?;

    let state = AppState {
        pipeline: Arc::new(pipeline),
        upload: UploadPolicy {
            keep_files: config.keep_uploads,
            ..UploadPolicy::new(&config.upload_dir)
        },
        expose_error_details: config.expose_error_details,
    };
    let app = router(state, &config.public_dir);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;

    tracing::info!("server running on http://localhost:{}", config.port);

    axum::serve(listener, app).await?;
    Ok(())
}
