use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use axum::extract::Multipart;
use tokio::{fs, io::AsyncWriteExt};

use crate::error::AppError;

/// Largest accepted upload, in bytes.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Multipart field carrying the image.
pub const IMAGE_FIELD: &str = "image";

const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "gif"];
const ALLOWED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/gif"];

pub const MSG_NO_FILE: &str = "No file uploaded.";
pub const MSG_NOT_IMAGE: &str = "Only image files are allowed!";
pub const MSG_TOO_LARGE: &str = "File too large. Maximum size is 10MB.";
pub const MSG_EMPTY: &str = "Uploaded file is empty.";

#[derive(Debug, Clone)]
pub struct UploadPolicy {
    pub dir: PathBuf,
    pub max_bytes: usize,
    /// Keep stored files after the request finishes instead of removing them.
    pub keep_files: bool,
}

impl UploadPolicy {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: MAX_UPLOAD_BYTES,
            keep_files: false,
        }
    }
}

/// An accepted upload on disk. The file is removed when this value is dropped,
/// unless the policy that produced it keeps files.
#[derive(Debug)]
pub struct StoredUpload {
    pub path: PathBuf,
    /// Name the file was stored under.
    pub filename: String,
    pub original_name: String,
    pub size: usize,
    pub content_type: Option<String>,
    keep: bool,
}

impl Drop for StoredUpload {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("removed upload {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("failed to remove upload {}: {}", self.path.display(), e),
        }
    }
}

/// Pulls the `image` field out of a multipart body, validates it and stores it.
pub async fn receive(
    mut multipart: Multipart,
    policy: &UploadPolicy,
) -> Result<StoredUpload, AppError> {
    while let Some(mut field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let original_name = field
            .file_name()
            .map(str::to_string)
            .filter(|name| !name.trim().is_empty())
            .ok_or_else(|| AppError::validation(MSG_NO_FILE))?;
        let extension = allowed_extension(&original_name)
            .ok_or_else(|| AppError::validation(MSG_NOT_IMAGE))?;
        let content_type = field.content_type().map(str::to_string);

        let mut data = Vec::new();
        while let Some(chunk) = field.chunk().await? {
            if data.len() + chunk.len() > policy.max_bytes {
                return Err(AppError::validation(MSG_TOO_LARGE));
            }
            data.extend_from_slice(&chunk);
        }

        if data.is_empty() {
            return Err(AppError::validation(MSG_EMPTY));
        }
        if !looks_like_image(&data) {
            return Err(AppError::validation(MSG_NOT_IMAGE));
        }

        let (path, filename) = store(&policy.dir, &extension, &data)
            .await
            .map_err(AppError::Unhandled)?;
        tracing::info!(
            "stored upload {} as {} ({} bytes)",
            original_name,
            filename,
            data.len()
        );

        return Ok(StoredUpload {
            path,
            filename,
            original_name,
            size: data.len(),
            content_type,
            keep: policy.keep_files,
        });
    }

    Err(AppError::validation(MSG_NO_FILE))
}

/// Returns the lowercased extension when it is one of the accepted image types.
pub fn allowed_extension(filename: &str) -> Option<String> {
    let extension = Path::new(filename)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    ALLOWED_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}

/// Checks the leading bytes rather than trusting the client's filename.
pub fn looks_like_image(data: &[u8]) -> bool {
    infer::get(data)
        .map(|kind| ALLOWED_MIME_TYPES.contains(&kind.mime_type()))
        .unwrap_or(false)
}

/// Writes `data` under `<millis>.<extension>`, bumping the timestamp part until an
/// unused name is found.
async fn store(dir: &Path, extension: &str, data: &[u8]) -> anyhow::Result<(PathBuf, String)> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create upload dir {}", dir.display()))?;

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before unix epoch")?
        .as_millis();

    for attempt in 0..1000u128 {
        let filename = format!("{}.{}", millis + attempt, extension);
        let path = dir.join(&filename);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to create {}", path.display()))
            }
        };

        if let Err(e) = write_all(&mut file, data).await {
            drop(file);
            let _ = fs::remove_file(&path).await;
            return Err(e).with_context(|| format!("failed to write {}", path.display()));
        }
        return Ok((path, filename));
    }

    anyhow::bail!("no free upload filename in {}", dir.display())
}

async fn write_all(file: &mut fs::File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data).await?;
    file.flush().await
}
