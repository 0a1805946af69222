//! Validation in front of the workflow: only images reach it.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::predictor::Predictor;
use crate::types::{ImageSummary, UploadedImage};
use crate::workflow::{DetectionWorkflow, WorkflowSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("{declared:?} is not an image type")]
    NotAnImage { declared: String },
    #[error("the file is empty")]
    Empty,
    #[error("the file is {size} bytes, larger than the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("could not read {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },
}

/// A file as the user picked it, before validation.
#[derive(Debug, Clone)]
pub struct SubmittedFile {
    pub file_name: String,
    pub declared_type: String,
    pub bytes: Vec<u8>,
}

impl SubmittedFile {
    pub fn new(
        file_name: impl Into<String>,
        declared_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            declared_type: declared_type.into(),
            bytes,
        }
    }
}

pub struct ImageAcquisition<P> {
    workflow: DetectionWorkflow<P>,
    max_image_bytes: usize,
}

impl<P> Clone for ImageAcquisition<P> {
    fn clone(&self) -> Self {
        Self {
            workflow: self.workflow.clone(),
            max_image_bytes: self.max_image_bytes,
        }
    }
}

impl<P: Predictor> ImageAcquisition<P> {
    pub fn new(workflow: DetectionWorkflow<P>, max_image_bytes: usize) -> Self {
        Self {
            workflow,
            max_image_bytes,
        }
    }

    pub fn max_image_bytes(&self) -> usize {
        self.max_image_bytes
    }

    /// Validates the file and, when accepted, hands it to the workflow.
    /// A rejected file leaves the workflow untouched.
    pub fn submit(&self, file: SubmittedFile) -> Result<ImageSummary, Rejection> {
        let mime_type = match validate(&file, self.max_image_bytes) {
            Ok(mime_type) => mime_type,
            Err(rejection) => {
                info!(file = %file.file_name, %rejection, "Image rejected");
                return Err(rejection);
            }
        };

        let image = UploadedImage::new(file.file_name, mime_type, file.bytes);
        let summary = image.summary();
        self.workflow.image_acquired(image);
        Ok(summary)
    }

    /// Reads `path` and submits it with a type guessed from its extension.
    pub async fn submit_path(&self, path: &Path) -> Result<ImageSummary, Rejection> {
        let declared_type = mime_guess::from_path(path)
            .first_raw()
            .unwrap_or("application/octet-stream");
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|error| Rejection::Unreadable {
                path: path.to_path_buf(),
                reason: error.to_string(),
            })?;
        debug!(path = %path.display(), declared_type, bytes = bytes.len(), "Read image from disk");

        self.submit(SubmittedFile::new(file_name, declared_type, bytes))
    }

    /// Drops the current image; the same as a workflow reset.
    pub fn remove(&self) -> WorkflowSnapshot {
        self.workflow.reset()
    }
}

/// Returns the normalized MIME type of an acceptable image.
fn validate(file: &SubmittedFile, limit: usize) -> Result<String, Rejection> {
    let declared = file.declared_type.trim();
    let mime_type = declared
        .parse::<mime_guess::mime::Mime>()
        .ok()
        .filter(|mime| mime.type_() == mime_guess::mime::IMAGE)
        .ok_or_else(|| Rejection::NotAnImage {
            declared: declared.to_string(),
        })?;

    if file.bytes.is_empty() {
        return Err(Rejection::Empty);
    }
    if file.bytes.len() > limit {
        return Err(Rejection::TooLarge {
            size: file.bytes.len(),
            limit,
        });
    }

    Ok(mime_type.essence_str().to_string())
}
