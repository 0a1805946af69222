use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

pub const TUMOR_LABEL: &str = "Tumor Detected";
pub const NO_TUMOR_LABEL: &str = "No Tumor Detected";

/// Identity assigned to an image when acquisition hands it over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(Uuid);

impl ImageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ImageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A user-selected image, owned by the workflow until reset or replaced.
///
/// Cloning is cheap: the bytes are shared.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    id: ImageId,
    file_name: String,
    mime_type: String,
    bytes: Arc<[u8]>,
}

impl UploadedImage {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            id: ImageId::new(),
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn id(&self) -> ImageId {
        self.id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn summary(&self) -> ImageSummary {
        ImageSummary {
            id: self.id,
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            byte_len: self.bytes.len(),
        }
    }
}

/// Byte-free description of an image, safe to publish to presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: ImageId,
    pub file_name: String,
    pub mime_type: String,
    pub byte_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    NoImage,
    ImageReady,
    Analyzing,
    TumorDetected,
    NoTumorDetected,
    /// The predictor answered with a label this client does not recognize.
    AnalysisComplete,
    AnalysisFailed,
}

impl DetectionStatus {
    pub fn title(self) -> &'static str {
        match self {
            Self::NoImage => "Ready for Analysis",
            Self::ImageReady => "Image Ready",
            Self::Analyzing => "Analyzing MRI Scan",
            Self::TumorDetected => "Tumor Detected",
            Self::NoTumorDetected => "No Tumor Detected",
            Self::AnalysisComplete => "Analysis Complete",
            Self::AnalysisFailed => "Analysis Failed",
        }
    }
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    #[default]
    Checking,
    Connected,
    Disconnected,
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredictionLabel {
    Tumor,
    NoTumor,
    Other(String),
}

impl PredictionLabel {
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim() {
            TUMOR_LABEL => Self::Tumor,
            NO_TUMOR_LABEL => Self::NoTumor,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Tumor => TUMOR_LABEL,
            Self::NoTumor => NO_TUMOR_LABEL,
            Self::Other(raw) => raw,
        }
    }

    /// The settled workflow status a successful response with this label maps to.
    pub fn status(&self) -> DetectionStatus {
        match self {
            Self::Tumor => DetectionStatus::TumorDetected,
            Self::NoTumor => DetectionStatus::NoTumorDetected,
            Self::Other(_) => DetectionStatus::AnalysisComplete,
        }
    }
}

impl Serialize for PredictionLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub image_id: ImageId,
    pub label: PredictionLabel,
    pub confidence: f64,
    pub threshold: Option<f64>,
    pub received_at: DateTime<Utc>,
}

impl PredictionResult {
    /// Confidence rendered as a whole percentage, e.g. `0.93` -> `"93%"`.
    pub fn confidence_percent(&self) -> String {
        format_percent(self.confidence)
    }
}

pub fn format_percent(fraction: f64) -> String {
    format!("{:.0}%", fraction * 100.0)
}
