use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Uploaded document metadata. At most one processing result is recorded;
/// `processed_at` being set means processing will not run again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub session_id: String,
    pub filename: String,
    pub file_path: String,
    pub file_size: u64,
    pub file_type: String,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_content: Option<String>,
    pub processing_error: Option<String>,
    pub page_count: Option<u32>,
    pub word_count: Option<u32>,
}

impl Document {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}
