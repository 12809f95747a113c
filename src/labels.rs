use crate::config::{LabelsConfig, Validatable};
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Labels file not available: {0}")]
    Missing(String),
    #[error("Failed to read labels: {0}")]
    Io(#[from] io::Error),
    #[error("Labels file is empty")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct ClassLabels {
    labels: Vec<String>,
}

impl ClassLabels {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn from_config(labels_cfg: &LabelsConfig) -> Result<Self, LabelsError> {
        labels_cfg.validate().map_err(LabelsError::Missing)?;
        let labels = load_labels(&labels_cfg.get_path())?;
        if labels.is_empty() {
            return Err(LabelsError::Empty);
        }
        tracing::info!("Loaded {} class labels", labels.len());
        Ok(Self::new(labels))
    }

    pub fn get(&self, class_id: usize) -> &str {
        self.labels
            .get(class_id)
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

/// One label per line, blank lines ignored.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if !label.is_empty() {
            labels.push(label.to_string());
        }
    }

    Ok(labels)
}
