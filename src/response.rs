use crate::detection::Detection;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedBox {
    pub class: String,
    pub bbox: [f32; 4],
}

/// Wire body of a successful upload. `objects[i] == boxes[i].class` for
/// every index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub objects: Vec<String>,
    pub boxes: Vec<DetectedBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

pub fn shape(detections: &[Detection]) -> DetectionResponse {
    let boxes: Vec<DetectedBox> = detections
        .iter()
        .map(|detection| DetectedBox {
            class: detection.class_label.clone(),
            bbox: detection.bbox.to_xywh(),
        })
        .collect();
    let objects = boxes.iter().map(|b| b.class.clone()).collect();

    DetectionResponse { objects, boxes }
}
