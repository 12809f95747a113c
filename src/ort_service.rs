use crate::{
    config::{ModelConfig, Validatable},
    decoder::DecodedImage,
    detection::{BoundingBox, Detection},
    labels::{ClassLabels, LabelsError},
    model_service::{InferenceError, ModelService},
};
use image::imageops::{self, FilterType};
use ndarray::{Array, ArrayD, Axis, Ix3, Ix4};
use ort::{
    execution_providers::TensorRTExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Model file not available: {0}")]
    Missing(String),
    #[error("ONNX Runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Model declares no outputs")]
    NoOutput,
    #[error(transparent)]
    Labels(#[from] LabelsError),
}

#[derive(Debug, Clone, Copy)]
pub struct PostprocessParams {
    pub input_size: u32,
    pub min_score: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl From<&ModelConfig> for PostprocessParams {
    fn from(config: &ModelConfig) -> Self {
        Self {
            input_size: config.input_size,
            min_score: config.min_score,
            iou_threshold: config.iou_threshold,
            max_detections: config.max_detections,
        }
    }
}

fn transform_image(image: &DecodedImage, input_size: u32) -> Result<Array<f32, Ix4>, InferenceError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(InferenceError::Input("image has no pixels".to_string()));
    }

    let rgb = image.to_rgb().ok_or_else(|| {
        InferenceError::Input(format!(
            "cannot interpret {} channels as RGB",
            image.channels()
        ))
    })?;
    let resized = imageops::resize(&rgb, input_size, input_size, FilterType::CatmullRom);

    let size = input_size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok(input)
}

/// Decodes a YOLOv8 head of shape `[1, 4 + classes, candidates]`, with boxes
/// in centre format relative to the square model input, into detections in
/// source image pixels. Output is sorted by descending confidence.
pub(crate) fn postprocess(
    output: &ArrayD<f32>,
    img_width: f32,
    img_height: f32,
    params: &PostprocessParams,
    labels: &ClassLabels,
) -> Result<Vec<Detection>, InferenceError> {
    let output = output
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| InferenceError::Output(format!("expected 3 dimensions: {}", e)))?;

    if output.shape()[0] != 1 || output.shape()[1] < 5 {
        return Err(InferenceError::Output(format!(
            "unsupported output shape {:?}",
            output.shape()
        )));
    }

    let input_size = params.input_size as f32;
    let candidates = output.index_axis(Axis(0), 0).reversed_axes();

    let mut boxes = Vec::new();
    for row in candidates.axis_iter(Axis(0)) {
        let Some((class_id, prob)) = row
            .iter()
            .skip(4)
            .copied()
            .enumerate()
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
        else {
            continue;
        };

        if prob.is_nan() || prob < params.min_score {
            continue;
        }
        if row.iter().take(4).any(|value| !value.is_finite()) {
            continue;
        }

        let xc = row[0] / input_size * img_width;
        let yc = row[1] / input_size * img_height;
        let w = row[2] / input_size * img_width;
        let h = row[3] / input_size * img_height;

        boxes.push(Detection {
            class_label: labels.get(class_id).to_string(),
            confidence: prob,
            bbox: BoundingBox::from_corners(
                xc - w / 2.,
                yc - h / 2.,
                xc + w / 2.,
                yc + h / 2.,
                img_width,
                img_height,
            ),
        });
    }

    boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

    Ok(non_maximum_suppression(
        boxes,
        params.iou_threshold,
        params.max_detections,
    ))
}

/// Greedy class-agnostic suppression over boxes already sorted by confidence.
pub(crate) fn non_maximum_suppression(
    boxes: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    let mut result: Vec<Detection> = Vec::new();

    for candidate in boxes {
        if result.len() >= max_detections {
            break;
        }
        if result
            .iter()
            .all(|kept| kept.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            result.push(candidate);
        }
    }

    result
}

/// Pool of ONNX Runtime sessions. `Session::run` needs exclusive access, so
/// each session sits behind its own mutex and requests are spread round-robin.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    output_name: String,
    labels: Arc<ClassLabels>,
    params: PostprocessParams,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig, labels: ClassLabels) -> Result<Self, LoadError> {
        model_config.validate().map_err(LoadError::Missing)?;

        if model_config.use_tensorrt {
            ort::init()
                .with_execution_providers([TensorRTExecutionProvider::default()
                    .with_engine_cache(true)
                    .build()])
                .commit()?;
        }

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(session)
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        let output_name = sessions
            .first()
            .and_then(|session| session.outputs.first())
            .map(|output| output.name.clone())
            .ok_or(LoadError::NoOutput)?;

        tracing::info!(
            "Created {} ONNX sessions for {:?}, reading output {}",
            num_instances,
            model_config.get_path(),
            output_name
        );

        let sessions = sessions
            .into_iter()
            .map(|session| Arc::new(Mutex::new(session)))
            .collect();

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            output_name,
            labels: Arc::new(labels),
            params: PostprocessParams::from(model_config),
        })
    }

    pub fn run_inference(&self, input: &Array<f32, Ix4>) -> Result<ArrayD<f32>, InferenceError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let session_arc = &self.sessions[index];
        let mut session = session_arc
            .lock()
            .map_err(|e| InferenceError::Poisoned(e.to_string()))?;

        tracing::debug!("Handling request with session {}", index);
        let owned_buffer;
        let input_view = if input.view().is_standard_layout() {
            input.view()
        } else {
            owned_buffer = input.as_standard_layout().into_owned();
            owned_buffer.view()
        };

        let tensor_ref = TensorRef::from_array_view(input_view)
            .map_err(|e| InferenceError::Input(e.to_string()))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| InferenceError::Run(e.to_string()))?;

        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| InferenceError::Output(e.to_string()))?;

        ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| InferenceError::Output(format!("invalid tensor shape: {}", e)))
    }
}

impl ModelService for OrtModelService {
    fn detect(&self, image: &DecodedImage) -> Result<Vec<Detection>, InferenceError> {
        let input = transform_image(image, self.params.input_size)?;
        let output = self.run_inference(&input)?;

        postprocess(
            &output,
            image.width() as f32,
            image.height() as f32,
            &self.params,
            &self.labels,
        )
    }
}
