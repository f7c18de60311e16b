use shared::DiseaseLabel;
use strum::EnumCount;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: DiseaseLabel,
    pub class_index: usize,
    pub confidence: f32,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PostprocessError {
    #[error("model produced {actual} outputs, expected {expected}")]
    OutputMismatch { expected: usize, actual: usize },
    #[error("model output contains non-finite values")]
    NonFinite,
}

/// Numerically stable softmax.
pub fn softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Leaves probability vectors alone and softmaxes anything else (raw logits).
/// Softmax is monotonic, so the winning class is the raw argmax either way;
/// only the reported confidence moves into [0, 1].
pub fn ensure_probabilities(values: &[f32]) -> Vec<f32> {
    let in_range = values.iter().all(|v| (0.0..=1.0).contains(v));
    let sum: f32 = values.iter().sum();
    if in_range && (sum - 1.0).abs() <= 1e-3 {
        values.to_vec()
    } else {
        softmax(values)
    }
}

/// Index and value of the maximum; ties go to the lowest index.
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, best_v)) if v <= best_v => best,
            _ => Some((i, v)),
        })
}

pub fn top_class(output: &[f32]) -> Result<Prediction, PostprocessError> {
    if output.len() != DiseaseLabel::COUNT {
        return Err(PostprocessError::OutputMismatch {
            expected: DiseaseLabel::COUNT,
            actual: output.len(),
        });
    }
    if output.iter().any(|v| !v.is_finite()) {
        return Err(PostprocessError::NonFinite);
    }

    let probabilities = ensure_probabilities(output);
    let (class_index, confidence) = argmax(&probabilities).ok_or(PostprocessError::NonFinite)?;
    let label = DiseaseLabel::from_index(class_index).ok_or(PostprocessError::OutputMismatch {
        expected: DiseaseLabel::COUNT,
        actual: output.len(),
    })?;

    Ok(Prediction {
        label,
        class_index,
        confidence: confidence.clamp(0.0, 1.0),
    })
}
