//! Single-input detection: score one decoded input, no run directory.

use crate::decision::{Decision, ScoreMethod};
use crate::model::{ImageTensor, InferenceError};
use crate::pipeline::SampleScorer;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

/// Outcome of scoring one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub method: ScoreMethod,
    pub score: f64,
    pub threshold: f64,
    pub decision: Decision,
    /// `(index, name, confidence)` for the entropy method
    pub predicted_class: Option<(usize, String, f64)>,
}

/// Score one input with an already loaded scorer
///
/// # Errors
///
/// Returns `InferenceError::BlankInput` for an all-zero input, or the
/// model's inference error.
pub fn detect<S>(scorer: &mut S, input: &ImageTensor) -> Result<Detection, InferenceError>
where
    S: SampleScorer + ?Sized,
{
    let assessment = scorer.assess(input)?;
    let detection = Detection {
        method: assessment.method,
        score: assessment.score,
        threshold: scorer.threshold(),
        decision: assessment.decision,
        predicted_class: assessment
            .predicted
            .map(|p| (p.index, p.name, p.confidence)),
    };
    info!(
        method = %detection.method,
        score = detection.score,
        decision = %detection.decision,
        "Detection complete"
    );
    Ok(detection)
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Method:     {}", self.method)?;
        writeln!(f, "Score:      {:.4}", self.score)?;
        writeln!(f, "Threshold:  {:.4}", self.threshold)?;
        if let Some((index, name, confidence)) = &self.predicted_class {
            writeln!(
                f,
                "Prediction: {name} (class {index}, {:.2}%)",
                confidence * 100.0
            )?;
        }
        match self.decision {
            Decision::Ood => write!(f, "Result:     OOD (uncertain input)"),
            Decision::Id => write!(f, "Result:     ID"),
        }
    }
}
