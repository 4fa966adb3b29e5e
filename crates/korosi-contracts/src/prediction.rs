use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Probability above which the classifier output is read as corrosion.
pub const DECISION_THRESHOLD: f64 = 0.5;

/// Binary classification outcome.
///
/// The class-index table is inherited from how the classifier was trained and
/// is intentionally inverted: class index 0 is the positive "corrosion" case
/// and class index 1 is "no corrosion". Flipping either side of this table
/// inverts every downstream decision, so [`Label::from_class_index`] and
/// [`Label::class_index`] are the only places the mapping is spelled out.
/// The Streamlit app this model shipped with used the same table with the
/// opposite threshold branch; see [`class_index_for`] before changing either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Label {
    Corrosion,
    NoCorrosion,
}

impl Label {
    pub fn from_class_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Corrosion),
            1 => Some(Self::NoCorrosion),
            _ => None,
        }
    }

    pub fn class_index(self) -> usize {
        match self {
            Self::Corrosion => 0,
            Self::NoCorrosion => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Corrosion => "CORROSION",
            Self::NoCorrosion => "NO_CORROSION",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "CORROSION" => Ok(Self::Corrosion),
            "NO_CORROSION" => Ok(Self::NoCorrosion),
            _ => Err(format!(
                "unknown label '{}' (expected CORROSION or NO_CORROSION)",
                raw.trim()
            )),
        }
    }
}

/// Class index selected for a sigmoid output `p`.
///
/// `p > 0.5` selects class 0 (CORROSION); everything else, including the
/// exact 0.5 boundary, selects class 1 (NO_CORROSION).
///
/// The Streamlit app this model shipped with routed `p > 0.5` to class 1 and
/// therefore printed "no corrosion" for high outputs. Here high outputs read as
/// corrosion, matching the confidence figures and the 0.82 → CORROSION case.
/// Do not swap the branches back without re-validating the model.
pub fn class_index_for(probability: f64) -> usize {
    if probability > DECISION_THRESHOLD {
        Label::Corrosion.class_index()
    } else {
        Label::NoCorrosion.class_index()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub probability: f64,
    pub label: Label,
    pub confidence_percent: f64,
}

impl Prediction {
    pub fn from_probability(probability: f64) -> Self {
        let index = class_index_for(probability);
        let label = Label::from_class_index(index).unwrap_or(Label::NoCorrosion);
        let confidence = if probability > DECISION_THRESHOLD {
            probability
        } else {
            1.0 - probability
        };
        Self {
            probability,
            label,
            confidence_percent: confidence * 100.0,
        }
    }

    pub fn confidence_text(&self) -> String {
        format_confidence(self.confidence_percent)
    }
}

pub fn format_confidence(confidence_percent: f64) -> String {
    format!("{confidence_percent:.2}%")
}
