use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumCount, EnumIter, EnumString};

/// Disease classes in the order of the network's output units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, EnumCount, Display,
    AsRefStr, EnumString,
)]
pub enum DiseaseLabel {
    #[serde(rename = "Alopecia Areata")]
    #[strum(serialize = "Alopecia Areata")]
    AlopeciaAreata,
    #[serde(rename = "Contact Dermatitis")]
    #[strum(serialize = "Contact Dermatitis")]
    ContactDermatitis,
    #[serde(rename = "Folliculitis")]
    #[strum(serialize = "Folliculitis")]
    Folliculitis,
    #[serde(rename = "Head Lice")]
    #[strum(serialize = "Head Lice")]
    HeadLice,
    #[serde(rename = "Lichen Planus")]
    #[strum(serialize = "Lichen Planus")]
    LichenPlanus,
    #[serde(rename = "Male Pattern Baldness")]
    #[strum(serialize = "Male Pattern Baldness")]
    MalePatternBaldness,
    #[serde(rename = "Psoriasis")]
    #[strum(serialize = "Psoriasis")]
    Psoriasis,
    #[serde(rename = "Seborrheic Dermatitis")]
    #[strum(serialize = "Seborrheic Dermatitis")]
    SeborrheicDermatitis,
    #[serde(rename = "Telogen Effluvium")]
    #[strum(serialize = "Telogen Effluvium")]
    TelogenEffluvium,
    #[serde(rename = "Tinea Capitis")]
    #[strum(serialize = "Tinea Capitis")]
    TineaCapitis,
}

impl DiseaseLabel {
    /// Maps an output unit index to its label.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::iter().nth(index)
    }

    pub fn names() -> Vec<String> {
        Self::iter().map(|label| label.to_string()).collect()
    }
}

/// Whether the active network carries trained weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModelProvenance {
    /// All weights came from the artifact.
    Trained,
    /// Artifact weights with a substituted attention layer.
    Degraded,
    /// Freshly initialized fallback network; predictions carry no label information.
    Untrained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadStrategyKind {
    NativeLoad,
    CustomLayerLoad,
    SyntheticReplacementLayer,
    FreshFallbackNetwork,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct InferenceRequest {
    pub image_data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PredictionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_provenance: Option<ModelProvenance>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HealthResponse {
    pub status: String,
    pub model_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_provenance: Option<ModelProvenance>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StrategyFailure {
    pub strategy: LoadStrategyKind,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelInfo {
    pub input_shape: [usize; 4],
    pub num_classes: usize,
    pub class_labels: Vec<String>,
    pub parameter_count: u64,
    pub strategy: LoadStrategyKind,
    pub provenance: ModelProvenance,
    pub artifact_path: Option<String>,
    pub artifact_sha256: Option<String>,
    pub loaded_at: String,
    pub strategy_failures: Vec<StrategyFailure>,
    pub attention_passthrough_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::EnumCount;

    #[test]
    fn label_order_matches_output_units() {
        assert_eq!(DiseaseLabel::COUNT, 10);
        assert_eq!(DiseaseLabel::from_index(0), Some(DiseaseLabel::AlopeciaAreata));
        assert_eq!(DiseaseLabel::from_index(5), Some(DiseaseLabel::MalePatternBaldness));
        assert_eq!(DiseaseLabel::from_index(9), Some(DiseaseLabel::TineaCapitis));
        assert_eq!(DiseaseLabel::from_index(10), None);
        assert_eq!(
            DiseaseLabel::names(),
            vec![
                "Alopecia Areata",
                "Contact Dermatitis",
                "Folliculitis",
                "Head Lice",
                "Lichen Planus",
                "Male Pattern Baldness",
                "Psoriasis",
                "Seborrheic Dermatitis",
                "Telogen Effluvium",
                "Tinea Capitis",
            ]
        );
    }

    #[test]
    fn labels_serialize_as_display_names() {
        let json = serde_json::to_string(&DiseaseLabel::HeadLice).unwrap();
        assert_eq!(json, "\"Head Lice\"");
        assert_eq!("Tinea Capitis".parse::<DiseaseLabel>().unwrap(), DiseaseLabel::TineaCapitis);
    }

    #[test]
    fn failure_response_omits_prediction_fields() {
        let response = PredictionResponse {
            predicted_class: None,
            confidence: None,
            success: false,
            error: Some("Model not loaded".into()),
            model_provenance: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "success": false, "error": "Model not loaded" })
        );
    }

    #[test]
    fn provenance_is_lowercase_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&ModelProvenance::Untrained).unwrap(),
            "\"untrained\""
        );
        assert_eq!(ModelProvenance::Degraded.to_string(), "degraded");
        assert_eq!(LoadStrategyKind::FreshFallbackNetwork.to_string(), "fresh_fallback_network");
    }
}
