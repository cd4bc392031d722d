use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;
use serde_json::{Map, Value, json};

use crate::defs::Confidence;
use crate::defs::Entity;
use crate::defs::InferenceMeta;
use crate::defs::InferenceModel;
use crate::defs::InferenceRequest;
use crate::defs::InferenceResult;
use crate::defs::SentenceKeepProbability;

const NO_SENTENCE_MODEL_WARNING: &str = "No trained model found. Using default KEEP for all sentences.";
const RULE_ENTITY_WARNING: &str = "No NER model found. Structured extraction uses baseline rules.";
const RULE_ENTITY_PROBABILITY: f64 = 0.7;

static NEGATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"\bno\b", r"\bdenies\b", r"\bwithout\b", r"\bnegative for\b"]
        .iter()
        .map(|pattern| Regex::new(pattern).expect("static negation pattern"))
        .collect()
});

static TEMPORAL_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("history", r"\bhistory of\b|\bprior\b|\bpreviously\b"),
        ("plan", r"\bplan\b|\bwill\b|\bconsider\b"),
        ("current", r"\btoday\b|\bcurrently\b|\bnow\b"),
    ]
    .iter()
    .map(|(category, pattern)| (*category, Regex::new(pattern).expect("static temporal pattern")))
    .collect()
});

// Order matters: earlier rules win when spans overlap.
static ENTITY_RULES: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("HEMODYNAMICS", r"(?i)\bMAP\s*[:=]?\s*\d+(?:\s+on\s+[a-z]+)?"),
        ("MEDICATION", r"(?i)\b(?:norepi(?:nephrine)?|vasopressin|vaso|propofol|fentanyl|heparin|insulin)\b"),
        ("VENT", r"(?i)\b(?:PEEP\s*\d+|FiO2\s*\d+%?|intubated|extubated)"),
        ("IMAGING", r"(?i)\b(?:CT head|CT|MRI|CXR|chest x-ray|ultrasound)\b"),
        ("NEURO_EXAM", r"(?i)\b(?:focal deficits?|GCS\s*\d+|pupils [a-z ]+reactive)"),
        ("LAB", r"\b[A-Za-z]+\s*[:=]\s*[0-9.]+"),
    ]
    .iter()
    .map(|(label, pattern)| (*label, Regex::new(pattern).expect("static entity pattern")))
    .collect()
});

static MAP_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)MAP\s*[:=]?\s*(\d+)").expect("static MAP pattern"));
static LAB_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z]+)\s*[:=]\s*([0-9.]+)").expect("static lab pattern"));

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub idx: usize,
    pub text: String,
    pub start_char: usize,
    pub end_char: usize,
}

/// Split a note into sentences. A boundary is a newline, or `.`/`!`/`?`
/// followed by whitespace or the end of the text. Leading bullet markers are
/// not part of the sentence.
pub fn segment_text(text: &str) -> Vec<Segment> {
    let chars: Vec<char> = text.chars().collect();
    let mut segments = Vec::new();
    let mut start = 0;

    for (i, c) in chars.iter().enumerate() {
        let terminal = matches!(c, '.' | '!' | '?')
            && chars.get(i + 1).map_or(true, |next| next.is_whitespace());
        if *c == '\n' || terminal {
            push_segment(&chars, start, i + 1, &mut segments);
            start = i + 1;
        }
    }
    push_segment(&chars, start, chars.len(), &mut segments);

    segments
}

fn push_segment(chars: &[char], start: usize, end: usize, segments: &mut Vec<Segment>) {
    let mut s = start;
    let mut e = end;
    while s < e && chars[s].is_whitespace() {
        s += 1;
    }
    if s + 1 < e && matches!(chars[s], '-' | '*') && chars[s + 1].is_whitespace() {
        s += 1;
        while s < e && chars[s].is_whitespace() {
            s += 1;
        }
    }
    while e > s && chars[e - 1].is_whitespace() {
        e -= 1;
    }
    if s < e {
        segments.push(Segment {
            idx: segments.len(),
            text: chars[s..e].iter().collect(),
            start_char: s,
            end_char: e,
        });
    }
}

pub fn detect_negated(text: &str) -> bool {
    let lowered = text.to_lowercase();
    NEGATION_PATTERNS.iter().any(|pattern| pattern.is_match(&lowered))
}

pub fn detect_temporal(text: &str) -> Option<&'static str> {
    let lowered = text.to_lowercase();
    TEMPORAL_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(&lowered))
        .map(|(category, _)| *category)
}

/// Rule-based entity spans for each segment, with character offsets into the full note.
pub fn extract_entities(text: &str, segments: &[Segment]) -> Vec<Entity> {
    let mut entities: Vec<Entity> = Vec::new();

    for segment in segments {
        let negated = detect_negated(&segment.text);
        let temporal = detect_temporal(&segment.text).is_some();
        let mut taken: Vec<(usize, usize)> = Vec::new();

        for (label, rule) in ENTITY_RULES.iter() {
            for found in rule.find_iter(&segment.text) {
                let start = segment.start_char + segment.text[..found.start()].chars().count();
                let end = start + found.as_str().chars().count();
                if taken.iter().any(|(s, e)| start < *e && *s < end) {
                    continue;
                }
                taken.push((start, end));
                entities.push(Entity {
                    label: label.to_string(),
                    text: found.as_str().to_string(),
                    start_char: start,
                    end_char: end,
                    probability: RULE_ENTITY_PROBABILITY,
                    negated,
                    temporal,
                });
            }
        }
    }

    entities.sort_by_key(|entity| entity.start_char);
    debug_assert!(entities.iter().all(|e| e.offsets_within(text.chars().count())));
    entities
}

pub fn assemble_structured(entities: &[Entity]) -> Map<String, Value> {
    let mut neuro_exam: Vec<&str> = Vec::new();
    let mut imaging: Vec<&str> = Vec::new();
    let mut vent: Vec<&str> = Vec::new();
    let mut pressors: Vec<&str> = Vec::new();
    let mut hemodynamics: Vec<&str> = Vec::new();
    let mut map: Option<u32> = None;
    let mut lab_values = Map::new();
    let mut labs: Vec<&str> = Vec::new();
    let mut medications: Vec<&str> = Vec::new();
    let mut procedures: Vec<&str> = Vec::new();
    let mut assessment: Vec<&str> = Vec::new();

    for entity in entities {
        let text = entity.text.as_str();
        match entity.label.as_str() {
            "NEURO_EXAM" => neuro_exam.push(text),
            "IMAGING" => imaging.push(text),
            "VENT" => vent.push(text),
            "HEMODYNAMICS" => {
                hemodynamics.push(text);
                if let Some(value) = MAP_VALUE.captures(text).and_then(|c| c[1].parse().ok()) {
                    map = Some(value);
                }
                let lowered = text.to_lowercase();
                if lowered.contains("norepi") || lowered.contains("vaso") {
                    pressors.push(text);
                }
            }
            "LAB" => {
                labs.push(text);
                for captures in LAB_VALUE.captures_iter(text) {
                    lab_values.insert(captures[1].to_string(), Value::String(captures[2].to_string()));
                }
            }
            "MEDICATION" => medications.push(text),
            "PROCEDURE" => procedures.push(text),
            "ASSESSMENT" => assessment.push(text),
            _ => {}
        }
    }

    let structured = json!({
        "neuro_exam": neuro_exam.join(" "),
        "imaging": imaging,
        "vent": { "raw": vent },
        "hemodynamics": { "pressors": pressors, "map": map, "raw": hemodynamics },
        "labs": { "values": lab_values, "raw": labs },
        "medications": medications,
        "procedures": procedures,
        "assessment": assessment.join(" "),
    });

    match structured {
        Value::Object(fields) => fields,
        _ => Map::new(),
    }
}

/// Deterministic stand-in for a trained model: every sentence is kept with
/// probability 1.0 and entities come from the rules above.
pub struct BaselineInferenceModel;

impl BaselineInferenceModel {
    /// One outcome per request, in request order. A bad request fails only its own slot.
    pub async fn infer_batch(requests: &[InferenceRequest]) -> Vec<Result<InferenceResult>> {
        futures::future::join_all(requests.iter().map(|request| async move { Self::infer(request) })).await
    }
}

impl InferenceModel for BaselineInferenceModel {
    fn infer(request: &InferenceRequest) -> Result<InferenceResult> {
        if !(0.0..=1.0).contains(&request.keep_threshold) {
            bail!("keep_threshold {} is outside [0, 1]", request.keep_threshold);
        }

        let text = request.text.as_str();
        let segments = segment_text(text);
        let probabilities = vec![1.0_f64; segments.len()];

        let mut sentence_keep_probabilities = Vec::with_capacity(segments.len());
        let mut kept: Vec<&str> = Vec::new();
        for (segment, probability) in segments.iter().zip(probabilities) {
            sentence_keep_probabilities.push(SentenceKeepProbability {
                sentence: segment.text.clone(),
                probability,
            });
            if probability >= request.keep_threshold {
                kept.push(segment.text.as_str());
            }
        }

        let entities = extract_entities(text, &segments);
        let structured_fields = assemble_structured(&entities);

        Ok(InferenceResult {
            cleaned_text: kept.join("\n"),
            structured_fields,
            confidence: Confidence {
                sentence_keep_probabilities,
                entities,
            },
            warnings: vec![NO_SENTENCE_MODEL_WARNING.to_string(), RULE_ENTITY_WARNING.to_string()],
            meta: InferenceMeta {
                model_id: request.model_id.clone(),
                keep_threshold: request.keep_threshold,
                kept_sentence_count: kept.len(),
                total_sentence_count: segments.len(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_carry_character_offsets() {
        let text = "MAP 70 on norepi. No focal deficit.";
        let segments = segment_text(text);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "MAP 70 on norepi.");
        assert_eq!(segments[1].start_char, 18);
        for segment in &segments {
            let slice: String = text.chars().skip(segment.start_char).take(segment.end_char - segment.start_char).collect();
            assert_eq!(slice, segment.text);
        }
    }

    #[test]
    fn bullets_and_newlines_split_sentences() {
        let segments = segment_text("Plan:\n- start heparin\n* repeat CT head");
        let texts: Vec<&str> = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["Plan:", "start heparin", "repeat CT head"]);
    }

    #[test]
    fn decimals_do_not_end_a_sentence() {
        let segments = segment_text("Lactate: 2.4 today.");
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn negation_and_temporal_cues() {
        assert!(detect_negated("No focal deficit."));
        assert!(!detect_negated("Focal deficit on the left."));
        assert_eq!(detect_temporal("History of stroke"), Some("history"));
        assert_eq!(detect_temporal("Will repeat CT"), Some("plan"));
        assert_eq!(detect_temporal("Stable."), None);
    }

    #[test]
    fn structured_fields_pick_up_map_and_pressors() {
        let request = InferenceRequest::new("MAP 70 on norepi. No focal deficit.");
        let result = BaselineInferenceModel::infer(&request).unwrap();

        assert_eq!(result.meta.total_sentence_count, 2);
        assert_eq!(result.meta.kept_sentence_count, 2);
        assert_eq!(result.cleaned_text, "MAP 70 on norepi.\nNo focal deficit.");
        assert_eq!(result.structured_fields["hemodynamics"]["map"], json!(70));
        assert_eq!(result.structured_fields["hemodynamics"]["pressors"], json!(["MAP 70 on norepi"]));
        assert!(!result.structured_fields.contains_key("unknown"));

        let neuro = result
            .confidence
            .entities
            .iter()
            .find(|e| e.label == "NEURO_EXAM")
            .unwrap();
        assert!(neuro.negated);
        let source_chars = request.text.chars().count();
        assert!(result.confidence.entities.iter().all(|e| e.offsets_within(source_chars)));
    }

    #[test]
    fn labs_are_collected_by_name() {
        let request = InferenceRequest::new("Na: 138, K = 4.1");
        let result = BaselineInferenceModel::infer(&request).unwrap();
        assert_eq!(result.structured_fields["labs"]["values"]["Na"], json!("138"));
        assert_eq!(result.structured_fields["labs"]["values"]["K"], json!("4.1"));
    }

    #[test]
    fn threshold_outside_unit_interval_is_rejected() {
        let request = InferenceRequest::new("Patient awake.").with_threshold(1.5);
        assert!(BaselineInferenceModel::infer(&request).is_err());
    }

    #[tokio::test]
    async fn batch_preserves_request_order() {
        let requests = vec![
            InferenceRequest::new("Patient awake."),
            InferenceRequest::new("No focal deficits.").with_threshold(1.5),
            InferenceRequest::new("No focal deficits."),
        ];
        let results = BaselineInferenceModel::infer_batch(&requests).await;
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().cleaned_text, "Patient awake.");
        assert!(results[1].is_err());
        assert_eq!(results[2].as_ref().unwrap().cleaned_text, "No focal deficits.");
    }
}
