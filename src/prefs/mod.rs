pub mod cycle;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Structured feedback attached to a trace by whatever UI or integration
/// collected it. Anything missing simply contributes no votes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackSignal {
    pub tag: Option<String>,
    pub thumbs_up: bool,
    pub thumbs_down: bool,
    pub flag_unsafe_output: bool,
    pub complained_too_cautious: bool,
}

impl FeedbackSignal {
    pub fn from_value(feedback: &Value) -> Self {
        let get_bool =
            |key: &str| feedback.get(key).and_then(Value::as_bool).unwrap_or(false);
        Self {
            tag: feedback
                .get("tag")
                .and_then(Value::as_str)
                .map(str::to_string),
            thumbs_up: get_bool("thumbs_up"),
            thumbs_down: get_bool("thumbs_down"),
            flag_unsafe_output: get_bool("flag_unsafe_output"),
            complained_too_cautious: get_bool("complained_too_cautious"),
        }
    }
}

/// The preference dimensions the synthesizer votes over. Option order
/// within a dimension is the fixed enumeration order used to break ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Tone,
    Detail,
    Safety,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::Tone, Dimension::Detail, Dimension::Safety];

    pub fn options(self) -> &'static [&'static str] {
        match self {
            Dimension::Tone => &["direct", "gentle"],
            Dimension::Detail => &["concise", "detailed", "balanced"],
            Dimension::Safety => &["strict", "relaxed"],
        }
    }
}

/// What a vote rule looks for in a feedback signal.
#[derive(Debug, Clone, Copy)]
enum Signature {
    TagWithThumbsDown(&'static str),
    TagWithThumbsUp(&'static str),
    UnsafeOutputFlagged,
    ComplainedTooCautious,
}

impl Signature {
    fn matches(self, signal: &FeedbackSignal) -> bool {
        match self {
            Signature::TagWithThumbsDown(tag) => {
                signal.thumbs_down && signal.tag.as_deref() == Some(tag)
            }
            Signature::TagWithThumbsUp(tag) => {
                signal.thumbs_up && signal.tag.as_deref() == Some(tag)
            }
            Signature::UnsafeOutputFlagged => signal.flag_unsafe_output,
            Signature::ComplainedTooCautious => signal.complained_too_cautious,
        }
    }
}

/// One row of the voting table: feedback signature -> (dimension, option, weight).
/// Adding a new heuristic is a data change here, not new control flow.
struct VoteRule {
    signature: Signature,
    dimension: Dimension,
    option: &'static str,
    weight: u32,
}

const VOTE_RULES: &[VoteRule] = &[
    VoteRule {
        signature: Signature::TagWithThumbsDown("too_blunt"),
        dimension: Dimension::Tone,
        option: "gentle",
        weight: 2,
    },
    VoteRule {
        signature: Signature::TagWithThumbsDown("too_soft"),
        dimension: Dimension::Tone,
        option: "direct",
        weight: 2,
    },
    VoteRule {
        signature: Signature::TagWithThumbsUp("direct_helpful"),
        dimension: Dimension::Tone,
        option: "direct",
        weight: 3,
    },
    VoteRule {
        signature: Signature::TagWithThumbsUp("kind_helpful"),
        dimension: Dimension::Tone,
        option: "gentle",
        weight: 3,
    },
    VoteRule {
        signature: Signature::TagWithThumbsDown("too_long"),
        dimension: Dimension::Detail,
        option: "concise",
        weight: 3,
    },
    VoteRule {
        signature: Signature::TagWithThumbsDown("too_short"),
        dimension: Dimension::Detail,
        option: "detailed",
        weight: 3,
    },
    VoteRule {
        signature: Signature::TagWithThumbsUp("just_right_detail"),
        dimension: Dimension::Detail,
        option: "balanced",
        weight: 2,
    },
    VoteRule {
        signature: Signature::UnsafeOutputFlagged,
        dimension: Dimension::Safety,
        option: "strict",
        weight: 3,
    },
    VoteRule {
        signature: Signature::ComplainedTooCautious,
        dimension: Dimension::Safety,
        option: "relaxed",
        weight: 2,
    },
];

/// Categorical preferences inferred for one user. A `None` dimension
/// had no evidence and is omitted from patches and overlays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceSet {
    pub tone: Option<String>,
    pub detail_level: Option<String>,
    pub safety_bias: Option<String>,
}

impl PreferenceSet {
    pub fn is_empty(&self) -> bool {
        self.tone.is_none() && self.detail_level.is_none() && self.safety_bias.is_none()
    }

    /// Shallow patch for the user profile's `preferences` map.
    pub fn as_profile_patch(&self) -> Value {
        let mut patch = Map::new();
        if let Some(tone) = &self.tone {
            patch.insert("tone".to_string(), json!(tone));
        }
        if let Some(detail) = &self.detail_level {
            patch.insert("detail_level".to_string(), json!(detail));
        }
        if let Some(safety) = &self.safety_bias {
            patch.insert("safety_bias".to_string(), json!(safety));
        }
        Value::Object(patch)
    }
}

/// Weighted voting over the rule table, independently per dimension.
/// The highest accumulated weight wins; ties break toward the option
/// enumerated first. The internal `balanced` vote is emitted as `medium`.
pub fn infer_preferences(signals: &[FeedbackSignal]) -> PreferenceSet {
    let mut prefs = PreferenceSet::default();

    for dimension in Dimension::ALL {
        let options = dimension.options();
        let mut weights = vec![0u32; options.len()];

        for signal in signals {
            for rule in VOTE_RULES {
                if rule.dimension == dimension && rule.signature.matches(signal) {
                    let slot = options
                        .iter()
                        .position(|option| *option == rule.option)
                        .unwrap_or(0);
                    weights[slot] += rule.weight;
                }
            }
        }

        let mut winner: Option<(usize, u32)> = None;
        for (index, weight) in weights.iter().enumerate() {
            if *weight > 0 && winner.map_or(true, |(_, best)| *weight > best) {
                winner = Some((index, *weight));
            }
        }

        let Some((index, _)) = winner else { continue };
        let label = match options[index] {
            "balanced" => "medium".to_string(),
            other => other.to_string(),
        };
        match dimension {
            Dimension::Tone => prefs.tone = Some(label),
            Dimension::Detail => prefs.detail_level = Some(label),
            Dimension::Safety => prefs.safety_bias = Some(label),
        }
    }

    prefs
}

/// Fixed translation from inferred preferences to a routing override
/// patch. Dimensions without a matching branch contribute nothing;
/// `medium` detail deliberately yields no numeric cap.
pub fn routing_override_for(prefs: &PreferenceSet) -> Value {
    let mut style = Map::new();
    let mut safety = Map::new();

    match prefs.tone.as_deref() {
        Some("direct") => {
            style.insert("directness".to_string(), json!("high"));
        }
        Some("gentle") => {
            style.insert("directness".to_string(), json!("low"));
        }
        _ => {}
    }

    match prefs.detail_level.as_deref() {
        Some("concise") => {
            style.insert("max_tokens_per_reply".to_string(), json!(256));
        }
        Some("detailed") => {
            style.insert("max_tokens_per_reply".to_string(), json!(1024));
        }
        _ => {}
    }

    match prefs.safety_bias.as_deref() {
        Some("strict") => {
            safety.insert("extra_checks".to_string(), json!(true));
            safety.insert("min_sources".to_string(), json!(3));
        }
        Some("relaxed") => {
            safety.insert("extra_checks".to_string(), json!(false));
        }
        _ => {}
    }

    let mut routing_override = Map::new();
    if !style.is_empty() {
        routing_override.insert("style".to_string(), Value::Object(style));
    }
    if !safety.is_empty() {
        routing_override.insert("safety".to_string(), Value::Object(safety));
    }
    Value::Object(routing_override)
}
