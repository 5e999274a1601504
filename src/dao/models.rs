use serde::{Deserialize, Serialize};

/// Whether a question accepts one choice or several.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Exactly one choice may be selected; a new pick replaces the old one.
    #[default]
    Single,
    /// Any subset of choices may be selected; picks toggle membership.
    Multiple,
}

/// Question as delivered by the server when an attempt starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionEntity {
    /// Stable identifier of the question.
    pub id: String,
    /// Marks awarded for a correct answer.
    pub marks: u32,
    /// Answer cardinality.
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Choice labels, addressed by position.
    pub choices: Vec<String>,
}

/// Response of `startAttempt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartedAttemptEntity {
    /// Opaque identifier assigned by the server.
    pub attempt_id: String,
    /// Server-authoritative time left on the attempt.
    pub remaining_seconds: u64,
    /// Ordered questions of the assessment.
    pub questions: Vec<QuestionEntity>,
}

/// Body of `saveAnswer`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SaveAnswerRequest {
    /// Question being answered.
    pub question_id: String,
    /// Selected choice positions, ascending.
    pub selected_choice_indices: Vec<usize>,
    /// Total time the student spent viewing the question.
    pub time_spent_seconds: u64,
}

/// Response of `getAttemptStatus`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttemptStatusEntity {
    /// Server-authoritative time left on the attempt.
    pub remaining_seconds: u64,
    /// False once the server considers the attempt closed.
    pub can_continue: bool,
    /// RFC 3339 timestamp of the last acknowledged save, if any.
    #[serde(default)]
    pub last_saved_at: Option<String>,
}

/// Body of `submitAttempt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    /// True when the submission was triggered by the deadline.
    pub auto_submit: bool,
}

/// Response of `submitAttempt`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResultEntity {
    /// Attempt the result belongs to.
    pub attempt_id: String,
    /// Flag recorded by the server for the accepted submission.
    pub auto_submit: bool,
    /// Number of questions holding a persisted answer at submission time.
    pub answered_count: u32,
    /// RFC 3339 timestamp of the accepted submission.
    #[serde(default)]
    pub submitted_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_defaults_to_single_select() {
        let question: QuestionEntity =
            serde_json::from_str(r#"{"id":"q1","marks":2,"choices":["a","b"]}"#).unwrap();
        assert_eq!(question.cardinality, Cardinality::Single);
    }

    #[test]
    fn save_request_uses_camel_case_keys() {
        let body = serde_json::to_value(SaveAnswerRequest {
            question_id: "q7".into(),
            selected_choice_indices: vec![0, 2],
            time_spent_seconds: 41,
        })
        .unwrap();
        assert_eq!(body["questionId"], "q7");
        assert_eq!(body["selectedChoiceIndices"], serde_json::json!([0, 2]));
        assert_eq!(body["timeSpentSeconds"], 41);
    }
}
