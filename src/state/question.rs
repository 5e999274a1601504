use crate::dao::models::{Cardinality, QuestionEntity};

/// Question of an assessment, read-only for the whole session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Stable identifier used as the save key.
    pub id: String,
    /// Marks value (informational; grading happens server-side).
    pub marks: u32,
    /// Single- or multi-select.
    pub cardinality: Cardinality,
    /// Choice labels, addressed by position.
    pub choices: Vec<String>,
}

/// Ordered questions fetched once when the attempt starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssessmentDefinition {
    questions: Vec<Question>,
}

impl AssessmentDefinition {
    /// Wrap an ordered question list.
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    /// Question at `index`, if it exists.
    pub fn get(&self, index: usize) -> Option<&Question> {
        self.questions.get(index)
    }

    /// Number of questions.
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    /// True for an assessment without questions.
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Total marks on offer.
    pub fn total_marks(&self) -> u32 {
        self.questions.iter().map(|question| question.marks).sum()
    }
}

impl From<QuestionEntity> for Question {
    fn from(value: QuestionEntity) -> Self {
        Self {
            id: value.id,
            marks: value.marks,
            cardinality: value.cardinality,
            choices: value.choices,
        }
    }
}

impl From<Vec<QuestionEntity>> for AssessmentDefinition {
    fn from(value: Vec<QuestionEntity>) -> Self {
        Self::new(value.into_iter().map(Into::into).collect())
    }
}
