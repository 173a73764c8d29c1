//! Session stages.
//!
//! `Schema -> Ingestion -> Processing -> Studio`. Processing may be re-entered
//! from itself after a failed full pass; Studio is terminal.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Stage {
    #[default]
    Schema,
    Ingestion,
    Processing,
    Studio,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Schema => "schema",
            Stage::Ingestion => "ingestion",
            Stage::Processing => "processing",
            Stage::Studio => "studio",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: Stage) -> bool {
        matches!(
            (self, next),
            (Stage::Schema, Stage::Ingestion)
                | (Stage::Ingestion, Stage::Processing)
                | (Stage::Processing, Stage::Processing)
                | (Stage::Processing, Stage::Studio)
        )
    }
}
