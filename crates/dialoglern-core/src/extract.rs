//! Pluggable feature extraction.
//!
//! Adapters and the environment run a [`FeaturePipeline`] over a state to
//! derive additional features. A failing extractor is logged and skipped;
//! it never aborts the pipeline.

use std::sync::Arc;

use crate::error::ExtractError;
use crate::state::{ConversationState, FeatureValue, Sentiment, Speaker};

pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &str;

    fn extract(&self, state: &ConversationState)
        -> Result<Vec<(String, FeatureValue)>, ExtractError>;
}

/// Ordered list of extractors applied to a state.
#[derive(Clone, Default)]
pub struct FeaturePipeline {
    extractors: Vec<Arc<dyn FeatureExtractor>>,
}

impl std::fmt::Debug for FeaturePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.extractors.iter().map(|e| e.name()))
            .finish()
    }
}

impl FeaturePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, extractor: impl FeatureExtractor + 'static) -> Self {
        self.extractors.push(Arc::new(extractor));
        self
    }

    pub fn push(&mut self, extractor: Arc<dyn FeatureExtractor>) {
        self.extractors.push(extractor);
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }

    /// Runs every extractor and writes the results into `state.features`.
    ///
    /// Returns the errors of the extractors that failed.
    pub fn apply(&self, state: &mut ConversationState) -> Vec<ExtractError> {
        let mut failures = Vec::new();
        for extractor in &self.extractors {
            match extractor.extract(state) {
                Ok(features) => {
                    for (name, value) in features {
                        state.features.insert(name, value);
                    }
                }
                Err(e) => {
                    crate::log_warn!("{}", e);
                    failures.push(e);
                }
            }
        }
        failures
    }
}

/// Counts of user turns and their latest sentiment.
#[derive(Debug, Default, Clone, Copy)]
pub struct TurnStatsExtractor;

impl FeatureExtractor for TurnStatsExtractor {
    fn name(&self) -> &str {
        "turn_stats"
    }

    fn extract(
        &self,
        state: &ConversationState,
    ) -> Result<Vec<(String, FeatureValue)>, ExtractError> {
        let user_turns = state
            .history
            .iter()
            .filter(|t| t.speaker == Speaker::User)
            .count();
        let negative = state
            .history
            .iter()
            .rev()
            .find(|t| t.speaker == Speaker::User)
            .is_some_and(|t| t.sentiment == Some(Sentiment::Negative));

        #[allow(clippy::cast_precision_loss)]
        let user_turns = user_turns as f64;
        Ok(vec![
            ("user_turns".to_string(), FeatureValue::Number(user_turns)),
            ("user_negative".to_string(), FeatureValue::Bool(negative)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ConversationTurn;

    struct Broken;

    impl FeatureExtractor for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn extract(
            &self,
            _state: &ConversationState,
        ) -> Result<Vec<(String, FeatureValue)>, ExtractError> {
            Err(ExtractError {
                extractor: "broken".into(),
                message: "lookup table missing".into(),
            })
        }
    }

    #[test]
    fn failing_extractor_does_not_abort_pipeline() {
        let pipeline = FeaturePipeline::new().with(Broken).with(TurnStatsExtractor);
        let mut state = ConversationState::new("c")
            .with_turn(ConversationTurn::user("this is useless").with_sentiment(Sentiment::Negative));

        let failures = pipeline.apply(&mut state);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].extractor, "broken");
        assert_eq!(state.features.get("user_turns"), Some(&FeatureValue::Number(1.0)));
        assert_eq!(state.features.get("user_negative"), Some(&FeatureValue::Bool(true)));
    }
}
