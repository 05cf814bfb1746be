//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Conflict-resolution strategy within one salience group.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Newer timestamps first.
    Depth,
    /// Older timestamps first.
    Breadth,
    /// Lexicographic over the timestamp vector, newer-dominant.
    Lex,
    /// Like lex, but the first pattern's timestamp dominates.
    Mea,
    /// Lower static complexity first.
    Simplicity,
    /// Higher static complexity first.
    Complexity,
    /// By a tag drawn at activation time.
    Random,
}

/// When dynamic salience expressions are (re)evaluated.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SalienceEval {
    /// Once, at rule definition.
    WhenDefined,
    /// On each activation.
    WhenActivated,
    /// On each activation and again before every firing cycle.
    EveryCycle,
}

/// What a failed action evaluation does to the run loop.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Abort the current firing, keep running.
    Continue,
    /// Abort the current firing and halt the engine.
    Halt,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub strategy: Strategy,
    pub salience_eval: SalienceEval,
    /// Asserting a fact identical to a live one: error out or create an
    /// independent duplicate.
    pub allow_duplicates: bool,
    pub error_policy: ErrorPolicy,
    /// Equi-join hashed memories; disabling collapses memories to one
    /// bucket (matching behavior, linear probing).
    pub hashed_memories: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            strategy: Strategy::Depth,
            salience_eval: SalienceEval::WhenDefined,
            allow_duplicates: false,
            error_policy: ErrorPolicy::Continue,
            hashed_memories: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_serde() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"strategy":"breadth"}"#).unwrap();
        assert_eq!(config.strategy, Strategy::Breadth);
        assert!(!config.allow_duplicates);
    }
}
