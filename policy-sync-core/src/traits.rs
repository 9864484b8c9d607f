//! Participant identity
//!
//! Identifiers the trainer uses to tell its predictors and gateways apart.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Registry-assigned participant identifier, stable for the life of a registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub u64);

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Role a participant plays in the training job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Serves batched inference; fetches and stages new models
    Predictor,
    /// Terminates client connections; pauses episode workers at a barrier
    Gateway,
}

impl Role {
    /// Every role, in notification order
    pub const ALL: [Role; 2] = [Role::Predictor, Role::Gateway];

    /// Stable name for logs and metrics
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Predictor => "predictor",
            Role::Gateway => "gateway",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
