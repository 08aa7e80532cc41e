//! Dialogue scenarios for deterministic simulation.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SIM-001: A few camera moves, then an answer
    QuickAnswer,

    /// SIM-002: The model never answers
    TurnExhaustion,

    /// SIM-003: The model repeats one instruction until corrected
    RepetitionBreaker,

    /// SIM-004: A move leaves the reconstructed scene
    BlankRecovery,

    /// SIM-005: Several instructions in one reply
    CompoundAction,

    /// SIM-006: A switch to a view that does not exist
    InvalidView,

    /// SIM-007: The model asks for the bird's-eye view
    OverviewRequest,

    /// SIM-008: Transport failures and dropped frames
    FlakyTransport,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::QuickAnswer,
            ScenarioId::TurnExhaustion,
            ScenarioId::RepetitionBreaker,
            ScenarioId::BlankRecovery,
            ScenarioId::CompoundAction,
            ScenarioId::InvalidView,
            ScenarioId::OverviewRequest,
            ScenarioId::FlakyTransport,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::QuickAnswer => "quick_answer",
            ScenarioId::TurnExhaustion => "turn_exhaustion",
            ScenarioId::RepetitionBreaker => "repetition_breaker",
            ScenarioId::BlankRecovery => "blank_recovery",
            ScenarioId::CompoundAction => "compound_action",
            ScenarioId::InvalidView => "invalid_view",
            ScenarioId::OverviewRequest => "overview_request",
            ScenarioId::FlakyTransport => "flaky_transport",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::QuickAnswer => "Move, rotate, answer; renderer released afterwards",
            ScenarioId::TurnExhaustion => "Endless rotations, session stops at the turn cap",
            ScenarioId::RepetitionBreaker => "Tenth identical instruction triggers the corrective prompt",
            ScenarioId::BlankRecovery => "Walk through a wall, restore the last viewpoint",
            ScenarioId::CompoundAction => "Switch, rotate and move from a single reply, in order",
            ScenarioId::InvalidView => "Out-of-range switch skipped and reported back",
            ScenarioId::OverviewRequest => "Bird's-eye request served from the stored overview",
            ScenarioId::FlakyTransport => "Two transport errors and a dropped frame, then success",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "quick_answer" | "quickanswer" | "sim-001" => Ok(ScenarioId::QuickAnswer),
            "turn_exhaustion" | "turnexhaustion" | "sim-002" => Ok(ScenarioId::TurnExhaustion),
            "repetition_breaker" | "repetitionbreaker" | "sim-003" => Ok(ScenarioId::RepetitionBreaker),
            "blank_recovery" | "blankrecovery" | "sim-004" => Ok(ScenarioId::BlankRecovery),
            "compound_action" | "compoundaction" | "sim-005" => Ok(ScenarioId::CompoundAction),
            "invalid_view" | "invalidview" | "sim-006" => Ok(ScenarioId::InvalidView),
            "overview_request" | "overviewrequest" | "sim-007" => Ok(ScenarioId::OverviewRequest),
            "flaky_transport" | "flakytransport" | "sim-008" => Ok(ScenarioId::FlakyTransport),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
    }

    #[test]
    fn test_aliases() {
        assert_eq!("SIM-004".parse::<ScenarioId>(), Ok(ScenarioId::BlankRecovery));
        assert!("chaos".parse::<ScenarioId>().is_err());
    }
}
