use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::request::ScopeLevel;

/// Full vocabulary of approval stages. A deployment's chain is an ordered
/// subset of these; nothing below assumes a particular length or order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Level1,
    Level2,
    Level3,
    Hod,
    Inventory,
    Purchase,
    Budget,
    Cfo,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Level1 => "level1",
            Self::Level2 => "level2",
            Self::Level3 => "level3",
            Self::Hod => "hod",
            Self::Inventory => "inventory",
            Self::Purchase => "purchase",
            Self::Budget => "budget",
            Self::Cfo => "cfo",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "level1" => Some(Self::Level1),
            "level2" => Some(Self::Level2),
            "level3" => Some(Self::Level3),
            "hod" => Some(Self::Hod),
            "inventory" => Some(Self::Inventory),
            "purchase" => Some(Self::Purchase),
            "budget" => Some(Self::Budget),
            "cfo" => Some(Self::Cfo),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("approval chain must contain at least one stage")]
    Empty,
    #[error("stage `{}` appears more than once in the chain", .0.as_str())]
    DuplicateStage(Stage),
    #[error("unknown stage name `{0}`")]
    UnknownStage(String),
    #[error("stage `{}` is not a member of the configured chain", .0.as_str())]
    StageNotInChain(Stage),
}

/// Ordered approval chain. "Next stage after X" is the list successor; the
/// successor of the last element is the terminal completed marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApprovalChain {
    stages: Vec<Stage>,
    cross_hospital_entry: Stage,
}

impl ApprovalChain {
    pub fn new(stages: Vec<Stage>) -> Result<Self, ChainError> {
        if stages.is_empty() {
            return Err(ChainError::Empty);
        }
        for (index, stage) in stages.iter().enumerate() {
            if stages[..index].contains(stage) {
                return Err(ChainError::DuplicateStage(*stage));
            }
        }

        let cross_hospital_entry = stages[0];
        Ok(Self { stages, cross_hospital_entry })
    }

    /// The canonical three-stage chain.
    pub fn canonical() -> Self {
        Self::new(vec![Stage::Level1, Stage::Hod, Stage::Cfo])
            .unwrap_or_else(|_| unreachable!("canonical chain is valid"))
    }

    pub fn with_cross_hospital_entry(mut self, stage: Stage) -> Result<Self, ChainError> {
        if !self.contains(stage) {
            return Err(ChainError::StageNotInChain(stage));
        }
        self.cross_hospital_entry = stage;
        Ok(self)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn first(&self) -> Stage {
        self.stages[0]
    }

    pub fn last(&self) -> Stage {
        self.stages[self.stages.len() - 1]
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }

    pub fn position(&self, stage: Stage) -> Option<usize> {
        self.stages.iter().position(|candidate| *candidate == stage)
    }

    /// List successor; `None` means the terminal completed marker comes next.
    pub fn successor(&self, stage: Stage) -> Option<Stage> {
        let position = self.position(stage)?;
        self.stages.get(position + 1).copied()
    }

    /// Entry stage for a new request. Cross-hospital requests may skip the
    /// lower local stages and enter further down the chain.
    pub fn entry_stage(&self, level: ScopeLevel) -> Stage {
        match level {
            ScopeLevel::SameHospital => self.first(),
            ScopeLevel::CrossHospital => self.cross_hospital_entry,
        }
    }

    /// Chain suffix starting at `stage` (inclusive). Used to seed the
    /// pending approval-flow steps a request will traverse.
    pub fn stages_from(&self, stage: Stage) -> Vec<Stage> {
        match self.position(stage) {
            Some(position) => self.stages[position..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Stages the escalation sweep may skip past. The final stage always
    /// requires a human decision.
    pub fn escalatable_stages(&self) -> Vec<Stage> {
        self.stages[..self.stages.len() - 1].to_vec()
    }
}

/// Role-to-stage lookup. Keys are normalized; unknown roles resolve to
/// `None` and surface as authorization failures at call time.
#[derive(Clone, Debug, Default)]
pub struct RoleMap {
    stages_by_role: HashMap<String, Stage>,
}

impl RoleMap {
    pub fn new(entries: Vec<(String, Stage)>) -> Self {
        let stages_by_role = entries
            .into_iter()
            .map(|(role, stage)| (normalize_key(&role), stage))
            .collect();

        Self { stages_by_role }
    }

    /// The canonical mapping for the three-stage chain.
    pub fn canonical() -> Self {
        Self::new(vec![
            ("supervisor".to_string(), Stage::Level1),
            ("hod".to_string(), Stage::Hod),
            ("cfo".to_string(), Stage::Cfo),
        ])
    }

    pub fn resolve(&self, role: &str) -> Option<Stage> {
        self.stages_by_role.get(&normalize_key(role)).copied()
    }

    pub fn roles(&self) -> impl Iterator<Item = (&str, Stage)> {
        self.stages_by_role.iter().map(|(role, stage)| (role.as_str(), *stage))
    }
}

pub(crate) fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
