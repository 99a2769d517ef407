//! The release state machine.
//!
//! Transitions are described by a [`TransitionTable`] built once and injected
//! into a [`StateMachine`]. Each rule maps an action to its allowed source
//! statuses, its target status and an optional precondition. The machine is
//! pure: loading records, probing the artifact store and writing the new
//! status are the caller's job (see [`crate::service::ReleaseService`]).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ReleaseError;
use crate::models::{Game, Version, VersionStatus};

/// An action a reviewer or developer can apply to a version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseAction {
    Submit,
    #[serde(alias = "startReview")]
    StartReview,
    Pass,
    Fail,
    Approve,
    Reject,
    Publish,
    Archive,
    Republish,
}

impl ReleaseAction {
    pub const ALL: [ReleaseAction; 9] = [
        Self::Submit,
        Self::StartReview,
        Self::Pass,
        Self::Fail,
        Self::Approve,
        Self::Reject,
        Self::Publish,
        Self::Archive,
        Self::Republish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::StartReview => "start_review",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Publish => "publish",
            Self::Archive => "archive",
            Self::Republish => "republish",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "submit" => Some(Self::Submit),
            "start_review" | "startReview" => Some(Self::StartReview),
            "pass" => Some(Self::Pass),
            "fail" => Some(Self::Fail),
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "publish" => Some(Self::Publish),
            "archive" => Some(Self::Archive),
            "republish" => Some(Self::Republish),
            _ => None,
        }
    }

    /// Permission string checked before the action is applied.
    pub fn permission(&self) -> String {
        format!("release:{}", self.as_str())
    }

    /// Whether an accepted transition changes what the public registry shows.
    pub fn affects_registry(&self) -> bool {
        matches!(self, Self::Publish | Self::Archive | Self::Republish)
    }
}

impl fmt::Display for ReleaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts a precondition is evaluated against.
///
/// The caller gathers these before asking the machine to evaluate a rule.
#[derive(Debug, Clone, Copy)]
pub struct TransitionFacts<'a> {
    pub version: &'a Version,
    pub game: &'a Game,
    /// Result of the artifact existence probe. `None` when the rule does not
    /// ask for one.
    pub artifact_present: Option<bool>,
}

type Check = Box<dyn Fn(&TransitionFacts<'_>) -> Result<(), String> + Send + Sync>;

/// A gating condition on a transition. Returns the unmet condition's description on failure.
pub struct Precondition {
    name: &'static str,
    probes_artifact: bool,
    check: Check,
}

impl Precondition {
    pub fn new(
        name: &'static str,
        check: impl Fn(&TransitionFacts<'_>) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            probes_artifact: false,
            check: Box::new(check),
        }
    }

    /// Mark the precondition as needing `TransitionFacts::artifact_present`.
    pub fn probing_artifact(mut self) -> Self {
        self.probes_artifact = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn probes_artifact(&self) -> bool {
        self.probes_artifact
    }

    pub fn evaluate(&self, facts: &TransitionFacts<'_>) -> Result<(), String> {
        (self.check)(facts)
    }
}

impl fmt::Debug for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Precondition")
            .field("name", &self.name)
            .field("probes_artifact", &self.probes_artifact)
            .finish()
    }
}

#[derive(Debug)]
pub struct TransitionRule {
    pub action: ReleaseAction,
    pub from: Vec<VersionStatus>,
    pub to: VersionStatus,
    pub precondition: Option<Precondition>,
}

impl TransitionRule {
    pub fn new(action: ReleaseAction, from: &[VersionStatus], to: VersionStatus) -> Self {
        Self {
            action,
            from: from.to_vec(),
            to,
            precondition: None,
        }
    }

    pub fn guarded(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }

    pub fn allows_from(&self, status: VersionStatus) -> bool {
        self.from.contains(&status)
    }
}

/// Action-keyed transition rules. One rule per action.
#[derive(Debug, Default)]
pub struct TransitionTable {
    rules: BTreeMap<ReleaseAction, TransitionRule>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the rule for `rule.action`.
    pub fn with_rule(mut self, rule: TransitionRule) -> Self {
        self.rules.insert(rule.action, rule);
        self
    }

    pub fn rule(&self, action: ReleaseAction) -> Option<&TransitionRule> {
        self.rules.get(&action)
    }

    pub fn rules(&self) -> impl Iterator<Item = &TransitionRule> {
        self.rules.values()
    }

    /// The release pipeline used in production.
    pub fn standard() -> Self {
        use crate::models::VersionStatus::*;

        Self::new()
            .with_rule(
                TransitionRule::new(ReleaseAction::Submit, &[Draft, QcFailed], Uploaded)
                    .guarded(checklist_attested()),
            )
            .with_rule(TransitionRule::new(
                ReleaseAction::StartReview,
                &[Uploaded],
                QcProcessing,
            ))
            .with_rule(TransitionRule::new(ReleaseAction::Pass, &[QcProcessing], QcPassed))
            .with_rule(TransitionRule::new(ReleaseAction::Fail, &[QcProcessing], QcFailed))
            .with_rule(TransitionRule::new(ReleaseAction::Approve, &[QcPassed], Approved))
            .with_rule(TransitionRule::new(
                ReleaseAction::Reject,
                &[QcPassed, Approved],
                QcFailed,
            ))
            .with_rule(
                TransitionRule::new(ReleaseAction::Publish, &[Approved], Published)
                    .guarded(artifact_exists()),
            )
            .with_rule(TransitionRule::new(ReleaseAction::Archive, &[Published], Archived))
            .with_rule(
                TransitionRule::new(ReleaseAction::Republish, &[Archived], Published)
                    .guarded(game_enabled()),
            )
    }
}

fn checklist_attested() -> Precondition {
    Precondition::new("checklist_attested", |facts| {
        match &facts.version.self_checklist {
            None => Err("self-checklist has not been filled in".to_string()),
            Some(checklist) => {
                let missing = checklist.missing();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!(
                        "self-checklist incomplete, unattested: {}",
                        missing.join(", ")
                    ))
                }
            }
        }
    })
}

fn artifact_exists() -> Precondition {
    Precondition::new("artifact_exists", |facts| match facts.artifact_present {
        Some(true) => Ok(()),
        Some(false) => Err(format!(
            "build artifact not found at {}",
            facts.version.storage_path
        )),
        None => Err("artifact existence was not checked".to_string()),
    })
    .probing_artifact()
}

fn game_enabled() -> Precondition {
    Precondition::new("game_enabled", |facts| {
        if facts.game.disabled {
            Err(format!("game {} is disabled", facts.game.slug))
        } else {
            Ok(())
        }
    })
}

/// Evaluates actions against an injected [`TransitionTable`].
#[derive(Debug, Clone)]
pub struct StateMachine {
    table: Arc<TransitionTable>,
}

impl StateMachine {
    pub fn new(table: TransitionTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn standard() -> Self {
        Self::new(TransitionTable::standard())
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn can_transition(&self, status: VersionStatus, action: ReleaseAction) -> bool {
        self.table
            .rule(action)
            .is_some_and(|rule| rule.allows_from(status))
    }

    /// Every action whose source set contains `status`, in declaration order.
    pub fn valid_actions(&self, status: VersionStatus) -> Vec<ReleaseAction> {
        self.table
            .rules()
            .filter(|rule| rule.allows_from(status))
            .map(|rule| rule.action)
            .collect()
    }

    /// Look up the rule for `action` and confirm it applies to `status`.
    pub fn rule_for(
        &self,
        status: VersionStatus,
        action: ReleaseAction,
    ) -> Result<&TransitionRule, ReleaseError> {
        match self.table.rule(action) {
            Some(rule) if rule.allows_from(status) => Ok(rule),
            _ => Err(ReleaseError::InvalidTransition {
                action,
                status,
                valid: self.valid_actions(status),
            }),
        }
    }

    /// Decide the target status for applying `action` given `facts`.
    ///
    /// Status membership is checked before any precondition so a wrong-state
    /// request always reports `InvalidTransition`.
    pub fn evaluate(
        &self,
        action: ReleaseAction,
        facts: &TransitionFacts<'_>,
    ) -> Result<VersionStatus, ReleaseError> {
        let rule = self.rule_for(facts.version.status, action)?;

        if let Some(precondition) = &rule.precondition {
            precondition.evaluate(facts).map_err(|reason| {
                tracing::debug!(
                    action = %action,
                    precondition = precondition.name(),
                    "Precondition rejected transition: {}",
                    reason
                );
                ReleaseError::PreconditionFailed(reason)
            })?;
        }

        Ok(rule.to)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::standard()
    }
}
