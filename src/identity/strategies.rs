//! Ordered matching strategies.
//!
//! Each strategy is a pure function over [`MatchEvidence`] gathered up front by
//! the matcher. [`run_strategies`] tries them in order and stops at the first
//! strategy that matches or reports ambiguity.

use serde::{Deserialize, Serialize};

use super::store::LocalUser;

/// How trustworthy an automatic match is. Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
    Exact,
}

impl Confidence {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Exact => "exact",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "exact" => Ok(Self::Exact),
            other => Err(format!("unknown confidence level: {}", other)),
        }
    }
}

/// Which path produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    DirectLink,
    ProcessorMetadata,
    Email,
    FuzzyName,
    Manual,
}

impl MatchStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectLink => "direct_link",
            Self::ProcessorMetadata => "processor_metadata",
            Self::Email => "email",
            Self::FuzzyName => "fuzzy_name",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct_link" => Some(Self::DirectLink),
            "processor_metadata" => Some(Self::ProcessorMetadata),
            "email" => Some(Self::Email),
            "fuzzy_name" => Some(Self::FuzzyName),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }

    /// Confidence carried by a match from this strategy.
    #[must_use]
    pub fn confidence(&self) -> Confidence {
        match self {
            Self::DirectLink | Self::Manual => Confidence::Exact,
            Self::ProcessorMetadata => Confidence::High,
            Self::Email => Confidence::Medium,
            Self::FuzzyName => Confidence::Low,
        }
    }
}

impl std::fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything the strategies may look at, collected before any strategy runs.
#[derive(Debug, Clone, Default)]
pub struct MatchEvidence {
    pub external_ref: String,
    /// Local user id embedded in the processor customer's metadata.
    pub metadata_user_id: Option<String>,
    /// The local user behind `metadata_user_id`, if it still exists.
    pub metadata_user: Option<LocalUser>,
    pub email: Option<String>,
    /// Local users whose email equals `email` exactly.
    pub email_matches: Vec<LocalUser>,
    pub name: Option<String>,
    /// Local users that may match `name`; filtered by [`fuzzy_name`].
    pub name_candidates: Vec<LocalUser>,
}

/// Result of one strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyResult {
    Matched {
        user_id: String,
        strategy: MatchStrategy,
    },
    /// Several users qualify equally; do not guess.
    Ambiguous {
        strategy: MatchStrategy,
        candidates: Vec<String>,
    },
    NoMatch,
}

/// A pure resolver function.
pub type Strategy = fn(&MatchEvidence) -> StrategyResult;

/// The automatic strategies in the order they are tried.
pub const STRATEGIES: &[(MatchStrategy, Strategy)] = &[
    (MatchStrategy::ProcessorMetadata, processor_metadata),
    (MatchStrategy::Email, email),
    (MatchStrategy::FuzzyName, fuzzy_name),
];

/// Run [`STRATEGIES`] in order, short-circuiting on a match or an ambiguity.
#[must_use]
pub fn run_strategies(evidence: &MatchEvidence) -> StrategyResult {
    for (_, strategy) in STRATEGIES {
        match strategy(evidence) {
            StrategyResult::NoMatch => continue,
            decided => return decided,
        }
    }
    StrategyResult::NoMatch
}

/// Match on a local user id stored in the processor customer's metadata.
#[must_use]
pub fn processor_metadata(evidence: &MatchEvidence) -> StrategyResult {
    match (&evidence.metadata_user_id, &evidence.metadata_user) {
        (Some(claimed), Some(user)) if &user.id == claimed => StrategyResult::Matched {
            user_id: user.id.clone(),
            strategy: MatchStrategy::ProcessorMetadata,
        },
        _ => StrategyResult::NoMatch,
    }
}

/// Match on exact email equality. More than one owner is ambiguous.
#[must_use]
pub fn email(evidence: &MatchEvidence) -> StrategyResult {
    let Some(wanted) = evidence.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) else {
        return StrategyResult::NoMatch;
    };

    let mut owners: Vec<String> = evidence
        .email_matches
        .iter()
        .filter(|u| u.email.as_deref().map(str::trim) == Some(wanted))
        .map(|u| u.id.clone())
        .collect();
    owners.sort();
    owners.dedup();

    match owners.len() {
        0 => StrategyResult::NoMatch,
        1 => StrategyResult::Matched {
            user_id: owners.remove(0),
            strategy: MatchStrategy::Email,
        },
        _ => StrategyResult::Ambiguous {
            strategy: MatchStrategy::Email,
            candidates: owners,
        },
    }
}

/// Match on normalized display-name equality or containment.
///
/// Accepted only when exactly one candidate qualifies.
#[must_use]
pub fn fuzzy_name(evidence: &MatchEvidence) -> StrategyResult {
    let Some(wanted) = evidence.name.as_deref().map(normalize_name).filter(|n| !n.is_empty())
    else {
        return StrategyResult::NoMatch;
    };

    let mut qualifying: Vec<String> = evidence
        .name_candidates
        .iter()
        .filter(|u| {
            u.display_name
                .as_deref()
                .map(normalize_name)
                .is_some_and(|have| names_match(&have, &wanted))
        })
        .map(|u| u.id.clone())
        .collect();
    qualifying.sort();
    qualifying.dedup();

    match qualifying.len() {
        0 => StrategyResult::NoMatch,
        1 => StrategyResult::Matched {
            user_id: qualifying.remove(0),
            strategy: MatchStrategy::FuzzyName,
        },
        _ => StrategyResult::Ambiguous {
            strategy: MatchStrategy::FuzzyName,
            candidates: qualifying,
        },
    }
}

/// Lowercase and collapse runs of whitespace.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn names_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(b) || b.contains(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, email: Option<&str>, name: Option<&str>) -> LocalUser {
        LocalUser {
            id: id.to_string(),
            email: email.map(String::from),
            display_name: name.map(String::from),
        }
    }

    #[test]
    fn test_confidence_ordering_and_parse() {
        assert!(Confidence::Exact > Confidence::High);
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
        assert_eq!(" Medium ".parse::<Confidence>(), Ok(Confidence::Medium));
        assert!("certain".parse::<Confidence>().is_err());
    }

    #[test]
    fn test_strategy_confidence() {
        assert_eq!(MatchStrategy::DirectLink.confidence(), Confidence::Exact);
        assert_eq!(MatchStrategy::ProcessorMetadata.confidence(), Confidence::High);
        assert_eq!(MatchStrategy::Email.confidence(), Confidence::Medium);
        assert_eq!(MatchStrategy::FuzzyName.confidence(), Confidence::Low);
        assert_eq!(MatchStrategy::parse("fuzzy_name"), Some(MatchStrategy::FuzzyName));
    }

    #[test]
    fn test_processor_metadata_requires_existing_user() {
        let mut evidence = MatchEvidence {
            metadata_user_id: Some("user_42".to_string()),
            ..MatchEvidence::default()
        };
        assert_eq!(processor_metadata(&evidence), StrategyResult::NoMatch);

        evidence.metadata_user = Some(user("user_42", None, None));
        assert_eq!(
            processor_metadata(&evidence),
            StrategyResult::Matched {
                user_id: "user_42".to_string(),
                strategy: MatchStrategy::ProcessorMetadata
            }
        );
    }

    #[test]
    fn test_email_single_and_ambiguous() {
        let mut evidence = MatchEvidence {
            email: Some("a@b.com".to_string()),
            email_matches: vec![user("user_1", Some("a@b.com"), None)],
            ..MatchEvidence::default()
        };
        assert!(matches!(email(&evidence), StrategyResult::Matched { .. }));

        evidence.email_matches.push(user("user_2", Some("a@b.com"), None));
        assert_eq!(
            email(&evidence),
            StrategyResult::Ambiguous {
                strategy: MatchStrategy::Email,
                candidates: vec!["user_1".to_string(), "user_2".to_string()],
            }
        );
    }

    #[test]
    fn test_email_ignores_non_equal_rows() {
        let evidence = MatchEvidence {
            email: Some("a@b.com".to_string()),
            email_matches: vec![user("user_1", Some("other@b.com"), None)],
            ..MatchEvidence::default()
        };
        assert_eq!(email(&evidence), StrategyResult::NoMatch);
    }

    #[test]
    fn test_fuzzy_name_normalizes_and_contains() {
        let evidence = MatchEvidence {
            name: Some("  JANE   doe ".to_string()),
            name_candidates: vec![
                user("user_1", None, Some("Jane Doe")),
                user("user_2", None, Some("John Smith")),
            ],
            ..MatchEvidence::default()
        };
        assert_eq!(
            fuzzy_name(&evidence),
            StrategyResult::Matched {
                user_id: "user_1".to_string(),
                strategy: MatchStrategy::FuzzyName
            }
        );

        let contained = MatchEvidence {
            name: Some("Jane".to_string()),
            name_candidates: vec![user("user_1", None, Some("Jane Doe"))],
            ..MatchEvidence::default()
        };
        assert!(matches!(fuzzy_name(&contained), StrategyResult::Matched { .. }));
    }

    #[test]
    fn test_fuzzy_name_rejects_multiple() {
        let evidence = MatchEvidence {
            name: Some("Jane".to_string()),
            name_candidates: vec![
                user("user_1", None, Some("Jane Doe")),
                user("user_2", None, Some("Jane Roe")),
            ],
            ..MatchEvidence::default()
        };
        assert!(matches!(fuzzy_name(&evidence), StrategyResult::Ambiguous { .. }));
    }

    #[test]
    fn test_run_strategies_order() {
        // Metadata wins over email.
        let evidence = MatchEvidence {
            metadata_user_id: Some("user_meta".to_string()),
            metadata_user: Some(user("user_meta", None, None)),
            email: Some("a@b.com".to_string()),
            email_matches: vec![user("user_mail", Some("a@b.com"), None)],
            ..MatchEvidence::default()
        };
        assert!(matches!(
            run_strategies(&evidence),
            StrategyResult::Matched { ref user_id, .. } if user_id == "user_meta"
        ));

        // Email ambiguity stops the chain before the name strategy.
        let evidence = MatchEvidence {
            email: Some("a@b.com".to_string()),
            email_matches: vec![
                user("user_1", Some("a@b.com"), None),
                user("user_2", Some("a@b.com"), None),
            ],
            name: Some("Jane".to_string()),
            name_candidates: vec![user("user_3", None, Some("Jane"))],
            ..MatchEvidence::default()
        };
        assert!(matches!(run_strategies(&evidence), StrategyResult::Ambiguous { .. }));

        assert_eq!(run_strategies(&MatchEvidence::default()), StrategyResult::NoMatch);
    }
}
