//! Tag derivation: declarative rules from classification flags to tag keys.
//!
//! The rule table and the tag registry are checked once, when `TagRules` is
//! built: every flag must have exactly one rule and exactly one tag, and tag
//! keys must be unique. A built `TagRules` therefore cannot miss a mapping
//! while a message is being tagged.
//!
//! Derivation only ever adds keys to the message's existing set.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TagRuleError;
use crate::pipeline::types::{ClassificationResult, TagSet};

/// A tag-producing condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Flag {
    IsAdvertise,
    IsBusinessApproach,
    IsPersonalApproach,
    IsServiceImportant,
    IsServiceNotImportant,
    IsScam,
    HasCalendarInvite,
    SpfFail,
    DkimFail,
}

impl Flag {
    pub const ALL: [Flag; 9] = [
        Flag::IsAdvertise,
        Flag::IsBusinessApproach,
        Flag::IsPersonalApproach,
        Flag::IsServiceImportant,
        Flag::IsServiceNotImportant,
        Flag::IsScam,
        Flag::HasCalendarInvite,
        Flag::SpfFail,
        Flag::DkimFail,
    ];

    /// Name used in logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IsAdvertise => "is_advertise",
            Self::IsBusinessApproach => "is_business_approach",
            Self::IsPersonalApproach => "is_personal_approach",
            Self::IsServiceImportant => "is_service_important",
            Self::IsServiceNotImportant => "is_service_not_important",
            Self::IsScam => "is_scam",
            Self::HasCalendarInvite => "has_calendar_invite",
            Self::SpfFail => "spf_fail",
            Self::DkimFail => "dkim_fail",
        }
    }
}

impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tag in the mail store's registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub key: String,
    /// Display name.
    pub name: String,
    /// `#RRGGBB` color.
    pub color: String,
}

impl TagDefinition {
    pub fn new(key: &str, name: &str, color: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            color: color.to_string(),
        }
    }
}

/// Predicate over a classification result.
pub type FlagPredicate = fn(&ClassificationResult) -> bool;

/// One rule: when `applies` holds, the tag registered for `flag` is added.
#[derive(Debug, Clone, Copy)]
pub struct TagRule {
    pub flag: Flag,
    pub applies: FlagPredicate,
}

/// The built-in rule table.
///
/// `scam` is also raised by a strict SPF or DKIM failure; an `Unknown`
/// verification never raises anything.
pub fn standard_rules() -> Vec<TagRule> {
    vec![
        TagRule {
            flag: Flag::IsAdvertise,
            applies: |r| r.is_advertise,
        },
        TagRule {
            flag: Flag::IsBusinessApproach,
            applies: |r| r.is_business_approach,
        },
        TagRule {
            flag: Flag::IsPersonalApproach,
            applies: |r| r.is_personal_approach,
        },
        TagRule {
            flag: Flag::IsServiceImportant,
            applies: |r| r.is_service_important,
        },
        TagRule {
            flag: Flag::IsServiceNotImportant,
            applies: |r| r.is_service_not_important,
        },
        TagRule {
            flag: Flag::IsScam,
            applies: |r| r.is_scam || r.spf_pass.is_false() || r.dkim_pass.is_false(),
        },
        TagRule {
            flag: Flag::HasCalendarInvite,
            applies: |r| r.has_calendar_invite,
        },
        TagRule {
            flag: Flag::SpfFail,
            applies: |r| r.spf_pass.is_false(),
        },
        TagRule {
            flag: Flag::DkimFail,
            applies: |r| r.dkim_pass.is_false(),
        },
    ]
}

/// The managed tags, one per flag.
pub fn standard_registry() -> Vec<(Flag, TagDefinition)> {
    vec![
        (Flag::IsAdvertise, TagDefinition::new("adv", "Advertisement", "#FFC107")),
        (Flag::IsBusinessApproach, TagDefinition::new("business", "Business As", "#2196F3")),
        (Flag::IsPersonalApproach, TagDefinition::new("personal", "Personal Ad", "#4CAF50")),
        (
            Flag::IsServiceImportant,
            TagDefinition::new("important", "Service Important", "#F44336"),
        ),
        (
            Flag::IsServiceNotImportant,
            TagDefinition::new("service-info", "Service Info", "#9E9E9E"),
        ),
        (Flag::IsScam, TagDefinition::new("scam", "Scam Alert", "#FF5722")),
        (Flag::HasCalendarInvite, TagDefinition::new("calendar", "Appointment", "#7F07f2")),
        (Flag::SpfFail, TagDefinition::new("spf-fail", "SPF Fail", "#E91E63")),
        (Flag::DkimFail, TagDefinition::new("dkim-fail", "DKIM Fail", "#E91E63")),
    ]
}

/// Validated rule table joined with its tag registry.
#[derive(Debug, Clone)]
pub struct TagRules {
    entries: Vec<(TagRule, TagDefinition)>,
}

impl TagRules {
    /// Validate `rules` against `registry` and join them.
    pub fn new(
        rules: Vec<TagRule>,
        registry: Vec<(Flag, TagDefinition)>,
    ) -> Result<Self, TagRuleError> {
        let mut rule_by_flag: HashMap<Flag, TagRule> = HashMap::new();
        for rule in rules {
            if rule_by_flag.insert(rule.flag, rule).is_some() {
                return Err(TagRuleError::DuplicateRule {
                    flag: rule.flag.to_string(),
                });
            }
        }

        let mut seen_keys = HashSet::new();
        let mut tag_by_flag: HashMap<Flag, TagDefinition> = HashMap::new();
        for (flag, tag) in registry {
            if !seen_keys.insert(tag.key.clone()) {
                return Err(TagRuleError::DuplicateKey { key: tag.key });
            }
            if tag_by_flag.insert(flag, tag).is_some() {
                return Err(TagRuleError::DuplicateTag {
                    flag: flag.to_string(),
                });
            }
        }

        let mut entries = Vec::with_capacity(Flag::ALL.len());
        for flag in Flag::ALL {
            let rule = rule_by_flag
                .remove(&flag)
                .ok_or_else(|| TagRuleError::MissingRule {
                    flag: flag.to_string(),
                })?;
            let tag = tag_by_flag
                .remove(&flag)
                .ok_or_else(|| TagRuleError::MissingTag {
                    flag: flag.to_string(),
                })?;
            entries.push((rule, tag));
        }

        Ok(Self { entries })
    }

    /// The built-in table.
    pub fn standard() -> Result<Self, TagRuleError> {
        Self::new(standard_rules(), standard_registry())
    }

    /// Tags the store must know about.
    pub fn definitions(&self) -> impl Iterator<Item = &TagDefinition> {
        self.entries.iter().map(|(_, tag)| tag)
    }

    /// Tag registered for `flag`. Always `Some` for a validated table.
    pub fn tag_for(&self, flag: Flag) -> Option<&TagDefinition> {
        self.entries
            .iter()
            .find(|(rule, _)| rule.flag == flag)
            .map(|(_, tag)| tag)
    }

    /// Keys whose rules hold for `result`.
    pub fn matching(&self, result: &ClassificationResult) -> TagSet {
        self.entries
            .iter()
            .filter(|(rule, _)| (rule.applies)(result))
            .map(|(rule, tag)| {
                debug!(flag = %rule.flag, tag = %tag.key, "Tag rule matched");
                tag.key.clone()
            })
            .collect()
    }

    /// `existing` plus every key whose rule holds. Never removes a key.
    pub fn derive(&self, result: &ClassificationResult, existing: &TagSet) -> TagSet {
        let mut tags = existing.clone();
        tags.extend(self.matching(result));
        tags
    }
}
