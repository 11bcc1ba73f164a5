//! Name to canonical identity: search, score every hit, keep the best.

use crate::config::MetadataSettings;
use crate::core::models::IdentityProfile;
use crate::error::{PipelineError, Result};
use crate::services::metadata::{CandidateIdentity, MetadataSource, PersonDetails};

/// Search hits beyond this many are not scored.
const MAX_SCORED_CANDIDATES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    pub confirmed: bool,
    pub rationale: String,
}

/// Decides whether a resolved person is really the intended subject.
pub trait ConfirmationPredicate: Send + Sync {
    fn confirm(&self, details: &PersonDetails) -> Confirmation;
}

/// Confirms when enough credits match the configured languages or origin
/// countries, both as a share of all credits and as an absolute count.
#[derive(Debug, Clone)]
pub struct CreditShareConfirmation {
    pub languages: Vec<String>,
    pub countries: Vec<String>,
    pub min_share: f64,
    pub min_credits: usize,
}

impl CreditShareConfirmation {
    pub fn from_settings(settings: &MetadataSettings) -> Self {
        Self {
            languages: settings.confirm_languages.clone(),
            countries: settings.confirm_countries.clone(),
            min_share: settings.confirm_min_share,
            min_credits: settings.confirm_min_credits,
        }
    }
}

impl ConfirmationPredicate for CreditShareConfirmation {
    fn confirm(&self, details: &PersonDetails) -> Confirmation {
        let total = details.credits.len();
        if total == 0 {
            return Confirmation {
                confirmed: false,
                rationale: "no credits found".to_string(),
            };
        }
        let matching = details
            .credits
            .iter()
            .filter(|credit| {
                let language = credit
                    .original_language
                    .as_deref()
                    .is_some_and(|lang| self.languages.iter().any(|l| l == lang));
                language
                    || credit
                        .origin_country
                        .iter()
                        .any(|c| self.countries.contains(c))
            })
            .count();
        let share = matching as f64 / total as f64;
        Confirmation {
            confirmed: share >= self.min_share && matching >= self.min_credits,
            rationale: format!(
                "{}/{} credits match ({:.1}%)",
                matching,
                total,
                share * 100.0
            ),
        }
    }
}

/// Accepts everyone. Used when no confirmation rule applies.
pub struct AcceptAll;

impl ConfirmationPredicate for AcceptAll {
    fn confirm(&self, details: &PersonDetails) -> Confirmation {
        Confirmation {
            confirmed: true,
            rationale: format!("{} credits, not checked", details.credits.len()),
        }
    }
}

/// Exact name +100, popularity up to 100, profile image +50, credits up to
/// 50, confirmed +200.
pub fn score_candidate(
    query: &str,
    candidate: &CandidateIdentity,
    credit_count: usize,
    confirmed: bool,
) -> f64 {
    let mut score = 0.0;
    if candidate.name.trim().to_lowercase() == query.trim().to_lowercase() {
        score += 100.0;
    }
    score += candidate.popularity.clamp(0.0, 100.0);
    if candidate.profile_image_ref.is_some() {
        score += 50.0;
    }
    score += credit_count.min(50) as f64;
    if confirmed {
        score += 200.0;
    }
    score
}

struct Scored {
    candidate: CandidateIdentity,
    details: Option<PersonDetails>,
    confirmation: Confirmation,
    score: f64,
}

pub struct Identifier<'a> {
    metadata: &'a dyn MetadataSource,
    predicate: &'a dyn ConfirmationPredicate,
    settings: &'a MetadataSettings,
}

impl<'a> Identifier<'a> {
    pub fn new(
        metadata: &'a dyn MetadataSource,
        predicate: &'a dyn ConfirmationPredicate,
        settings: &'a MetadataSettings,
    ) -> Self {
        Self {
            metadata,
            predicate,
            settings,
        }
    }

    fn score(&self, name: &str, candidate: CandidateIdentity) -> Scored {
        let details = match self.metadata.details(candidate.id) {
            Ok(details) => Some(details),
            Err(e) => {
                log::warn!("Could not load details for {}: {}", candidate.name, e);
                None
            }
        };
        let confirmation = match &details {
            Some(details) => self.predicate.confirm(details),
            None => Confirmation {
                confirmed: false,
                rationale: "details unavailable".to_string(),
            },
        };
        let credits = details.as_ref().map(|d| d.credits.len()).unwrap_or(0);
        let score = score_candidate(name, &candidate, credits, confirmation.confirmed);
        log::debug!(
            "Candidate {} ({}): score {:.1}, {}",
            candidate.name,
            candidate.id,
            score,
            confirmation.rationale
        );
        Scored {
            candidate,
            details,
            confirmation,
            score,
        }
    }

    pub fn identify(&self, name: &str) -> Result<IdentityProfile> {
        let results = self.metadata.search(name)?;
        if results.is_empty() {
            return Err(PipelineError::NotFound {
                what: format!("no metadata match for '{name}'"),
            });
        }

        let mut best: Option<Scored> = None;
        for candidate in results.into_iter().take(MAX_SCORED_CANDIDATES) {
            let scored = self.score(name, candidate);
            if best.as_ref().is_none_or(|b| scored.score > b.score) {
                best = Some(scored);
            }
        }
        let Some(best) = best else {
            return Err(PipelineError::NotFound {
                what: format!("no metadata match for '{name}'"),
            });
        };

        if self.settings.require_confirmation && !best.confirmation.confirmed {
            return Err(PipelineError::NotFound {
                what: format!(
                    "no confident match for '{}': best was {} ({})",
                    name, best.candidate.name, best.confirmation.rationale
                ),
            });
        }

        let id = best.candidate.id;
        let candidate_image_refs = match self.metadata.images(id, self.settings.max_gallery_images) {
            Ok(images) => images.into_iter().map(|i| i.file_path).collect(),
            Err(e) => {
                log::warn!("Could not load gallery for {}: {}", id, e);
                Vec::new()
            }
        };
        let (display_name, profile_image_ref, credit_count) = match best.details {
            Some(details) => (
                details.name,
                details.profile_image_ref.or(best.candidate.profile_image_ref),
                details.credits.len(),
            ),
            None => (best.candidate.name, best.candidate.profile_image_ref, 0),
        };

        log::info!(
            "Identified '{}' as {} (id {}, {})",
            name,
            display_name,
            id,
            best.confirmation.rationale
        );
        Ok(IdentityProfile {
            canonical_id: id,
            display_name,
            candidate_image_refs,
            profile_image_ref,
            credit_count,
            confirmed: best.confirmation.confirmed,
            confirmation_rationale: best.confirmation.rationale,
        })
    }
}
