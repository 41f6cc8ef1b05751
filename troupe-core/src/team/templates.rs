//! Fixed team templates.
//!
//! A template is a named recipe for an ephemeral team: role composition,
//! capabilities, and collaboration mode. The table is deliberately static;
//! unknown names fail fast instead of producing an empty team.

use crate::error::ValidationError;
use crate::team::types::{CollaborationMode, MemberRole, MemberSpec, TeamSpec};

/// Every template name `resolve_template` accepts.
pub const TEMPLATE_NAMES: &[&str] = &["research", "engineering", "qa", "debate"];

/// Resolve a template name into a ready-to-create team spec.
///
/// The spec's team name defaults to the template name; callers may rename it
/// before creation. Unknown names are a `ValidationError`.
pub fn resolve_template(name: &str) -> Result<TeamSpec, ValidationError> {
    let spec = match name {
        "research" => TeamSpec::new("research")
            .with_description("Leader-directed research with parallel fact finding")
            .with_mode(CollaborationMode::Hierarchical)
            .with_member(
                MemberSpec::new("lead-analyst", MemberRole::Leader)
                    .with_capabilities(["analysis", "planning"]),
            )
            .with_member(
                MemberSpec::new("researcher-1", MemberRole::Worker).with_capability("research"),
            )
            .with_member(
                MemberSpec::new("researcher-2", MemberRole::Worker).with_capability("research"),
            ),
        "engineering" => TeamSpec::new("engineering")
            .with_description("Lead plus implementers for build-and-verify work")
            .with_mode(CollaborationMode::Hierarchical)
            .with_member(
                MemberSpec::new("tech-lead", MemberRole::Leader)
                    .with_capabilities(["planning", "architecture"]),
            )
            .with_member(
                MemberSpec::new("engineer-1", MemberRole::Worker).with_capability("coding"),
            )
            .with_member(
                MemberSpec::new("engineer-2", MemberRole::Worker)
                    .with_capabilities(["coding", "testing"]),
            ),
        "qa" => TeamSpec::new("qa")
            .with_description("Review-then-verify quality gate")
            .with_mode(CollaborationMode::Sequential)
            .with_member(
                MemberSpec::new("reviewer", MemberRole::Reviewer).with_capability("code-review"),
            )
            .with_member(MemberSpec::new("tester", MemberRole::Worker).with_capability("testing")),
        "debate" => TeamSpec::new("debate")
            .with_description("Independent candidates judged by a reviewer")
            .with_mode(CollaborationMode::Debate)
            .with_member(
                MemberSpec::new("debater-1", MemberRole::Worker).with_capability("analysis"),
            )
            .with_member(
                MemberSpec::new("debater-2", MemberRole::Worker).with_capability("analysis"),
            )
            .with_member(
                MemberSpec::new("debater-3", MemberRole::Worker).with_capability("analysis"),
            )
            .with_member(
                MemberSpec::new("judge", MemberRole::Reviewer).with_capability("judgment"),
            ),
        other => {
            return Err(ValidationError::UnknownTemplate {
                name: other.to_string(),
            })
        }
    };
    Ok(spec)
}
