//! Prompt payloads sent to the generation CLI.
//!
//! The response shapes requested here must stay in sync with
//! [`crate::prd::TaskDescriptor`] and [`crate::generator::TriageVerdict`].

use crate::backlog::FeatureRequest;

const DESCRIPTOR_PROMPT: &str = r#"You are planning work for an autonomous coding agent.

Break the feature below into small user stories that can each be implemented,
tested and committed in a single sitting. Order them so that earlier stories
never depend on later ones. Group them into phases when it helps.

Feature: {title}

Context:
{context}

Respond with ONLY a JSON object of this exact shape, no prose:

{
  "project": "<short project name>",
  "description": "<one paragraph summary>",
  "userStories": [
    {
      "id": "US-001",
      "title": "<imperative title>",
      "description": "<what and why>",
      "acceptanceCriteria": ["<verifiable criterion>"],
      "priority": 1,
      "status": "incomplete",
      "phase": 1
    }
  ],
  "phases": {
    "1": { "name": "<phase name>", "description": "<phase goal>" }
  }
}
"#;

const TRIAGE_PROMPT: &str = r#"You triage user-submitted requests for a production web application.

Approve the request only if it is a concrete, actionable {kind} that fits the
product, is not abusive or spam, and is small enough to plan as a handful of
user stories. Reject vague wishes, duplicates and anything unsafe.

Title: {title}
Votes: {votes}

Description:
{description}

Respond with ONLY a JSON object, no prose:

{ "approved": true, "reason": "<one sentence>" }
"#;

pub fn descriptor_prompt(title: &str, context: &str) -> String {
    let context = if context.trim().is_empty() {
        "(none provided)"
    } else {
        context.trim()
    };
    DESCRIPTOR_PROMPT
        .replace("{title}", title.trim())
        .replace("{context}", context)
}

pub fn triage_prompt(request: &FeatureRequest) -> String {
    TRIAGE_PROMPT
        .replace("{kind}", request.kind.as_str())
        .replace("{title}", request.title.trim())
        .replace("{votes}", &request.votes.to_string())
        .replace("{description}", request.description.trim())
}

/// Context block for a backlog request being promoted into the queue.
pub fn request_context(request: &FeatureRequest) -> String {
    format!(
        "Type: {}\nVotes: {}\nBacklog request: {}\n\n{}",
        request.kind.as_str(),
        request.votes,
        request.id,
        request.description.trim()
    )
}
