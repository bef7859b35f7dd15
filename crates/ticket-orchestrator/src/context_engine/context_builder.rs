//! Assembles the system-context string handed to the agent

use crate::store::{ConversationExtraction, ProjectMap, UserPreferences};
use crate::utils::TextUtils;

const MAX_STRUCTURE_CHARS: usize = 2000;
const MAX_NOTES: usize = 10;
const MAX_DECISIONS: usize = 5;
const MAX_PROBLEMS: usize = 5;
const MAX_FILES: usize = 10;

/// The optional pieces of a system context, each already loaded.
#[derive(Debug, Default)]
pub struct ContextSections<'a> {
    pub preferences: Option<&'a UserPreferences>,
    pub project_map: Option<&'a ProjectMap>,
    pub knowledge: Option<String>,
    pub environment: Option<String>,
    pub extraction: Option<&'a ConversationExtraction>,
}

/// Joins sections in a fixed order: preferences, project map, knowledge,
/// environment runbooks, then the latest extraction.
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn build(sections: &ContextSections<'_>) -> String {
        let parts: Vec<String> = [
            sections.preferences.and_then(render_preferences),
            sections.project_map.map(render_project_map),
            sections.knowledge.clone(),
            sections
                .environment
                .as_ref()
                .map(|env| format!("=== ENVIRONMENT NOTES ===\n{}", env.trim())),
            sections.extraction.map(render_extraction),
        ]
        .into_iter()
        .flatten()
        .filter(|part| !part.trim().is_empty())
        .collect();

        parts.join("\n\n")
    }
}

pub fn render_preferences(prefs: &UserPreferences) -> Option<String> {
    let mut lines = Vec::new();
    if let Some(language) = &prefs.language {
        lines.push(format!("Preferred language: {}", language));
    }
    if let Some(style) = &prefs.response_style {
        lines.push(format!("Response style: {}", style));
    }
    if let Some(level) = &prefs.skill_level {
        lines.push(format!("Skill level: {}", level));
    }
    if let Some(instructions) = &prefs.custom_instructions {
        lines.push(format!("Instructions: {}", instructions));
    }
    for quirk in &prefs.learned_quirks {
        lines.push(format!("- {}", quirk));
    }
    if lines.is_empty() {
        return None;
    }
    Some(format!("=== USER PREFERENCES ===\n{}", lines.join("\n")))
}

pub fn render_project_map(map: &ProjectMap) -> String {
    let mut out = String::from("=== PROJECT STRUCTURE ===\n");
    out.push_str(TextUtils::take_chars(map.structure_summary.trim_end(), MAX_STRUCTURE_CHARS));
    if !map.tech_stack.is_empty() {
        out.push_str(&format!("\nTech stack: {}", map.tech_stack.join(", ")));
    }
    if !map.entry_points.is_empty() {
        out.push_str(&format!("\nEntry points: {}", map.entry_points.join(", ")));
    }
    if let Some(language) = &map.primary_language {
        out.push_str(&format!("\nPrimary language: {}", language));
    }
    out
}

/// Latest extraction, standing notes first.
pub fn render_extraction(extraction: &ConversationExtraction) -> String {
    let summary = &extraction.summary;
    let mut out = String::from("=== PREVIOUS WORK ON THIS TICKET ===\n");

    if !summary.important_notes.is_empty() {
        out.push_str("IMPORTANT - ALWAYS REMEMBER:\n");
        for note in summary.important_notes.iter().take(MAX_NOTES) {
            out.push_str(&format!("!!! {}\n", note));
        }
        out.push('\n');
    }
    push_list(&mut out, "Decisions made:", &summary.decisions, MAX_DECISIONS);
    push_list(&mut out, "Problems solved:", &summary.problems_solved, MAX_PROBLEMS);
    push_list(&mut out, "Files modified:", &summary.files_referenced, MAX_FILES);
    if let Some(info) = &summary.key_info {
        out.push_str(&format!("Key info: {}\n", info));
    }
    if !summary.current_status.is_empty() {
        out.push_str(&format!("Current status: {}\n", summary.current_status));
    }
    out.trim_end().to_string()
}

fn push_list(out: &mut String, title: &str, items: &[String], cap: usize) {
    if items.is_empty() {
        return;
    }
    out.push_str(title);
    out.push('\n');
    for item in items.iter().take(cap) {
        out.push_str(&format!("- {}\n", item));
    }
}
