//! Folding extractions into long-lived project knowledge

use crate::store::{ExtractionSummary, ProjectKnowledge};

const CONTEXT_GOTCHAS: usize = 5;
const CONTEXT_SOLUTIONS: usize = 3;
const CONTEXT_DECISIONS: usize = 3;

/// Merge one extraction into the project's knowledge.
///
/// Notes become gotchas, solved problems become error solutions and decisions
/// become architecture decisions. Exact duplicates are skipped and each list
/// evicts its oldest entries once full.
pub fn merge_extraction(knowledge: &mut ProjectKnowledge, ticket_id: i64, summary: &ExtractionSummary) {
    knowledge.known_gotchas.extend(summary.important_notes.iter().cloned());
    knowledge.error_solutions.extend(summary.problems_solved.iter().cloned());
    knowledge.architecture_decisions.extend(summary.decisions.iter().cloned());
    knowledge.learned_from_tickets.push(ticket_id);
}

/// Prompt section for the project's knowledge, newest entries first.
pub fn render_knowledge(knowledge: &ProjectKnowledge) -> Option<String> {
    if knowledge.is_empty() {
        return None;
    }

    let mut out = String::from("=== PROJECT KNOWLEDGE ===\n");
    push_section(&mut out, "Known gotchas:", knowledge.known_gotchas.newest(CONTEXT_GOTCHAS));
    push_section(&mut out, "Past problems and their solutions:", knowledge.error_solutions.newest(CONTEXT_SOLUTIONS));
    push_section(&mut out, "Architecture decisions:", knowledge.architecture_decisions.newest(CONTEXT_DECISIONS));
    Some(out.trim_end().to_string())
}

fn push_section<'a>(out: &mut String, title: &str, items: impl Iterator<Item = &'a String>) {
    let items: Vec<&String> = items.collect();
    if items.is_empty() {
        return;
    }
    out.push_str(title);
    out.push('\n');
    for item in items {
        out.push_str("- ");
        out.push_str(item);
        out.push('\n');
    }
}
