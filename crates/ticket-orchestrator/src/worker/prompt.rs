//! Prompt text for one agent run

use std::path::Path;

use crate::context_engine::TicketContext;
use crate::store::{ConversationMessage, MessageRole, Project, Ticket};
use crate::utils::TextUtils;

const RESULT_PREVIEW_CHARS: usize = 200;

pub struct PromptInput<'a> {
    pub project: &'a Project,
    pub ticket: &'a Ticket,
    pub context: &'a TicketContext,
    pub global_context: Option<&'a str>,
    pub completion_marker: &'a str,
    pub work_dir: &'a Path,
}

pub fn build_prompt(input: &PromptInput<'_>) -> String {
    let PromptInput {
        project,
        ticket,
        context,
        ..
    } = input;
    let mut sections: Vec<String> = Vec::new();

    if !context.system_context.trim().is_empty() {
        sections.push(context.system_context.trim_end().to_string());
    }
    if let Some(global) = input.global_context.filter(|g| !g.trim().is_empty()) {
        sections.push(format!("=== SERVER ENVIRONMENT ===\n{}", global.trim()));
    }

    let mut header = vec![format!("You are working on project: {} ({})", project.name, project.code)];
    let mut paths = Vec::new();
    if let Some(web) = project.web_path.as_deref().filter(|p| !p.is_empty()) {
        header.push(format!("Web path: {}", web));
        paths.push(web.to_string());
    }
    if let Some(app) = project.app_path.as_deref().filter(|p| !p.is_empty()) {
        header.push(format!("App path: {}", app));
        paths.push(app.to_string());
    }
    if paths.is_empty() {
        header.push(format!("Work directory: {}", input.work_dir.display()));
        paths.push(input.work_dir.display().to_string());
    }
    if let Some(kind) = &project.project_type {
        header.push(format!("Project type: {}", kind));
    }
    if !project.tech_stack.is_empty() {
        header.push(format!("Tech stack: {}", project.tech_stack.join(", ")));
    }
    sections.push(header.join("\n"));

    if let Some(project_context) = project.context.as_deref().filter(|c| !c.trim().is_empty()) {
        sections.push(format!("=== PROJECT CONTEXT ===\n{}", project_context.trim()));
    }

    let mut ticket_block = format!("Ticket: {} - {}", ticket.ticket_number, ticket.title);
    if let Some(description) = ticket.description.as_deref().filter(|d| !d.trim().is_empty()) {
        ticket_block.push_str(&format!("\n\nDescription:\n{}", description.trim()));
    }
    sections.push(ticket_block);

    if let Some(ticket_context) = ticket.context.as_deref().filter(|c| !c.trim().is_empty()) {
        sections.push(format!("=== TICKET CONTEXT ===\n{}", ticket_context.trim()));
    }

    sections.push(format!(
        "IMPORTANT: You can ONLY create/modify files within: {}\n\
         Do NOT attempt to modify system files or files outside these directories.",
        paths.join(" and ")
    ));
    sections.push(format!(
        "Complete this task. When finished, say \"{}\" with a summary.",
        input.completion_marker
    ));

    if !context.history.is_empty() {
        sections.push(format!("=== CONVERSATION HISTORY ===\n{}", render_history(&context.history)));
        sections.push("Continue working on this task:".to_string());
    }

    sections.join("\n\n")
}

pub fn render_history(history: &[ConversationMessage]) -> String {
    history
        .iter()
        .filter_map(|message| match message.role {
            MessageRole::User => Some(format!("User: {}", message.content)),
            MessageRole::Assistant => Some(format!("Assistant: {}", message.content)),
            MessageRole::ToolUse => Some(format!(
                "[Used tool: {}]",
                message.tool_name.as_deref().unwrap_or("unknown")
            )),
            MessageRole::ToolResult => Some(format!(
                "[Result: {}]",
                TextUtils::truncate_with_ellipsis(&message.content, RESULT_PREVIEW_CHARS)
            )),
            MessageRole::System => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Priority, ProjectStatus, TicketStatus};
    use chrono::Utc;

    fn project() -> Project {
        Project {
            id: 1,
            name: "Shop".into(),
            code: "SHOP".into(),
            web_path: Some("/srv/shop".into()),
            app_path: Some("/srv/shop-app".into()),
            project_type: Some("laravel".into()),
            tech_stack: vec!["php".into(), "mysql".into()],
            context: Some("DB is shop_prod".into()),
            status: ProjectStatus::Active,
            total_tokens: 0,
            total_duration_seconds: 0,
        }
    }

    fn ticket() -> Ticket {
        Ticket {
            id: 9,
            project_id: 1,
            ticket_number: "SHOP-9".into(),
            title: "Fix checkout".into(),
            description: Some("Totals are off by one cent".into()),
            context: None,
            priority: Priority::High,
            status: TicketStatus::InProgress,
            result_summary: None,
            review_deadline: None,
            closed_at: None,
            closed_by: None,
            close_reason: None,
            total_tokens: 0,
            total_duration_seconds: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn message(role: MessageRole, content: &str, tool: Option<&str>) -> ConversationMessage {
        ConversationMessage {
            id: 1,
            ticket_id: 9,
            session_id: None,
            role,
            content: content.into(),
            tool_name: tool.map(str::to_string),
            token_count: 0,
            is_summarized: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_prompt_sections_in_order() {
        let context = TicketContext {
            system_context: "=== PROJECT KNOWLEDGE ===\n- use bcmath".into(),
            history: vec![message(MessageRole::User, "Task: Fix checkout", None)],
            ..Default::default()
        };
        let project = project();
        let ticket = ticket();
        let prompt = build_prompt(&PromptInput {
            project: &project,
            ticket: &ticket,
            context: &context,
            global_context: Some("PHP 8.2 installed"),
            completion_marker: "TASK COMPLETED",
            work_dir: Path::new("/srv/shop"),
        });

        let markers = [
            "=== PROJECT KNOWLEDGE ===",
            "=== SERVER ENVIRONMENT ===",
            "You are working on project: Shop (SHOP)",
            "=== PROJECT CONTEXT ===",
            "Ticket: SHOP-9 - Fix checkout",
            "ONLY create/modify files within: /srv/shop and /srv/shop-app",
            "say \"TASK COMPLETED\" with a summary",
            "=== CONVERSATION HISTORY ===",
        ];
        let positions: Vec<usize> = markers.iter().map(|m| prompt.find(m).unwrap()).collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(prompt.ends_with("Continue working on this task:"));
        assert!(!prompt.contains("=== TICKET CONTEXT ==="));
    }

    #[test]
    fn test_history_rendering() {
        let long = "r".repeat(500);
        let history = vec![
            message(MessageRole::User, "please fix", None),
            message(MessageRole::ToolUse, "{\"command\":\"ls\"}", Some("Bash")),
            message(MessageRole::ToolResult, &long, None),
            message(MessageRole::System, "Error: boom", None),
            message(MessageRole::Assistant, "fixed", None),
        ];
        let text = render_history(&history);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "User: please fix");
        assert_eq!(lines[1], "[Used tool: Bash]");
        assert!(lines[2].starts_with("[Result: rrr") && lines[2].len() < 220);
        assert_eq!(lines[3], "Assistant: fixed");
    }

    #[test]
    fn test_project_without_paths_uses_work_dir() {
        let mut project = project();
        project.web_path = None;
        project.app_path = None;
        let ticket = ticket();
        let context = TicketContext::default();
        let prompt = build_prompt(&PromptInput {
            project: &project,
            ticket: &ticket,
            context: &context,
            global_context: None,
            completion_marker: "DONE!",
            work_dir: Path::new("/var/www/projects/SHOP"),
        });
        assert!(prompt.contains("files within: /var/www/projects/SHOP"));
        assert!(!prompt.contains("CONVERSATION HISTORY"));
    }
}
