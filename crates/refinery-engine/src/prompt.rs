use refinery_core::types::Agent;

pub const DOCUMENT_PLACEHOLDER: &str = "{{document}}";
pub const AGENT_NAME_PLACEHOLDER: &str = "{{agent_name}}";

/// System prompt for an agent, with a generic fallback.
pub fn system_prompt(agent: &Agent) -> String {
    match agent.system_prompt.as_deref() {
        Some(prompt) if !prompt.trim().is_empty() => prompt.to_string(),
        _ => format!(
            "You are the {} agent. Improve the document you are given and return only \
             the improved document.",
            agent.display_name
        ),
    }
}

/// Render the user prompt for `document`.
///
/// A template without `{{document}}` gets the document appended after a blank line.
pub fn user_prompt(agent: &Agent, document: &str) -> String {
    let template = agent
        .user_prompt_template
        .as_deref()
        .unwrap_or(DOCUMENT_PLACEHOLDER);
    // Agent name first so placeholders inside the document stay literal
    let named = template.replace(AGENT_NAME_PLACEHOLDER, &agent.name);
    if named.contains(DOCUMENT_PLACEHOLDER) {
        named.replace(DOCUMENT_PLACEHOLDER, document)
    } else {
        format!("{named}\n\n{document}")
    }
}
