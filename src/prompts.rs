//! Prompt text sent to the model.

use crate::monitor::Severity;

/// System prompt shared by every request.
pub const SYSTEM_PROMPT: &str = "You are a DevOps AI assistant. Answer in markdown \
with clear, numbered steps that an operator can execute in a terminal.";

/// Prompt asking for a diagnosis of an error excerpt.
///
/// `source` and `severity` are included when the excerpt comes from the
/// monitor; one-shot analysis passes `None`.
pub fn error_analysis(excerpt: &str, source: Option<(&str, Severity)>) -> String {
    let origin = match source {
        Some((source_id, severity)) => {
            format!("The following {severity}-severity error was detected in `{source_id}`.\n\n")
        }
        None => String::new(),
    };
    format!(
        "{origin}Analyze this error and provide a solution:\n\n\
```\n{excerpt}\n```\n\n\
Please explain:\n\
1. What is causing this error\n\
2. How to fix it\n\
3. Any preventive measures for the future\n\n\
Format your response in markdown with clear steps."
    )
}

/// Prompt asking for installation instructions for `tool`.
pub fn install_instructions(tool: &str) -> String {
    format!(
        "Provide detailed installation instructions for {tool}.\n\n\
Include:\n\
1. Prerequisites\n\
2. Step-by-step installation process\n\
3. Basic configuration\n\
4. How to verify the installation\n\
5. Common issues and troubleshooting\n\n\
Format your response in markdown with clear steps that can be executed in a terminal."
    )
}
