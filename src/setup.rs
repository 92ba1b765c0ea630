//! Interactive first-run setup.
//!
//! Collects and validates an API key, offers the model catalog, and
//! produces a configuration with monitoring defaults. Input and output are
//! generic so the flow can be driven from tests.

use std::io::{BufRead, Write};

use anyhow::Context;
use tracing::info;

use crate::config::AgentConfig;
use crate::providers::openrouter::OpenRouterApi;

/// Values supplied on the command line; missing ones are prompted for.
#[derive(Debug, Clone, Default)]
pub struct SetupOptions {
    /// API key from `--api-key`.
    pub api_key: Option<String>,
    /// Model id from `--model`.
    pub model: Option<String>,
}

/// Rejected model selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChoiceError {
    /// Nothing was entered.
    #[error("please enter a number or a model ID")]
    Empty,
    /// A number outside the listed range.
    #[error("please enter a number between 1 and {max}")]
    OutOfRange {
        /// Number of listed models.
        max: usize,
    },
}

/// Interpret a model selection: a 1-based index into `models`, or any other
/// text as a custom model id.
///
/// # Errors
///
/// Returns [`ChoiceError`] for empty input or an index out of range.
pub fn parse_model_choice(input: &str, models: &[String]) -> Result<String, ChoiceError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ChoiceError::Empty);
    }
    if input.chars().all(|c| c.is_ascii_digit()) {
        return input
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| models.get(i))
            .cloned()
            .ok_or(ChoiceError::OutOfRange { max: models.len() });
    }
    Ok(input.to_owned())
}

fn read_line<R: BufRead>(input: &mut R) -> anyhow::Result<String> {
    let mut line = String::new();
    let read = input.read_line(&mut line).context("failed to read input")?;
    if read == 0 {
        anyhow::bail!("input closed before setup finished");
    }
    Ok(line.trim().to_owned())
}

/// Show `models` and read a selection until one is accepted.
///
/// # Errors
///
/// Returns an error if input ends or writing the prompt fails.
pub fn choose_model<R: BufRead, W: Write>(
    models: &[String],
    input: &mut R,
    out: &mut W,
) -> anyhow::Result<String> {
    writeln!(out, "\nAvailable Models:")?;
    for (i, model) in models.iter().enumerate() {
        writeln!(out, "{}. {model}", i.saturating_add(1))?;
    }
    loop {
        write!(out, "\nSelect a model (number) or enter a custom model ID: ")?;
        out.flush()?;
        match parse_model_choice(&read_line(input)?, models) {
            Ok(model) => {
                writeln!(out, "Selected model: {model}")?;
                return Ok(model);
            }
            Err(e) => writeln!(out, "{e}.")?,
        }
    }
}

async fn prompt_api_key<R: BufRead, W: Write>(
    api: &OpenRouterApi,
    input: &mut R,
    out: &mut W,
) -> anyhow::Result<String> {
    loop {
        write!(out, "\nEnter your OpenRouter API key: ")?;
        out.flush()?;
        let key = read_line(input)?;
        writeln!(out, "Validating API key...")?;
        if api.validate_key(&key).await {
            writeln!(out, "API key validation successful!")?;
            return Ok(key);
        }
        writeln!(out, "Invalid API key. Please try again.")?;
    }
}

/// Run the wizard and return the resulting configuration (not yet saved).
///
/// `base` supplies sections to keep when reconfiguring; otherwise all
/// non-credential sections take their defaults.
///
/// # Errors
///
/// Returns an error if a key given on the command line is rejected, input
/// ends early, or terminal output fails.
pub async fn run_wizard<R: BufRead, W: Write>(
    api: &OpenRouterApi,
    options: SetupOptions,
    base: Option<AgentConfig>,
    input: &mut R,
    out: &mut W,
) -> anyhow::Result<AgentConfig> {
    writeln!(out, "\n{}", "=".repeat(50))?;
    writeln!(out, "Welcome to DevOps AI Agent Setup!")?;
    writeln!(out, "{}", "=".repeat(50))?;

    let api_key = match options.api_key {
        Some(key) => {
            writeln!(out, "Using provided API key from command line")?;
            if !api.validate_key(&key).await {
                anyhow::bail!("the provided API key was rejected by the endpoint");
            }
            key
        }
        None => prompt_api_key(api, input, out).await?,
    };

    let mut config = base.unwrap_or_default();
    let model = match options.model {
        Some(model) => {
            writeln!(out, "Using provided model: {model}")?;
            model
        }
        None => {
            writeln!(out, "\nFetching available models...")?;
            let models = api
                .list_models(&api_key, &config.catalog.fallback_models)
                .await;
            choose_model(&models, input, out)?
        }
    };

    config.api_key = api_key;
    config.model = model;
    info!(model = %config.model, "setup complete");
    Ok(config)
}
