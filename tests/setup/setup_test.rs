//! Setup wizard tests driven by scripted stdin against a local endpoint.

use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::json;

use devops_agent::config::AgentConfig;
use devops_agent::providers::openrouter::OpenRouterApi;
use devops_agent::setup::{choose_model, parse_model_choice, run_wizard, ChoiceError, SetupOptions};

use crate::http_server::{route, serve, Route};

fn models() -> Vec<String> {
    vec![
        "anthropic/claude-3-haiku".to_owned(),
        "openai/gpt-4o".to_owned(),
    ]
}

fn catalog() -> Route {
    let body = json!({"data": [{"id": "remote/model-a"}, {"id": "remote/model-b"}]});
    route("/models", 200, body.to_string())
}

fn api(base_url: &str) -> OpenRouterApi {
    OpenRouterApi::new(base_url.to_owned(), Duration::from_secs(5)).expect("client should build")
}

#[test]
fn numeric_choice_selects_listed_model() {
    assert_eq!(parse_model_choice("2", &models()), Ok("openai/gpt-4o".to_owned()));
    assert_eq!(
        parse_model_choice(" 1 ", &models()),
        Ok("anthropic/claude-3-haiku".to_owned())
    );
}

#[test]
fn text_choice_is_a_custom_model_id() {
    assert_eq!(
        parse_model_choice("mistralai/mixtral-8x7b", &models()),
        Ok("mistralai/mixtral-8x7b".to_owned())
    );
}

#[test]
fn bad_choices_are_rejected() {
    assert_eq!(parse_model_choice("", &models()), Err(ChoiceError::Empty));
    assert_eq!(
        parse_model_choice("0", &models()),
        Err(ChoiceError::OutOfRange { max: 2 })
    );
    assert_eq!(
        parse_model_choice("3", &models()),
        Err(ChoiceError::OutOfRange { max: 2 })
    );
}

#[test]
fn choose_model_reprompts_until_valid() {
    let mut input = Cursor::new("9\n\n2\n");
    let mut out = Vec::new();

    let chosen = choose_model(&models(), &mut input, &mut out).expect("should choose");
    assert_eq!(chosen, "openai/gpt-4o");

    let printed = String::from_utf8(out).expect("utf8");
    assert!(printed.contains("1. anthropic/claude-3-haiku"));
    assert!(printed.contains("please enter a number between 1 and 2"));
    assert!(printed.contains("please enter a number or a model ID"));
    assert!(printed.contains("Selected model: openai/gpt-4o"));
}

#[test]
fn choose_model_fails_when_input_ends() {
    let mut input = Cursor::new("");
    let mut out = Vec::new();
    assert!(choose_model(&models(), &mut input, &mut out).is_err());
}

#[tokio::test]
async fn interactive_wizard_collects_key_and_model() {
    let server = serve(vec![route("/auth/key", 200, "{}"), catalog()]).await;
    let mut input = Cursor::new("sk-or-typed\n2\n");
    let mut out = Vec::new();

    let config = run_wizard(
        &api(&server.base_url),
        SetupOptions::default(),
        None,
        &mut input,
        &mut out,
    )
    .await
    .expect("wizard should finish");

    assert_eq!(config.api_key, "sk-or-typed");
    assert_eq!(config.model, "remote/model-b");
    assert!(config.validate().is_ok());

    let printed = String::from_utf8(out).expect("utf8");
    assert!(printed.contains("Welcome to DevOps AI Agent Setup!"));
    assert!(printed.contains("API key validation successful!"));
}

#[tokio::test]
async fn wizard_offers_fallback_models_when_catalog_fails() {
    let server = serve(vec![route("/auth/key", 200, "{}"), route("/models", 503, "down")]).await;
    let mut input = Cursor::new("1\n");
    let mut out = Vec::new();
    let options = SetupOptions {
        api_key: Some("sk-or-flag".to_owned()),
        model: None,
    };

    let config = run_wizard(&api(&server.base_url), options, None, &mut input, &mut out)
        .await
        .expect("wizard should finish");

    let fallback = AgentConfig::default().catalog.fallback_models;
    assert_eq!(Some(&config.model), fallback.first());
}

#[tokio::test]
async fn rejected_flag_key_aborts_setup() {
    let server = serve(vec![route("/auth/key", 401, "{}")]).await;
    let options = SetupOptions {
        api_key: Some("sk-or-bad".to_owned()),
        model: Some("openai/gpt-4o".to_owned()),
    };
    let mut input = Cursor::new("");
    let mut out = Vec::new();

    let result = run_wizard(&api(&server.base_url), options, None, &mut input, &mut out).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn rejected_typed_key_is_asked_again() {
    let server = serve(vec![route("/auth/key", 401, "{}")]).await;
    let mut input = Cursor::new("sk-or-one\nsk-or-two\n");
    let mut out = Vec::new();

    let result = run_wizard(
        &api(&server.base_url),
        SetupOptions::default(),
        None,
        &mut input,
        &mut out,
    )
    .await;

    // Both keys are rejected, then input runs out.
    assert!(result.is_err());
    let printed = String::from_utf8(out).expect("utf8");
    assert_eq!(printed.matches("Invalid API key. Please try again.").count(), 2);
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn reconfiguring_keeps_existing_sections() {
    let server = serve(vec![route("/auth/key", 200, "{}")]).await;
    let mut existing = AgentConfig::with_credentials("sk-or-old", "old/model");
    existing.error_monitoring.log_files = vec![PathBuf::from("/var/log/app.log")];
    existing.error_monitoring.scan_interval = 42;

    let options = SetupOptions {
        api_key: Some("sk-or-new".to_owned()),
        model: Some("openai/gpt-4o".to_owned()),
    };
    let mut input = Cursor::new("");
    let mut out = Vec::new();

    let config = run_wizard(
        &api(&server.base_url),
        options,
        Some(existing),
        &mut input,
        &mut out,
    )
    .await
    .expect("wizard should finish");

    assert_eq!(config.api_key, "sk-or-new");
    assert_eq!(config.model, "openai/gpt-4o");
    assert_eq!(config.error_monitoring.scan_interval, 42);
    assert_eq!(
        config.error_monitoring.log_files,
        vec![PathBuf::from("/var/log/app.log")]
    );
}
