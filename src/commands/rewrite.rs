use anyhow::{Context, Result};
use reprompt_runtime::{Config, ModelHandle, RePrompt, RewriteOutcome};
use serde::Serialize;
use std::io::BufRead;
use tracing::info;

/// One line of `--json` output
#[derive(Serialize)]
struct RewriteRecord<'a> {
    prompt: &'a str,
    rewritten: &'a str,
    fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn run(config: Config, prompts: Vec<String>, json: bool) -> Result<()> {
    let prompts = if prompts.is_empty() {
        read_stdin_prompts()?
    } else {
        prompts
    };
    if prompts.is_empty() {
        anyhow::bail!("no prompts given");
    }

    info!(
        model = %config.model.model_path.display(),
        prompts = prompts.len(),
        "Loading rewriting model"
    );

    // Loading and decoding are CPU/GPU bound; keep them off the async workers
    let outcomes = tokio::task::spawn_blocking(move || -> Result<Vec<(String, RewriteOutcome)>> {
        let model = ModelHandle::from_config(&config.model)?;
        let mut reprompt = RePrompt::new(model).with_params(config.generation.params.clone());

        Ok(prompts
            .into_iter()
            .map(|prompt| {
                let outcome = reprompt.rewrite(&config.generation.request(prompt.as_str()));
                (prompt, outcome)
            })
            .collect())
    })
    .await
    .context("rewrite task panicked")??;

    for (prompt, outcome) in &outcomes {
        let rewritten = match outcome {
            RewriteOutcome::Rewritten(text) => text.as_str(),
            RewriteOutcome::Fallback { prompt, .. } => prompt.as_str(),
        };
        if json {
            let record = RewriteRecord {
                prompt,
                rewritten,
                fallback: outcome.is_fallback(),
                error: outcome.error().map(ToString::to_string),
            };
            println!("{}", serde_json::to_string(&record)?);
        } else {
            println!("{}", rewritten);
        }
    }
    Ok(())
}

fn read_stdin_prompts() -> Result<Vec<String>> {
    let stdin = std::io::stdin();
    let mut prompts = Vec::new();
    for line in stdin.lock().lines() {
        let line = line.context("failed to read stdin")?;
        let line = line.trim();
        if !line.is_empty() {
            prompts.push(line.to_string());
        }
    }
    Ok(prompts)
}
