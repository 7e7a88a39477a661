//! One-shot terminal query: `ask [--owner NAME] <question…>`

use crm_chat_assistant::{
    api::{profile_from, ApiState},
    config::load_env_and_log_filter,
    memory::SessionContext,
    AppConfig,
};
use tracing::info;

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<(Option<String>, String), String> {
    let mut owner = None;
    let mut words = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--owner" => match args.next() {
                Some(name) => owner = Some(name),
                None => return Err("--owner needs a name".to_string()),
            },
            _ => words.push(arg),
        }
    }

    let question = words.join(" ");
    if question.trim().is_empty() {
        return Err("usage: ask [--owner NAME] <question…>".to_string());
    }
    Ok((owner, question))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables, then initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(load_env_and_log_filter("warn"))
        .with_writer(std::io::stderr)
        .init();

    let (owner, question) = match parse_args(std::env::args().skip(1)) {
        Ok(parsed) => parsed,
        Err(usage) => {
            eprintln!("{}", usage);
            std::process::exit(2);
        }
    };

    let config = AppConfig::from_env()?;
    let state = ApiState::bootstrap(&config).await?;

    let profile = profile_from(owner.as_deref(), None);
    let mut session = SessionContext::new(profile, config.memory_max_turns);

    info!(question = %question, "Running one-shot query");

    let answer = state.handler.answer(&question, &mut session).await?;

    println!("{}", answer.text);
    if !answer.matched_records.is_empty() {
        println!("\nBased on:");
        for ranked in &answer.matched_records {
            println!("  - {}", ranked.record.fact_line());
        }
    }

    if answer.upstream_failed {
        std::process::exit(1);
    }
    Ok(())
}
