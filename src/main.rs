mod api;
mod cli;
mod config;
mod protocol;
mod server;
mod session;
#[cfg(test)]
mod test_support;

use clap::{Parser, Subcommand};
use config::{ClientConfig, DEFAULT_API_BASE, DEFAULT_TIMEOUT_SECS};
use protocol::CreateSessionRequest;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "promptwire", version, about = "Stream prompt optimization sessions")]
struct Cli {
    /// Base URL of the optimization API.
    #[arg(long, env = "PROMPTWIRE_API_BASE", default_value = DEFAULT_API_BASE, global = true)]
    api_base: String,

    /// Bearer token for REST calls. Falls back to ~/.promptwire/token.
    #[arg(long, env = "PROMPTWIRE_TOKEN", global = true)]
    token: Option<String>,

    /// Timeout for REST calls, in seconds.
    #[arg(long, env = "PROMPTWIRE_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS, global = true)]
    timeout_secs: u64,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a session for a prompt and stream it to completion.
    Optimize {
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        prompt: Option<String>,
        /// Read the prompt from a file.
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        goal: Option<String>,
        /// Pre-answer a question, as ID=TEXT. Repeatable.
        #[arg(long = "answer", value_parser = cli::parse_answer)]
        answers: Vec<(String, String)>,
        /// Save the result through the API once completed.
        #[arg(long)]
        save: bool,
    },
    /// Stream an existing session.
    Attach {
        session_id: String,
        #[arg(long = "answer", value_parser = cli::parse_answer)]
        answers: Vec<(String, String)>,
        #[arg(long)]
        save: bool,
    },
    /// Print the saved result of a session.
    Fetch { session_id: String },
    /// Run the local rehearsal server.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        listen: String,
    },
    /// Print the JSON Schema of the session protocol.
    Schema,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let token = config::resolve_token(cli.token);
    let config = ClientConfig::new(&cli.api_base)
        .with_token(token.clone())
        .with_timeout(Duration::from_secs(cli.timeout_secs));

    match cli.command {
        Command::Optimize {
            prompt,
            file,
            goal,
            answers,
            save,
        } => {
            let prompt = cli::load_prompt(prompt, file).await?;
            let options = cli::StreamOptions {
                answers: answers.into_iter().collect(),
                save,
            };
            cli::optimize(&config, CreateSessionRequest { prompt, goal }, options).await?;
        }
        Command::Attach {
            session_id,
            answers,
            save,
        } => {
            let options = cli::StreamOptions {
                answers: answers.into_iter().collect(),
                save,
            };
            cli::attach(&config, &session_id, options).await?;
        }
        Command::Fetch { session_id } => {
            let api = api::ApiClient::new(&config)?;
            match api.fetch_result(&session_id).await? {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => return Err(format!("No saved result for session {}", session_id).into()),
            }
        }
        Command::Serve { listen } => {
            server::run(server::ServerConfig {
                listen,
                auth_token: token,
            })
            .await?;
        }
        Command::Schema => {
            println!("{}", cli::protocol_schema()?);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimize_requires_prompt_or_file() {
        assert!(Cli::try_parse_from(["promptwire", "optimize"]).is_err());
        assert!(
            Cli::try_parse_from(["promptwire", "optimize", "--prompt", "a", "--file", "b"])
                .is_err()
        );
    }

    #[test]
    fn answers_collect_into_pairs() {
        let cli = Cli::try_parse_from([
            "promptwire",
            "attach",
            "s-1",
            "--answer",
            "q1=formal",
            "--answer",
            "q2=short",
            "--api-base",
            "https://api.example.com",
        ])
        .unwrap();

        assert_eq!(cli.api_base, "https://api.example.com");
        match cli.command {
            Command::Attach {
                session_id,
                answers,
                save,
            } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(
                    answers,
                    vec![
                        ("q1".to_string(), "formal".to_string()),
                        ("q2".to_string(), "short".to_string())
                    ]
                );
                assert!(!save);
            }
            _ => panic!("expected attach"),
        }
    }

    #[test]
    fn malformed_answer_is_rejected() {
        assert!(Cli::try_parse_from(["promptwire", "attach", "s-1", "--answer", "oops"]).is_err());
    }
}
