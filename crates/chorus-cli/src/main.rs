use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chorus_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use chorus_contracts::config::ClientConfig;
use chorus_contracts::conversation::{ChatTurn, Conversation, ConversationState, ResponseKind};
use chorus_contracts::features::{extract, ResponseFeatures};
use chorus_contracts::ids::generate_request_id;
use chorus_contracts::models::DEFAULT_SELECTED_MODELS;
use chorus_contracts::session::Session;
use chorus_contracts::similarity::{compute_groups, GroupingConfig, SimilarityMatrix};
use chorus_contracts::stream::{AbortSignal, EventStream, StreamRouter};
use chorus_engine::{AnalysisMode, ChatSession, HttpBackend, TurnReport};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "chorus", version, about = "Ask several chat models at once and compare their answers")]
struct Cli {
    /// Backend base URL (overrides CHORUS_API_BASE).
    #[arg(long, global = true)]
    api_base: Option<String>,
    /// Session file (overrides CHORUS_SESSION_PATH).
    #[arg(long, global = true)]
    session: Option<PathBuf>,
    /// Similarity grouping threshold in [0, 1] (overrides CHORUS_SIMILARITY_THRESHOLD).
    #[arg(long, global = true)]
    threshold: Option<f64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive multi-model chat.
    Chat(ChatArgs),
    /// Route a recorded NDJSON stream through a local conversation.
    Replay(ReplayArgs),
    /// Group models from a similarity matrix JSON file.
    Group(GroupArgs),
    /// Print lexical features for a response text.
    Features(FeaturesArgs),
    /// Store an access token in the session file.
    Login(LoginArgs),
    /// Forget the stored access token.
    Logout,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,
    #[arg(long)]
    transcript: Option<PathBuf>,
    #[arg(long)]
    language: Option<String>,
}

#[derive(Debug, Parser)]
struct ReplayArgs {
    #[arg(long)]
    stream: PathBuf,
    #[arg(long)]
    message: String,
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,
    #[arg(long)]
    request_id: Option<String>,
}

#[derive(Debug, Parser)]
struct GroupArgs {
    #[arg(long)]
    matrix: PathBuf,
    #[arg(long, default_value = "local")]
    request_id: String,
}

#[derive(Debug, Parser)]
struct FeaturesArgs {
    #[arg(long, conflicts_with = "file")]
    text: Option<String>,
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct LoginArgs {
    token: String,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("chorus error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus=info,chorus_engine=info,chorus_contracts=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    match cli.command {
        Command::Chat(args) => {
            run_chat(config, args)?;
            Ok(0)
        }
        Command::Replay(args) => run_replay(config, args),
        Command::Group(args) => run_group(config, args),
        Command::Features(args) => run_features(args),
        Command::Login(args) => {
            let mut session = Session::load(&config.session_path);
            session.login(&args.token)?;
            println!("Logged in (session: {})", session.path().display());
            Ok(0)
        }
        Command::Logout => {
            Session::load(&config.session_path).logout()?;
            println!("Logged out");
            Ok(0)
        }
    }
}

fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env()?;
    if let Some(api_base) = &cli.api_base {
        config.api_base = api_base.clone();
    }
    if let Some(session) = &cli.session {
        config.session_path = session.clone();
    }
    if let Some(threshold) = cli.threshold {
        config.grouping = GroupingConfig::new(threshold)?;
    }
    debug!(?config, "resolved client config");
    Ok(config)
}

fn run_chat(config: ClientConfig, args: ChatArgs) -> Result<()> {
    let session = Session::load(&config.session_path);
    let backend = Arc::new(HttpBackend::new(config.clone())?);
    let mut chat = ChatSession::new(config, backend, session);
    if let Some(path) = args.transcript {
        chat = chat.with_transcript(path);
    }
    if !args.models.is_empty() {
        chat.set_selected_models(args.models.as_slice())?;
    }
    if let Some(language) = args.language.as_deref() {
        chat.set_language(language)?;
    }

    let stdin = io::stdin();
    let mut line = String::new();
    println!(
        "Chorus chat started with {}. Type /help for commands.",
        chat.selected_models().join(", ")
    );

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "quit" => break,
            "help" => {
                for (usage, about) in CHAT_HELP_COMMANDS {
                    println!("  {usage:<40} {about}");
                }
            }
            "send" => {
                let Some(prompt) = intent.prompt.as_deref() else {
                    continue;
                };
                match chat.send_message(prompt) {
                    Ok(report) => print_turn(&chat.conversation(), chat.selected_models(), &report),
                    Err(err) => println!("Send failed: {err:#}"),
                }
            }
            "analyze_image" => {
                let path = intent.arg_str("path").unwrap_or_default();
                if path.is_empty() {
                    println!("/image requires a path");
                    continue;
                }
                let mode = AnalysisMode::parse(intent.arg_str("mode").unwrap_or_default());
                match chat.analyze_image(Path::new(path), mode) {
                    Ok(report) => print_turn(&chat.conversation(), chat.selected_models(), &report),
                    Err(err) => println!("Image analysis failed: {err:#}"),
                }
            }
            "list_models" => {
                for model in chat.registry().list() {
                    let mark = if chat.selected_models().contains(&model.id) {
                        "*"
                    } else {
                        " "
                    };
                    let preferred = if chat.preferred_model() == Some(model.id.as_str()) {
                        " (preferred)"
                    } else {
                        ""
                    };
                    println!(
                        "{mark} {:<10} {:<10} {}{preferred}",
                        model.id, model.display_name, model.provider
                    );
                }
            }
            "set_models" => {
                let ids: Vec<String> = intent
                    .command_args
                    .get("models")
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                match chat.set_selected_models(ids.as_slice()) {
                    Ok(()) => println!("Comparing: {}", chat.selected_models().join(", ")),
                    Err(err) => println!("{err:#}"),
                }
            }
            "set_preferred_model" => {
                let model = intent.arg_str("model").unwrap_or_default();
                match chat.set_preferred_model(model) {
                    Ok(()) => println!("Preferred model set to {}", model.to_ascii_lowercase()),
                    Err(err) => println!("{err:#}"),
                }
            }
            "set_language" => match intent.arg_str("language") {
                Some(language) => match chat.set_language(language) {
                    Ok(()) => println!("Language set to {language}"),
                    Err(err) => println!("{err:#}"),
                },
                None => println!("/lang requires a language code"),
            },
            "set_threshold" => {
                match intent.settings_update.get("threshold").and_then(Value::as_f64) {
                    Some(threshold) => match chat.set_threshold(threshold) {
                        Ok(()) => println!("Similarity threshold set to {threshold}"),
                        Err(err) => println!("{err:#}"),
                    },
                    None => println!("/threshold requires a number between 0 and 1"),
                }
            }
            "show_groups" | "show_features" | "show_analysis" => {
                let Some(request_id) = chat.last_request_id().map(str::to_string) else {
                    println!("No turns yet");
                    continue;
                };
                chat.conversation().read(|state| match intent.action.as_str() {
                    "show_groups" => print_groups(state, &request_id, chat.selected_models()),
                    "show_features" => print_features(state, &request_id),
                    _ => print_analysis(state, &request_id),
                });
            }
            "login" => {
                let token = intent.arg_str("token").unwrap_or_default();
                match chat.login(token) {
                    Ok(()) => println!("Logged in"),
                    Err(err) => println!("{err:#}"),
                }
            }
            "logout" => match chat.logout() {
                Ok(()) => println!("Logged out"),
                Err(err) => println!("{err:#}"),
            },
            "unknown" => {
                let command = intent.arg_str("command").unwrap_or_default();
                println!("Unknown command: /{command}");
            }
            other => println!("Unsupported action: {other}"),
        }
    }
    Ok(())
}

fn run_replay(config: ClientConfig, args: ReplayArgs) -> Result<i32> {
    let models = if args.models.is_empty() {
        DEFAULT_SELECTED_MODELS
            .iter()
            .map(|id| id.to_string())
            .collect()
    } else {
        args.models.clone()
    };
    let request_id = args.request_id.clone().unwrap_or_else(generate_request_id);
    let file = fs::File::open(&args.stream)
        .with_context(|| format!("failed to open {}", args.stream.display()))?;

    let conversation = Conversation::new();
    conversation.update(|state| state.begin_turn(ChatTurn::new(&request_id, &args.message), &models))?;
    let router = StreamRouter::new(
        conversation.clone(),
        &request_id,
        models.clone(),
        &args.message,
        config.grouping,
    );
    let summary = router.run(EventStream::new(file, AbortSignal::new()));
    let insights = conversation.update(|state| state.derive_turn_insights(&request_id, &models, config.grouping));

    let report = TurnReport {
        request_id,
        analyzer: String::new(),
        fallback_reason: None,
        summary,
        insights,
        vision_unsupported: Vec::new(),
    };
    print_turn(&conversation, &models, &report);
    Ok(if summary.failed { 1 } else { 0 })
}

fn run_group(config: ClientConfig, args: GroupArgs) -> Result<i32> {
    let raw = fs::read_to_string(&args.matrix)
        .with_context(|| format!("failed to read {}", args.matrix.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", args.matrix.display()))?;
    let scores = value.get("similarityMatrix").unwrap_or(&value);
    let Some(matrix) = SimilarityMatrix::from_value(&args.request_id, scores) else {
        bail!("{} does not contain a similarity matrix object", args.matrix.display());
    };
    let groups = compute_groups(&matrix, config.grouping.threshold);
    println!("{}", serde_json::to_string_pretty(&groups)?);
    Ok(0)
}

fn run_features(args: FeaturesArgs) -> Result<i32> {
    let text = match (args.text, args.file) {
        (Some(text), _) => text,
        (None, Some(path)) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => bail!("pass --text or --file"),
    };
    println!("{}", serde_json::to_string_pretty(&extract(&text))?);
    Ok(0)
}

fn print_turn(conversation: &Conversation, models: &[String], report: &TurnReport) {
    conversation.read(|state| {
        let groups = state.groups(&report.request_id);
        for model in models {
            let tier = groups
                .map(|groups| groups.tier_of(model).label())
                .unwrap_or_else(|| "ungrouped".to_string());
            for message in state.messages_for_turn(model, &report.request_id) {
                match message.kind {
                    ResponseKind::User => {}
                    ResponseKind::Reply => println!("[{model} | {tier}] {}", message.text),
                    ResponseKind::Error => println!("[{model} | error] {}", message.text),
                }
            }
        }
        if let Some(answer) = state.analysis_for_turn(&report.request_id) {
            let by = answer.bot_name.as_deref().unwrap_or("analyzer");
            println!("[optimal | {by}] {}", answer.best_response);
        }
        for note in state.notes(&report.request_id) {
            println!("note: {note}");
        }
    });
    if report.summary.malformed > 0 || report.summary.discarded > 0 {
        println!(
            "({} malformed line(s) skipped, {} event(s) discarded)",
            report.summary.malformed, report.summary.discarded
        );
    }
}

fn print_groups(state: &ConversationState, request_id: &str, models: &[String]) {
    let Some(groups) = state.groups(request_id) else {
        println!("No similarity groups for {request_id}");
        return;
    };
    println!("main:      {}", groups.main_group.join(", "));
    for (idx, group) in groups.secondary_groups.iter().enumerate() {
        println!("secondary-{}: {}", idx + 1, group.join(", "));
    }
    println!("outliers:  {}", groups.outliers.join(", "));
    let ungrouped: Vec<&str> = models
        .iter()
        .filter(|model| !groups.model_ids().any(|id| id == *model))
        .map(String::as_str)
        .collect();
    if !ungrouped.is_empty() {
        println!("ungrouped: {}", ungrouped.join(", "));
    }
}

fn print_features(state: &ConversationState, request_id: &str) {
    let Some(rows) = state.features(request_id) else {
        println!("No features for {request_id}");
        return;
    };
    for (model, row) in rows {
        println!("{model}: {}", feature_badges(row));
    }
}

fn feature_badges(row: &ResponseFeatures) -> String {
    let features = &row.features;
    let mut badges = vec![
        format!("lang={}", features.detected_lang),
        format!("chars={}", features.length),
        format!("diversity={:.2}", features.vocabulary_diversity),
    ];
    if features.has_code {
        badges.push(format!("code={}", features.code_block_count));
    }
    if features.list_item_count > 0 {
        badges.push(format!("list={}", features.list_item_count));
    }
    if features.link_count > 0 {
        badges.push(format!("links={}", features.link_count));
    }
    badges.join(" ")
}

fn print_analysis(state: &ConversationState, request_id: &str) {
    let Some(answer) = state.analysis_for_turn(request_id) else {
        println!("No analysis for {request_id}");
        return;
    };
    let rendered = json!({
        "bestResponse": answer.best_response,
        "preferredModel": answer.bot_name,
        "reasoning": answer.reasoning,
        "analysis": answer.assessments,
        "errors": answer.errors,
    });
    match serde_json::to_string_pretty(&rendered) {
        Ok(text) => println!("{text}"),
        Err(err) => println!("failed to render analysis: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chorus_contracts::config::ClientConfig;
    use chorus_contracts::features::ResponseFeatures;
    use clap::Parser;

    use super::{feature_badges, run_group, Cli, Command, GroupArgs};

    #[test]
    fn parses_global_options_after_subcommand() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "chorus",
            "chat",
            "--models",
            "gpt,claude",
            "--threshold",
            "0.4",
        ])?;
        assert_eq!(cli.threshold, Some(0.4));
        match cli.command {
            Command::Chat(args) => assert_eq!(args.models, ["gpt", "claude"]),
            other => panic!("unexpected command: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn features_rejects_text_and_file_together() {
        let parsed = Cli::try_parse_from(["chorus", "features", "--text", "a", "--file", "b"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn group_reads_wrapped_matrix() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("matrix.json");
        fs::write(
            &path,
            r#"{"similarityMatrix":{"gpt":{"claude":0.9,"mixtral":0.0},"claude":{"gpt":0.9}}}"#,
        )?;
        let code = run_group(
            ClientConfig::default(),
            GroupArgs {
                matrix: path,
                request_id: "req-1".to_string(),
            },
        )?;
        assert_eq!(code, 0);
        Ok(())
    }

    #[test]
    fn group_rejects_non_object_matrix() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("matrix.json");
        fs::write(&path, "[1, 2, 3]")?;
        let result = run_group(
            ClientConfig::default(),
            GroupArgs {
                matrix: path,
                request_id: "req-1".to_string(),
            },
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn badges_only_show_present_structure() {
        let row = ResponseFeatures::for_response("gpt", "req-1", "Plain prose without structure.");
        let badges = feature_badges(&row);
        assert!(badges.starts_with("lang="));
        assert!(!badges.contains("code="));
        assert!(!badges.contains("links="));
    }
}
