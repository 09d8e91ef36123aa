mod cache;
mod chat;
mod concepts;
mod conversation;
mod encyclopedia;
mod pipeline;
mod resolver;

pub const USER_AGENT: &str = concat!("radiq/", env!("CARGO_PKG_VERSION"));

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::info;

use cache::SqliteCache;
use chat::ChatClient;
use conversation::Conversation;
use encyclopedia::SiteClient;
use pipeline::{EmptyConceptPolicy, LogicEvent, QueryOptions};
use resolver::SelectionPolicy;

#[derive(Parser)]
#[command(
    name = "radiq",
    version,
    about = "Grounded radiology Q&A from the command line"
)]
struct Args {
    /// Question to answer
    question: String,

    /// Answer from conversation history only, without article retrieval
    #[arg(long)]
    no_search: bool,

    /// Keep the session open and read follow-up questions from stdin
    #[arg(short, long)]
    interactive: bool,

    /// Merge the top two search results per concept instead of taking the first
    #[arg(long)]
    broad: bool,

    /// Stop without answering when no search concepts are found in the question
    #[arg(long)]
    strict: bool,

    /// Cache database path
    #[arg(long, default_value = "radiq-cache.db")]
    db: PathBuf,

    /// Keep the cache in memory for this session only
    #[arg(long, conflicts_with = "db")]
    ephemeral: bool,

    /// Encyclopedia base URL
    #[arg(long, default_value = encyclopedia::DEFAULT_SITE_BASE)]
    site_base: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("radiq=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let http = Client::new();
    let chat = ChatClient::from_env(http.clone())?;
    let site = SiteClient::new(http, &args.site_base)?;
    let cache = if args.ephemeral {
        SqliteCache::in_memory().await?
    } else {
        SqliteCache::open(&args.db).await?
    };
    info!(model = chat.model(), site = %args.site_base, "session started");

    let mut convo = Conversation::new();
    let base_opts = QueryOptions {
        do_search: true,
        selection: if args.broad {
            SelectionPolicy::TopTwo
        } else {
            SelectionPolicy::FirstResult
        },
        on_empty_concepts: if args.strict {
            EmptyConceptPolicy::Abort
        } else {
            EmptyConceptPolicy::AnswerUnsourced
        },
    };

    let opts = QueryOptions {
        do_search: !args.no_search,
        ..base_opts
    };
    ask(&chat, &site, &cache, &mut convo, &args.question, &opts).await;

    if args.interactive {
        eprintln!("follow-up questions are answered with a fresh search;");
        eprintln!("prefix with '/f ' to answer from the conversation only. Ctrl-D quits.");
        let stdin = std::io::stdin();
        let mut line = String::new();
        loop {
            eprint!("> ");
            line.clear();
            if stdin.read_line(&mut line)? == 0 {
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (question, do_search) = match trimmed.strip_prefix("/f ") {
                Some(rest) => (rest, false),
                None => (trimmed, true),
            };
            let opts = QueryOptions {
                do_search,
                ..base_opts
            };
            ask(&chat, &site, &cache, &mut convo, question, &opts).await;
        }
    }

    Ok(())
}

/// Drive one query and render its events: progress to stderr, the streamed
/// answer to stdout, citations at the end. Completed exchanges go to the
/// query log.
async fn ask(
    chat: &ChatClient,
    site: &SiteClient,
    cache: &SqliteCache,
    convo: &mut Conversation,
    question: &str,
    opts: &QueryOptions,
) {
    let (tx, mut rx) = mpsc::channel(64);
    let run = pipeline::answer_query(chat, site, cache, convo, question, opts, tx);

    let render = async move {
        let mut printed = 0usize;
        let mut answer = None;
        while let Some(event) = rx.recv().await {
            match event {
                LogicEvent::SearchStarted { concepts } => {
                    if concepts.is_empty() {
                        eprintln!("no search concepts found");
                    } else {
                        eprintln!("searching: {}", concepts.join(", "));
                    }
                }
                LogicEvent::ConceptResolved { concept } => {
                    eprintln!("found article for '{concept}'");
                }
                LogicEvent::ConceptFailed { concept, error } => {
                    eprintln!("giving up on this question: '{concept}' failed ({error})");
                }
                LogicEvent::AnswerChunk { text } => {
                    // chunks are cumulative: print only the unseen tail
                    print!("{}", &text[printed..]);
                    printed = text.len();
                    answer = Some(text);
                    let _ = std::io::stdout().flush();
                }
                LogicEvent::AnswerComplete { sources, .. } => {
                    println!("\n\nSources:");
                    for source in sources {
                        println!("- {} <{}>", source.title, source.url);
                    }
                    printed = 0;
                }
                LogicEvent::GenerationFailed { error } => {
                    eprintln!("answer generation failed: {error}");
                    answer = None;
                }
                LogicEvent::Stopped => {}
            }
        }
        if printed > 0 {
            println!();
        }
        answer
    };

    let ((), answer) = tokio::join!(run, render);
    if let Some(answer) = answer {
        if let Err(e) = cache.record_exchange(question, &answer).await {
            tracing::warn!(error = %e, "could not record exchange in the query log");
        }
    }
}
