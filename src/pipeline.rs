use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::cache::DocumentCache;
use crate::chat::ChatService;
use crate::concepts;
use crate::conversation::Conversation;
use crate::encyclopedia::SiteClient;
use crate::resolver::{self, Resolved, SelectionPolicy, Source};

const ANSWER_TEMPERATURE: f32 = 0.0;

/// Progress and result events of one query run, in emission order.
/// `Stopped` is always the last event, on every path; consumers may ignore
/// event kinds they do not recognize.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicEvent {
    SearchStarted { concepts: Vec<String> },
    ConceptResolved { concept: String },
    ConceptFailed { concept: String, error: String },
    /// Cumulative: carries the full answer-so-far, so a consumer can render
    /// by replacing prior state even when intermediate events are dropped.
    AnswerChunk { text: String },
    AnswerComplete { text: String, sources: Vec<Source> },
    GenerationFailed { error: String },
    Stopped,
}

/// What to do when no search concepts could be extracted from the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyConceptPolicy {
    /// Answer anyway, from an empty context (the answer carries no sources).
    #[default]
    AnswerUnsourced,
    /// Stop without answering.
    Abort,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub do_search: bool,
    pub selection: SelectionPolicy,
    pub on_empty_concepts: EmptyConceptPolicy,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            do_search: true,
            selection: SelectionPolicy::default(),
            on_empty_concepts: EmptyConceptPolicy::default(),
        }
    }
}

/// Answer one query, emitting [`LogicEvent`]s on `events` as the run
/// progresses. Concept resolutions run concurrently, but events and context
/// assembly always follow the original concept order, and any single
/// concept failure aborts the whole query. The caller owns the receiving
/// end; dropping it cancels the run.
pub async fn answer_query(
    chat: &impl ChatService,
    site: &SiteClient,
    cache: &impl DocumentCache,
    convo: &mut Conversation,
    query: &str,
    opts: &QueryOptions,
    events: mpsc::Sender<LogicEvent>,
) {
    run(chat, site, cache, convo, query, opts, &events).await;
    let _ = events.send(LogicEvent::Stopped).await;
}

async fn run(
    chat: &impl ChatService,
    site: &SiteClient,
    cache: &impl DocumentCache,
    convo: &mut Conversation,
    query: &str,
    opts: &QueryOptions,
    events: &mpsc::Sender<LogicEvent>,
) {
    if !opts.do_search {
        // Non-search turn: prior turns are the only context.
        if let Some(answer) = stream_answer(chat, convo, query.to_string(), events).await {
            convo.add_assistant(answer);
        }
        return;
    }

    let concepts = match concepts::extract_concepts(chat, query).await {
        Ok(concepts) => concepts,
        Err(e) => {
            warn!(error = %e, "concept extraction failed");
            let _ = events
                .send(LogicEvent::GenerationFailed {
                    error: e.to_string(),
                })
                .await;
            return;
        }
    };

    if events
        .send(LogicEvent::SearchStarted {
            concepts: concepts.clone(),
        })
        .await
        .is_err()
    {
        return;
    }

    if concepts.is_empty() && opts.on_empty_concepts == EmptyConceptPolicy::Abort {
        info!("no search concepts extracted, stopping without an answer");
        return;
    }

    // All resolutions are launched together and joined; a failing sibling
    // neither cancels the others nor stops them from populating the cache.
    let resolutions = join_all(
        concepts
            .iter()
            .map(|concept| resolver::resolve_concept(site, cache, opts.selection, concept)),
    )
    .await;

    let mut context = String::new();
    let mut sources: Vec<Source> = Vec::new();
    for (concept, outcome) in concepts.iter().zip(resolutions) {
        match outcome {
            Ok(Resolved {
                text,
                sources: concept_sources,
            }) => {
                context.push_str(&text);
                sources.extend(concept_sources);
                if events
                    .send(LogicEvent::ConceptResolved {
                        concept: concept.clone(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                warn!(concept, error = %e, "concept resolution failed, aborting query");
                let _ = events
                    .send(LogicEvent::ConceptFailed {
                        concept: concept.clone(),
                        error: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }

    let prompt = format!("<context>{context}</context>\n\n<query>{query}</query>");
    let Some(answer) = stream_answer(chat, convo, prompt, events).await else {
        return;
    };
    convo.add_assistant(answer.clone());

    if !sources.is_empty() {
        let _ = events
            .send(LogicEvent::AnswerComplete {
                text: answer,
                sources,
            })
            .await;
    }
}

/// Append the user turn and stream the model's answer, emitting cumulative
/// chunks. Returns the final answer, or `None` on a generation fault or a
/// gone consumer; already-emitted chunks are left standing either way.
async fn stream_answer(
    chat: &impl ChatService,
    convo: &mut Conversation,
    user_turn: String,
    events: &mpsc::Sender<LogicEvent>,
) -> Option<String> {
    convo.add_user(user_turn);

    let mut chunks = match chat.stream(convo.messages(), ANSWER_TEMPERATURE).await {
        Ok(chunks) => chunks,
        Err(e) => {
            warn!(error = %e, "answer stream could not be started");
            let _ = events
                .send(LogicEvent::GenerationFailed {
                    error: e.to_string(),
                })
                .await;
            return None;
        }
    };

    let mut answer = String::new();
    while let Some(item) = chunks.recv().await {
        match item {
            Ok(delta) => {
                answer.push_str(&delta);
                if events
                    .send(LogicEvent::AnswerChunk {
                        text: answer.clone(),
                    })
                    .await
                    .is_err()
                {
                    return None;
                }
            }
            Err(e) => {
                warn!(error = %e, "answer stream interrupted");
                let _ = events
                    .send(LogicEvent::GenerationFailed {
                        error: e.to_string(),
                    })
                    .await;
                return None;
            }
        }
    }

    Some(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::chat::ChatError;
    use crate::chat::types::{ChatMessage, Role};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Scripted chat backend: completions and streams are consumed in call
    /// order.
    struct MockChat {
        completions: Mutex<VecDeque<Result<String, ChatError>>>,
        streams: Mutex<VecDeque<Result<Vec<Result<String, ChatError>>, ChatError>>>,
    }

    impl MockChat {
        fn new() -> Self {
            Self {
                completions: Mutex::new(VecDeque::new()),
                streams: Mutex::new(VecDeque::new()),
            }
        }

        fn extracting(self, terms: &[&str]) -> Self {
            let reply = format!(
                "reasoning</analysis>\n<search_terms>{}</search_terms>",
                terms.join("\n")
            );
            self.completions.lock().unwrap().push_back(Ok(reply));
            self
        }

        fn extraction_fails(self, error: ChatError) -> Self {
            self.completions.lock().unwrap().push_back(Err(error));
            self
        }

        fn answering(self, deltas: &[&str]) -> Self {
            let chunks = deltas.iter().map(|d| Ok(d.to_string())).collect();
            self.streams.lock().unwrap().push_back(Ok(chunks));
            self
        }

        fn answer_interrupted(self, deltas: &[&str], error: ChatError) -> Self {
            let mut chunks: Vec<Result<String, ChatError>> =
                deltas.iter().map(|d| Ok(d.to_string())).collect();
            chunks.push(Err(error));
            self.streams.lock().unwrap().push_back(Ok(chunks));
            self
        }
    }

    impl ChatService for MockChat {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
        ) -> Result<String, ChatError> {
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ChatError::EmptyCompletion))
        }

        async fn stream(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
        ) -> Result<mpsc::Receiver<Result<String, ChatError>>, ChatError> {
            let script = self
                .streams
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Vec::new()))?;
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                for item in script {
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn search_html(entries: &[(&str, &str)]) -> String {
        let mut body = String::from("<html><body>");
        for (title, href) in entries {
            body.push_str(&format!(
                r#"<a class="search-result" href="{href}">
                    <h4 class="search-result-title">{title}</h4>
                    <div class="search-result-body">snippet</div>
                </a>"#
            ));
        }
        body.push_str("</body></html>");
        body
    }

    fn article_html(text: &str) -> String {
        format!(
            r#"<html><body><div id="content">
                <div class="body user-generated-content"><p>{text}</p></div>
            </div></body></html>"#
        )
    }

    async fn mount_concept(server: &MockServer, concept: &str, delay_ms: u64) {
        let href = format!("/articles/{}", concept.replace(' ', "-"));
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", concept))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(search_html(&[(concept, &href)])),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(&*href))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(article_html(&format!("{concept} article body.")))
                    .set_delay(Duration::from_millis(delay_ms)),
            )
            .mount(server)
            .await;
    }

    async fn collect_events(
        chat: &MockChat,
        site: &SiteClient,
        cache: &MemoryCache,
        convo: &mut Conversation,
        query: &str,
        opts: &QueryOptions,
    ) -> Vec<LogicEvent> {
        let (tx, mut rx) = mpsc::channel(256);
        answer_query(chat, site, cache, convo, query, opts, tx).await;

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn site_for(server: &MockServer) -> SiteClient {
        SiteClient::new(reqwest::Client::new(), &server.uri()).unwrap()
    }

    fn offline_site() -> SiteClient {
        SiteClient::new(reqwest::Client::new(), "http://127.0.0.1:9").unwrap()
    }

    #[tokio::test]
    async fn end_to_end_single_concept_run() {
        let server = MockServer::start().await;
        mount_concept(&server, "pneumonitis", 0).await;

        let chat = MockChat::new()
            .extracting(&["pneumonitis"])
            .answering(&["Pneumonitis is ", "lung inflammation."]);
        let site = site_for(&server);
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();

        let events = collect_events(
            &chat,
            &site,
            &cache,
            &mut convo,
            "What is pneumonitis?",
            &QueryOptions::default(),
        )
        .await;

        assert_eq!(
            events[0],
            LogicEvent::SearchStarted {
                concepts: vec!["pneumonitis".to_string()]
            }
        );
        assert_eq!(
            events[1],
            LogicEvent::ConceptResolved {
                concept: "pneumonitis".to_string()
            }
        );
        assert_eq!(
            events[2],
            LogicEvent::AnswerChunk {
                text: "Pneumonitis is ".to_string()
            }
        );
        assert_eq!(
            events[3],
            LogicEvent::AnswerChunk {
                text: "Pneumonitis is lung inflammation.".to_string()
            }
        );
        match &events[4] {
            LogicEvent::AnswerComplete { text, sources } => {
                assert_eq!(text, "Pneumonitis is lung inflammation.");
                assert_eq!(sources.len(), 1);
                assert_eq!(sources[0].title, "pneumonitis");
                assert_eq!(
                    sources[0].url,
                    format!("{}/articles/pneumonitis", server.uri())
                );
            }
            other => panic!("expected AnswerComplete, got: {other:?}"),
        }
        assert_eq!(events[5], LogicEvent::Stopped);
        assert_eq!(events.len(), 6);
    }

    #[tokio::test]
    async fn concept_events_follow_extraction_order_not_completion_order() {
        let server = MockServer::start().await;
        mount_concept(&server, "alpha", 0).await;
        mount_concept(&server, "beta", 300).await;
        mount_concept(&server, "gamma", 0).await;

        let chat = MockChat::new()
            .extracting(&["alpha", "beta", "gamma"])
            .answering(&["done"]);
        let site = site_for(&server);
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();

        let events = collect_events(
            &chat,
            &site,
            &cache,
            &mut convo,
            "compare things",
            &QueryOptions::default(),
        )
        .await;

        let resolved: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                LogicEvent::ConceptResolved { concept } => Some(concept.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(resolved, vec!["alpha", "beta", "gamma"]);
    }

    #[tokio::test]
    async fn failing_concept_aborts_before_any_answer() {
        let server = MockServer::start().await;
        mount_concept(&server, "alpha", 0).await;
        // beta: search succeeds but has no hits
        Mock::given(method("GET"))
            .and(path("/search"))
            .and(query_param("q", "beta"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html><body>nothing</body></html>"),
            )
            .mount(&server)
            .await;
        mount_concept(&server, "gamma", 0).await;

        let chat = MockChat::new()
            .extracting(&["alpha", "beta", "gamma"])
            .answering(&["should never stream"]);
        let site = site_for(&server);
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();

        let events = collect_events(
            &chat,
            &site,
            &cache,
            &mut convo,
            "compare things",
            &QueryOptions::default(),
        )
        .await;

        assert_eq!(events.len(), 4);
        assert!(matches!(&events[0], LogicEvent::SearchStarted { .. }));
        assert_eq!(
            events[1],
            LogicEvent::ConceptResolved {
                concept: "alpha".to_string()
            }
        );
        match &events[2] {
            LogicEvent::ConceptFailed { concept, error } => {
                assert_eq!(concept, "beta");
                assert!(error.contains("no results"));
            }
            other => panic!("expected ConceptFailed, got: {other:?}"),
        }
        assert_eq!(events[3], LogicEvent::Stopped);

        // the aborted query leaves no answer turn behind
        assert!(!convo.messages().iter().any(|m| m.role == Role::Assistant));
    }

    #[tokio::test]
    async fn no_search_turn_streams_from_history_only() {
        let chat = MockChat::new().answering(&["From ", "memory."]);
        let site = offline_site();
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();
        convo.add_user("earlier question");
        convo.add_assistant("earlier answer");

        let opts = QueryOptions {
            do_search: false,
            ..QueryOptions::default()
        };
        let events = collect_events(&chat, &site, &cache, &mut convo, "and then?", &opts).await;

        assert_eq!(
            events,
            vec![
                LogicEvent::AnswerChunk {
                    text: "From ".to_string()
                },
                LogicEvent::AnswerChunk {
                    text: "From memory.".to_string()
                },
                LogicEvent::Stopped,
            ]
        );
        let last = convo.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "From memory.");
    }

    #[tokio::test]
    async fn zero_concepts_answer_unsourced_by_default() {
        let chat = MockChat::new()
            .extracting(&[])
            .answering(&["I don't know"]);
        let site = offline_site();
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();

        let events = collect_events(
            &chat,
            &site,
            &cache,
            &mut convo,
            "what's the weather",
            &QueryOptions::default(),
        )
        .await;

        assert_eq!(
            events,
            vec![
                LogicEvent::SearchStarted { concepts: vec![] },
                LogicEvent::AnswerChunk {
                    text: "I don't know".to_string()
                },
                LogicEvent::Stopped,
            ]
        );
        // the prompt still carries the context/query framing, just empty
        let user_turn = &convo.messages()[1];
        assert!(user_turn.content.starts_with("<context>"));
        assert!(user_turn.content.contains("<query>what's the weather</query>"));
    }

    #[tokio::test]
    async fn zero_concepts_abort_policy_stops_without_answer() {
        let chat = MockChat::new().extracting(&[]);
        let site = offline_site();
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();

        let opts = QueryOptions {
            on_empty_concepts: EmptyConceptPolicy::Abort,
            ..QueryOptions::default()
        };
        let events =
            collect_events(&chat, &site, &cache, &mut convo, "what's the weather", &opts).await;

        assert_eq!(
            events,
            vec![
                LogicEvent::SearchStarted { concepts: vec![] },
                LogicEvent::Stopped,
            ]
        );
        assert_eq!(convo.messages().len(), 1);
    }

    #[tokio::test]
    async fn extraction_call_failure_emits_generation_failed() {
        let chat = MockChat::new().extraction_fails(ChatError::RateLimited);
        let site = offline_site();
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();

        let events = collect_events(
            &chat,
            &site,
            &cache,
            &mut convo,
            "anything",
            &QueryOptions::default(),
        )
        .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], LogicEvent::GenerationFailed { .. }));
        assert_eq!(events[1], LogicEvent::Stopped);
    }

    #[tokio::test]
    async fn interrupted_stream_leaves_partial_chunks_standing() {
        let server = MockServer::start().await;
        mount_concept(&server, "pneumonitis", 0).await;

        let chat = MockChat::new()
            .extracting(&["pneumonitis"])
            .answer_interrupted(&["partial "], ChatError::Stream("connection reset".into()));
        let site = site_for(&server);
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();

        let events = collect_events(
            &chat,
            &site,
            &cache,
            &mut convo,
            "What is pneumonitis?",
            &QueryOptions::default(),
        )
        .await;

        assert_eq!(
            events[2],
            LogicEvent::AnswerChunk {
                text: "partial ".to_string()
            }
        );
        match &events[3] {
            LogicEvent::GenerationFailed { error } => {
                assert!(error.contains("connection reset"));
            }
            other => panic!("expected GenerationFailed, got: {other:?}"),
        }
        assert_eq!(events[4], LogicEvent::Stopped);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, LogicEvent::AnswerComplete { .. }))
        );
        // no assistant turn is recorded for an interrupted answer
        assert!(!convo.messages().iter().any(|m| m.role == Role::Assistant));
    }

    #[tokio::test]
    async fn multi_concept_context_and_sources_follow_concept_order() {
        let server = MockServer::start().await;
        mount_concept(&server, "CNS lymphoma", 200).await;
        mount_concept(&server, "glioblastoma", 0).await;

        let chat = MockChat::new()
            .extracting(&["CNS lymphoma", "glioblastoma"])
            .answering(&["comparison answer"]);
        let site = site_for(&server);
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();

        let events = collect_events(
            &chat,
            &site,
            &cache,
            &mut convo,
            "How to differentiate primary CNS lymphoma from glioblastoma on MRI?",
            &QueryOptions::default(),
        )
        .await;

        let sources = events
            .iter()
            .find_map(|e| match e {
                LogicEvent::AnswerComplete { sources, .. } => Some(sources.clone()),
                _ => None,
            })
            .expect("expected an AnswerComplete event");
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].title, "CNS lymphoma");
        assert_eq!(sources[1].title, "glioblastoma");

        // context documents appear in concept order despite completion order
        let user_turn = &convo.messages()[1].content;
        let first = user_turn.find("CNS lymphoma article body.").unwrap();
        let second = user_turn.find("glioblastoma article body.").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn follow_up_turn_reuses_session_history() {
        let server = MockServer::start().await;
        mount_concept(&server, "pneumonitis", 0).await;

        let chat = MockChat::new()
            .extracting(&["pneumonitis"])
            .answering(&["First answer."])
            .answering(&["Follow-up answer."]);
        let site = site_for(&server);
        let cache = MemoryCache::new();
        let mut convo = Conversation::new();

        collect_events(
            &chat,
            &site,
            &cache,
            &mut convo,
            "What is pneumonitis?",
            &QueryOptions::default(),
        )
        .await;

        let opts = QueryOptions {
            do_search: false,
            ..QueryOptions::default()
        };
        collect_events(&chat, &site, &cache, &mut convo, "Is it serious?", &opts).await;

        // system persona + 2 user turns + 2 assistant turns, in order
        let roles: Vec<Role> = convo.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant
            ]
        );
        assert_eq!(convo.messages()[4].content, "Follow-up answer.");
    }
}
