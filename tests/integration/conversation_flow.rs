//! End-to-end turns through the whole pipeline over in-process fakes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley::bus::events::{IntentConfidence, IntentEvent, RetrievalEvent, TurnEvent, TurnState};
use parley::llm::{LlmError, Role};
use parley::pipeline::Backends;
use parley::retrieval::{Document, InMemoryVectorStore, RetrievalResult};
use parley::{AgentError, ConversationController, ConversationState, Event, EventPayload};

use crate::helpers::{
    BILLING_DOC, BagOfWordsEmbedder, ROAMING_DOC, RecordingSynthesizer, ScriptedChat,
    ScriptedReply, Session, session, started_session, test_config, wait_until,
};

const CHUNK: Duration = Duration::from_millis(20);
const PATIENCE: Duration = Duration::from_secs(5);

fn publish(s: &Session, payload: impl Into<EventPayload>) {
    assert!(s.controller.bus().publish(Event::new("test", payload.into())));
}

fn processing(transcript: &str) -> TurnEvent {
    TurnEvent {
        user_transcript: transcript.to_owned(),
        ..TurnEvent::new(TurnState::Processing, TurnState::UserSpeaking)
    }
}

fn confirmed_greeting(transcript: &str) -> IntentEvent {
    IntentEvent {
        intent: "greeting".into(),
        confidence: IntentConfidence::Confirmed,
        entities: HashMap::new(),
        keywords: vec!["hello".into(), "hi".into(), "hey".into()],
        requires_retrieval: false,
        suggested_response: "friendly".into(),
        transcript_text: transcript.to_owned(),
    }
}

#[tokio::test]
async fn billing_question_is_answered_with_retrieved_context() {
    let s = started_session(CHUNK).await;
    assert_eq!(s.controller.state(), ConversationState::Listening);
    s.chat.reply_with(vec!["Your balance ", "is on page one."]);

    s.recognizer.say("what is my balance");

    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 1).await);
    let turn = s.controller.memory().last_turn().unwrap();
    assert_eq!(turn.user_text, "what is my balance");
    assert_eq!(turn.agent_text, "Your balance is on page one.");
    assert_eq!(turn.intent, "billing");
    assert!(!turn.interrupted);
    assert_eq!(s.synth.played(), vec!["Your balance is on page one."]);

    let requests = s.chat.requests();
    assert_eq!(requests.len(), 1);
    let messages = &requests[0].messages;
    assert_eq!(messages[0].role, Role::System);
    let question = messages.last().unwrap();
    assert_eq!(question.role, Role::User);
    assert!(question.content.starts_with("Context:\n"));
    assert!(question.content.contains(BILLING_DOC));
    assert!(question.content.ends_with("Customer: \"what is my balance\""));
    assert!(s.embedder.calls() > 2, "query was embedded");

    assert!(
        wait_until(PATIENCE, || s.controller.state() == ConversationState::Listening).await
    );
    assert_eq!(s.controller.session_topics(), vec!["billing"]);
    s.controller.stop().await;
}

#[tokio::test]
async fn later_turns_carry_history() {
    let s = started_session(CHUNK).await;
    s.chat.reply_with(vec!["It is on page one."]);
    s.chat.reply_with(vec!["Yes, in forty countries."]);

    s.recognizer.say("where is my balance");
    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 1).await);
    assert!(
        wait_until(PATIENCE, || s.controller.state() == ConversationState::Listening).await
    );
    s.recognizer.say("do you have a roaming package");
    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 2).await);

    let requests = s.chat.requests();
    assert_eq!(requests.len(), 2);
    let messages = &requests[1].messages;
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[1].role, Role::User);
    assert_eq!(messages[1].content, "where is my balance");
    assert_eq!(messages[2].role, Role::Assistant);
    assert_eq!(messages[2].content, "It is on page one.");
    assert!(messages[3].content.contains("roaming package"));

    let topics = s.controller.session_topics();
    assert_eq!(topics, vec!["billing", "package_inquiry"]);
    s.controller.stop().await;
}

#[tokio::test]
async fn stats_reflect_the_session() {
    let s = started_session(CHUNK).await;
    s.chat.reply_with(vec!["One ", "two ", "three."]);
    s.recognizer.say("what is my balance");
    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 1).await);

    let stats = s.controller.stats();
    assert_eq!(stats.turn_count, 1);
    assert_eq!(stats.generation.generations, 1);
    assert_eq!(stats.generation.total_tokens, 3);
    assert!(stats.retrieval.lookups >= 1);
    assert!(stats.bus.dispatched > 0);
    assert_eq!(stats.bus.dropped, 0);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["turn_count"], 1);
    assert_eq!(json["session_topics"][0], "billing");
    s.controller.stop().await;
}

#[tokio::test]
async fn first_greeting_gets_the_canned_reply() {
    let s = started_session(CHUNK).await;

    s.recognizer.say("hello there");
    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 1).await);
    assert_eq!(s.synth.played(), vec!["Hello! How can I help you today?"]);
    assert!(s.chat.requests().is_empty());
    assert_eq!(s.controller.memory().last_turn().unwrap().intent, "greeting");

    // Already greeted: the second one goes to the model.
    assert!(
        wait_until(PATIENCE, || s.controller.state() == ConversationState::Listening).await
    );
    s.chat.reply_with(vec!["Hi again."]);
    s.recognizer.say("hello again");
    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 2).await);
    assert_eq!(s.chat.requests().len(), 1);
    assert_eq!(s.synth.played().last().unwrap(), "Hi again.");
    s.controller.stop().await;
}

#[tokio::test]
async fn greeting_with_a_question_is_answered() {
    let s = started_session(CHUNK).await;
    s.chat.reply_with(vec!["Hello! Your balance ", "is on page one."]);

    s.recognizer.say("hi what is my account balance");

    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 1).await);
    let requests = s.chat.requests();
    assert_eq!(requests.len(), 1);
    let question = &requests[0].messages.last().unwrap().content;
    assert!(question.ends_with("Customer: \"hi what is my account balance\""));
    assert_eq!(s.synth.played(), vec!["Hello! Your balance is on page one."]);

    // The hello was used up: a bare one now goes to the model too.
    assert!(
        wait_until(PATIENCE, || s.controller.state() == ConversationState::Listening).await
    );
    s.recognizer.say("hello");
    assert!(wait_until(PATIENCE, || s.chat.requests().len() == 2).await);
    s.controller.stop().await;
}

#[tokio::test]
async fn repeated_processing_signal_answers_once() {
    let s = started_session(CHUNK).await;
    s.chat.reply_with(vec!["Your balance is on page one."]);

    publish(&s, TurnEvent::new(TurnState::UserSpeaking, TurnState::Idle));
    publish(&s, processing("what is my balance"));
    publish(&s, processing("what is my balance"));

    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 1).await);
    assert!(
        wait_until(PATIENCE, || s.controller.state() == ConversationState::Listening).await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(s.chat.requests().len(), 1);
    assert_eq!(s.synth.played(), vec!["Your balance is on page one."]);
    assert_eq!(s.controller.turn_count(), 1);
    s.controller.stop().await;
}

#[tokio::test]
async fn canned_greeting_then_processing_answers_once() {
    let s = started_session(CHUNK).await;

    publish(&s, TurnEvent::new(TurnState::UserSpeaking, TurnState::Idle));
    publish(&s, confirmed_greeting("hello there"));
    publish(&s, processing("hello there"));

    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(s.chat.requests().is_empty());
    assert_eq!(s.synth.played(), vec!["Hello! How can I help you today?"]);
    s.controller.stop().await;
}

#[tokio::test]
async fn greeting_intent_with_a_request_leaves_the_turn_to_generation() {
    let s = started_session(CHUNK).await;
    s.chat.reply_with(vec!["It is on page one."]);

    publish(&s, TurnEvent::new(TurnState::UserSpeaking, TurnState::Idle));
    publish(&s, confirmed_greeting("hi, where is my balance"));
    publish(&s, processing("hi, where is my balance"));

    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(s.chat.requests().len(), 1);
    assert_eq!(s.synth.played(), vec!["It is on page one."]);
    s.controller.stop().await;
}

#[tokio::test]
async fn finished_answer_keeps_the_next_turns_context() {
    let mut config = test_config();
    config.tts.max_chunk_chars = 30;
    config.barge_in.enabled = false;
    let s = session(config, Duration::from_millis(300));
    s.controller.start().await.unwrap();
    s.chat
        .reply_with(vec!["First part is here. ", "Second part is here."]);
    s.recognizer.say("where is my balance");
    assert!(wait_until(PATIENCE, || s.synth.started().len() == 1).await);

    // The next turn opens and gets its context while the answer plays on.
    publish(&s, TurnEvent::new(TurnState::UserSpeaking, TurnState::Idle));
    let result = RetrievalResult {
        documents: vec![Document::new(ROAMING_DOC)],
        query: "roaming".into(),
        ..RetrievalResult::default()
    };
    publish(&s, RetrievalEvent { result, speculative: true });

    assert!(wait_until(PATIENCE, || s.synth.played().len() == 2).await);
    assert!(
        wait_until(PATIENCE, || s.controller.state() == ConversationState::Listening).await
    );
    let working = s.controller.memory().working().snapshot().await;
    assert!(working.retrieval_context.contains(ROAMING_DOC));
    s.controller.stop().await;
}

#[tokio::test]
async fn farewell_ends_the_session() {
    let s = started_session(CHUNK).await;

    s.recognizer.say("thanks, goodbye");
    let ended = tokio::time::timeout(PATIENCE, s.controller.wait_for_completion())
        .await
        .unwrap();

    assert_eq!(ended, ConversationState::Ending);
    assert_eq!(s.synth.played(), vec!["Goodbye! Have a great day!"]);
    assert!(s.chat.requests().is_empty());
    assert_eq!(s.controller.turn_count(), 1);
    s.controller.stop().await;
}

#[tokio::test]
async fn generation_failure_is_apologised_for() {
    let s = started_session(CHUNK).await;
    s.chat
        .push(ScriptedReply::Fail(LlmError::AuthError("bad key".into())));

    s.recognizer.say("my internet is not working");

    assert!(wait_until(PATIENCE, || !s.synth.played().is_empty()).await);
    assert_eq!(
        s.synth.played(),
        vec!["I'm sorry, I encountered an error. Could you please repeat that?"]
    );
    assert!(
        wait_until(PATIENCE, || s.controller.state() == ConversationState::Listening).await
    );
    assert_eq!(s.chat.requests().len(), 1, "auth failures are not retried");
    assert_eq!(s.controller.turn_count(), 0);
    s.controller.stop().await;
}

#[tokio::test]
async fn transient_failure_is_retried_once() {
    let s = started_session(CHUNK).await;
    s.chat
        .push(ScriptedReply::Fail(LlmError::ProviderError("HTTP 503".into())));
    s.chat.reply_with(vec!["Try restarting the router."]);

    s.recognizer.say("my internet is not working");

    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 1).await);
    assert_eq!(s.chat.requests().len(), 2);
    assert_eq!(s.synth.played(), vec!["Try restarting the router."]);
    s.controller.stop().await;
}

#[tokio::test]
async fn auto_greet_speaks_before_listening() {
    let mut config = test_config();
    config.controller.auto_greet = true;
    let s = session(config, CHUNK);

    s.controller.start().await.unwrap();

    assert_eq!(
        s.synth.played(),
        vec!["Hello! I'm your customer support assistant. How can I help you today?"]
    );
    assert_eq!(s.controller.state(), ConversationState::Listening);

    // The greeting counts: a spoken hello is no longer answered canned.
    s.recognizer.say("hello");
    assert!(wait_until(PATIENCE, || s.chat.requests().len() == 1).await);
    s.controller.stop().await;
}

#[tokio::test]
async fn silence_prompts_then_ends() {
    let mut config = test_config();
    config.controller.no_speech_timeout_s = 1;
    let s = session(config, CHUNK);
    s.controller.start().await.unwrap();

    let ended = tokio::time::timeout(PATIENCE, s.controller.wait_for_completion())
        .await
        .unwrap();

    assert_eq!(ended, ConversationState::Ending);
    assert_eq!(
        s.synth.played(),
        vec![
            "Are you still there? Let me know if you need any help.",
            "It seems you've stepped away. Goodbye!",
        ]
    );
    s.controller.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent_and_final() {
    let s = started_session(CHUNK).await;
    assert!(matches!(
        s.controller.start().await,
        Err(AgentError::Pipeline(_))
    ));

    s.controller.stop().await;
    s.controller.stop().await;

    assert_eq!(s.controller.state(), ConversationState::Ending);
    assert_eq!(
        s.controller.wait_for_completion().await,
        ConversationState::Ending
    );
    assert!(!s.controller.speech_input().is_running());
    assert!(s.controller.bus().is_stopped());
}

struct BrokenRecognizer;

impl parley::stt::SpeechRecognizer for BrokenRecognizer {
    fn start(
        &self,
        _settings: &parley::stt::RecognizerSettings,
        _sink: parley::stt::RecognizerSink,
    ) -> parley::Result<()> {
        Err(AgentError::Stt("no microphone".into()))
    }

    fn stop(&self) {}
}

#[tokio::test]
async fn recognizer_failure_enters_error_state() {
    let backends = Backends {
        recognizer: Arc::new(BrokenRecognizer),
        synthesizer: Arc::new(RecordingSynthesizer::new(CHUNK)),
        chat: Arc::new(ScriptedChat::default()),
        embedder: Arc::new(BagOfWordsEmbedder::default()),
        vectors: Arc::new(InMemoryVectorStore::new()),
    };
    let controller = ConversationController::new(test_config(), backends).unwrap();

    let result = controller.start().await;

    assert!(matches!(result, Err(AgentError::Stt(_))));
    assert_eq!(controller.state(), ConversationState::Error);
    assert_eq!(
        controller.wait_for_completion().await,
        ConversationState::Error
    );
    controller.stop().await;
}

#[tokio::test]
async fn missing_credentials_fail_construction() {
    let mut config = test_config();
    config.llm.api_key = None;
    let backends = Backends {
        recognizer: Arc::new(BrokenRecognizer),
        synthesizer: Arc::new(RecordingSynthesizer::new(CHUNK)),
        chat: Arc::new(ScriptedChat::default()),
        embedder: Arc::new(BagOfWordsEmbedder::default()),
        vectors: Arc::new(InMemoryVectorStore::new()),
    };

    let err = ConversationController::new(config, backends).unwrap_err();

    assert!(matches!(err, AgentError::Config(_)));
    assert!(err.to_string().contains("PARLEY_LLM_API_KEY"));
}

#[tokio::test]
async fn balance_scenario_with_single_document() {
    use parley::retrieval::EmbeddingProvider;

    use crate::helpers::ScriptedRecognizer;

    let embedder = Arc::new(BagOfWordsEmbedder::default());
    let store = InMemoryVectorStore::new();
    let doc = "Your current balance is $150.00";
    store.insert(Document::new(doc), embedder.embed(doc).unwrap());
    let recognizer = Arc::new(ScriptedRecognizer::default());
    let synth = Arc::new(RecordingSynthesizer::new(CHUNK));
    let chat = Arc::new(ScriptedChat::default());
    chat.reply_with(vec!["Your current balance ", "is $150.00."]);
    let backends = Backends {
        recognizer: Arc::clone(&recognizer) as _,
        synthesizer: Arc::clone(&synth) as _,
        chat: Arc::clone(&chat) as _,
        embedder,
        vectors: Arc::new(store),
    };
    let controller = ConversationController::new(test_config(), backends).unwrap();
    controller.start().await.unwrap();

    recognizer.final_text("What is my account balance?");

    assert!(wait_until(PATIENCE, || controller.turn_count() == 1).await);
    let turn = controller.memory().last_turn().unwrap();
    assert_eq!(turn.intent, "billing");
    assert!(turn.agent_text.contains("$150.00"));
    assert!(synth.played_text().contains("$150.00"));
    let requests = chat.requests();
    let prompt = &requests[0].messages.last().unwrap().content;
    assert!(prompt.contains("[1. Knowledge Base]\nYour current balance is $150.00"));
    controller.stop().await;
}
