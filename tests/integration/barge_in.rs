//! Interrupting the agent mid-response.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use parley::bus::handler_fn;
use parley::bus::events::BargeInEvent;
use parley::{ConversationState, EventKind};

use crate::helpers::{Session, session, test_config, wait_until};

const PATIENCE: Duration = Duration::from_secs(5);
const FIRST: &str = "First part is here.";

/// A session part-way through speaking a three-chunk answer.
async fn mid_response() -> Session {
    let mut config = test_config();
    config.tts.max_chunk_chars = 30;
    let s = session(config, Duration::from_millis(300));
    s.controller.start().await.unwrap();
    s.chat.reply_with(vec![
        "First part is here. ",
        "Second part is here. ",
        "Third part is here.",
    ]);
    s.recognizer.say("what is my balance");
    assert!(wait_until(PATIENCE, || s.synth.started().len() == 1).await);
    assert_eq!(s.controller.state(), ConversationState::Responding);
    s
}

#[tokio::test]
async fn speech_during_response_stops_playback() {
    let s = mid_response().await;

    s.recognizer.partial("wait stop please");

    assert!(
        wait_until(PATIENCE, || {
            s.controller
                .memory()
                .last_turn()
                .is_some_and(|t| t.interrupted)
        })
        .await
    );
    let turn = s.controller.memory().last_turn().unwrap();
    assert_eq!(turn.user_text, "what is my balance");
    assert_eq!(turn.agent_text, FIRST);
    assert!(s.synth.aborts() >= 1);
    assert!(!s.controller.speech_output().is_speaking());
    assert_eq!(s.controller.state(), ConversationState::Listening);
    assert!(!s.controller.response_in_flight());

    // Nothing further from the superseded answer.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(s.synth.started(), vec![FIRST]);
    assert!(s.synth.played().is_empty());
    s.controller.stop().await;
}

#[tokio::test]
async fn barge_in_event_carries_playback_position() {
    let s = mid_response().await;
    let seen: Arc<Mutex<Vec<BargeInEvent>>> = Arc::default();
    let sink = Arc::clone(&seen);
    s.controller.bus().subscribe(
        EventKind::BargeIn,
        handler_fn(move |event| {
            let sink = Arc::clone(&sink);
            async move {
                if let Some(barge_in) = event.as_barge_in() {
                    sink.lock().unwrap().push(barge_in.clone());
                }
                Ok(())
            }
        }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    s.recognizer.partial("hold on there");

    assert!(wait_until(PATIENCE, || !seen.lock().unwrap().is_empty()).await);
    let events = seen.lock().unwrap().clone();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].trigger, "speech_detected");
    assert_eq!(events[0].user_text, "hold on there");
    assert!(events[0].playback_position_ms >= 100);
    s.controller.stop().await;
}

#[tokio::test]
async fn fillers_do_not_interrupt() {
    let s = mid_response().await;

    s.recognizer.partial("um");
    s.recognizer.partial("uh hmm");

    assert!(wait_until(PATIENCE, || s.synth.played().len() == 3).await);
    assert_eq!(s.synth.aborts(), 0);
    assert_eq!(
        s.synth.played_text(),
        "First part is here. Second part is here. Third part is here."
    );
    s.controller.stop().await;
}

#[tokio::test]
async fn next_question_after_barge_in_is_answered() {
    let s = mid_response().await;
    s.recognizer.partial("no wait");
    assert!(
        wait_until(PATIENCE, || !s.controller.speech_output().is_speaking()).await
    );

    s.chat.reply_with(vec!["Roaming is included."]);
    s.recognizer.final_text("is roaming included in my plan");

    assert!(wait_until(PATIENCE, || s.controller.turn_count() == 2).await);
    let turn = s.controller.memory().last_turn().unwrap();
    assert_eq!(turn.user_text, "is roaming included in my plan");
    assert_eq!(turn.agent_text, "Roaming is included.");
    assert!(!turn.interrupted);
    assert_eq!(s.synth.played(), vec!["Roaming is included."]);
    s.controller.stop().await;
}

#[tokio::test]
async fn disabled_barge_in_lets_the_answer_finish() {
    let mut config = test_config();
    config.tts.max_chunk_chars = 30;
    config.barge_in.enabled = false;
    let s = session(config, Duration::from_millis(100));
    s.controller.start().await.unwrap();
    s.chat
        .reply_with(vec!["First part is here. ", "Second part is here."]);
    s.recognizer.say("what is my balance");
    assert!(wait_until(PATIENCE, || s.synth.started().len() == 1).await);

    s.recognizer.partial("stop talking now");

    assert!(wait_until(PATIENCE, || s.synth.played().len() == 2).await);
    assert_eq!(s.synth.aborts(), 0);
    s.controller.stop().await;
}
