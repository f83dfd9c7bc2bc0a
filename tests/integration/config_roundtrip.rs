//! Config files driving component behaviour.

use parley::EventBus;
use parley::bus::events::IntentConfidence;
use parley::config::AgentConfig;
use parley::intent::IntentClassifier;

const STORE_CONFIG: &str = r#"
[controller]
auto_greet = false
no_speech_timeout_s = 0

[barge_in]
min_words = 3

[[intent.patterns]]
name = "store_hours"
keywords = ["open", "hours", "closing time"]
patterns = ['when do you (open|close)']
response_style = "informational"
requires_retrieval = false
priority = 7
"#;

fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

#[test]
fn custom_patterns_replace_the_defaults() {
    let (_dir, path) = write_config(STORE_CONFIG);
    let config = AgentConfig::from_file(&path).unwrap();

    assert_eq!(config.intent.patterns.len(), 1);
    assert_eq!(config.barge_in.min_words, 3);
    assert!(!config.controller.auto_greet);
    // Untouched sections keep their defaults.
    assert_eq!(config.retrieval.top_k, 3);

    let classifier = IntentClassifier::new(EventBus::default(), &config.intent).unwrap();
    let intent = classifier
        .detect("What is your closing time?", IntentConfidence::Confirmed)
        .unwrap();
    assert_eq!(intent.intent, "store_hours");
    assert!(!intent.requires_retrieval);
    assert!(
        classifier
            .detect("goodbye", IntentConfidence::Confirmed)
            .is_none()
    );
}

#[test]
fn saved_config_loads_back_identically() {
    let (_dir, path) = write_config(STORE_CONFIG);
    let config = AgentConfig::from_file(&path).unwrap();
    let copy = path.with_file_name("copy.toml");

    config.save_to_file(&copy).unwrap();
    let reloaded = AgentConfig::from_file(&copy).unwrap();

    assert_eq!(reloaded.intent.patterns, config.intent.patterns);
    assert_eq!(reloaded.barge_in.min_words, 3);
    assert_eq!(
        reloaded.controller.system_prompt,
        config.controller.system_prompt
    );
}

#[test]
fn broken_pattern_is_rejected_at_construction() {
    let (_dir, path) = write_config(
        r#"
[[intent.patterns]]
name = "broken"
patterns = ["(unclosed"]
"#,
    );
    let config = AgentConfig::from_file(&path).unwrap();

    let err = IntentClassifier::new(EventBus::default(), &config.intent).unwrap_err();
    assert!(err.to_string().contains("broken"));
}
