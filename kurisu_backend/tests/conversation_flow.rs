use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kurisu_backend::adapters::replies_for;
use kurisu_backend::config::KurisuConfig;
use kurisu_backend::conversation::{PersonaTemplate, MODEL_NOT_LOADED_REPLY};
use kurisu_backend::error::ModelError;
use kurisu_backend::message::{Envelope, Sender};
use kurisu_backend::model::{Generation, ModelPort, Turn, Usage};
use kurisu_backend::runtime::AssistantRuntimeBuilder;

struct EchoModel {
    loadable: bool,
    prompts: Mutex<Vec<Vec<Turn>>>,
}

impl EchoModel {
    fn new(loadable: bool) -> Arc<Self> {
        Arc::new(Self {
            loadable,
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ModelPort for EchoModel {
    async fn load(&self) -> bool {
        self.loadable
    }

    async fn generate(&self, turns: &[Turn]) -> Result<Generation, ModelError> {
        self.prompts.lock().unwrap().push(turns.to_vec());
        let last = turns.last().map(|t| t.content.clone()).unwrap_or_default();
        Ok(Generation {
            content: format!("echo: {}", last),
            finish_reason: Some("stop".to_string()),
            usage: Usage::default(),
            elapsed: Duration::from_millis(1),
        })
    }

    fn format_prompt(&self, turns: &[Turn]) -> String {
        turns
            .iter()
            .map(|t| t.content.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn count_tokens(&self, text: &str) -> Result<usize, ModelError> {
        Ok(text.split_whitespace().count())
    }

    async fn close(&self) {}
}

fn config() -> KurisuConfig {
    let mut config = KurisuConfig::default();
    config.poll_interval_ms = 5;
    config.token_limit = 1000;
    config.use_memories = false;
    config
}

fn persona() -> PersonaTemplate {
    PersonaTemplate::from_source("You are Assistant.", "User", "Assistant").unwrap()
}

fn from_adapter(origin: &str, text: &str) -> Envelope {
    Envelope::text(
        origin,
        Sender {
            id: "chat-1".to_string(),
            name: "User".to_string(),
        },
        text,
    )
}

fn collect_replies(origin: &str) -> (kurisu_backend::bus::Handler, flume::Receiver<Envelope>) {
    let (tx, rx) = flume::unbounded();
    let listener = replies_for(origin.to_string(), move |envelope: Envelope| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(envelope);
            anyhow::Ok(())
        }
    });
    (listener, rx)
}

#[tokio::test]
async fn adapter_to_controller_and_back() {
    let model = EchoModel::new(true);
    let runtime = AssistantRuntimeBuilder::new(config())
        .with_model(model.clone())
        .with_persona(persona())
        .build()
        .unwrap();

    let (mine, mine_rx) = collect_replies("adapter-a");
    let (theirs, theirs_rx) = collect_replies("adapter-b");
    runtime.bus.subscribe("back_response", mine);
    runtime.bus.subscribe("back_response", theirs);
    runtime.start().await.unwrap();

    for text in ["first", "second", "third"] {
        assert!(runtime.bus.publish("input", from_adapter("adapter-a", text)));
    }

    let mut replies = Vec::new();
    for _ in 0..3 {
        let reply = tokio::time::timeout(Duration::from_secs(5), mine_rx.recv_async())
            .await
            .expect("reply in time")
            .unwrap();
        replies.push(reply.response().unwrap().to_string());
    }
    replies.sort();
    assert_eq!(replies, vec!["echo: first", "echo: second", "echo: third"]);
    assert!(theirs_rx.try_recv().is_err());

    // Retention is off: every prompt is persona + the single user turn.
    for prompt in model.prompts.lock().unwrap().iter() {
        assert_eq!(prompt.len(), 2);
        assert_eq!(prompt[0], Turn::system("You are Assistant."));
    }
    assert_eq!(
        runtime.controller.history().await,
        vec![Turn::system("You are Assistant.")]
    );

    runtime.shutdown().await;
    assert!(!runtime.bus.is_running());
}

#[tokio::test]
async fn unloaded_model_answers_with_notice() {
    let model = EchoModel::new(false);
    let runtime = AssistantRuntimeBuilder::new(config())
        .with_model(model.clone())
        .with_persona(persona())
        .build()
        .unwrap();

    let (mine, mine_rx) = collect_replies("adapter-a");
    runtime.bus.subscribe("back_response", mine);
    runtime.start().await.unwrap();

    assert!(runtime.bus.publish("input", from_adapter("adapter-a", "hello?")));
    let reply = tokio::time::timeout(Duration::from_secs(5), mine_rx.recv_async())
        .await
        .expect("reply in time")
        .unwrap();
    assert_eq!(reply.response(), Some(MODEL_NOT_LOADED_REPLY));
    assert!(model.prompts.lock().unwrap().is_empty());

    runtime.shutdown().await;
}
