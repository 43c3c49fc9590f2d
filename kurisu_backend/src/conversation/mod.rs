//! Conversation controller.
//!
//! Owns the persona-pinned history, keeps it inside the token budget, and turns
//! each inbound envelope into at most one outbound one. All history mutation
//! happens under a single async mutex held for the whole exchange, so bus
//! listeners that overlap are served one after another.

pub mod persona;

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::bus::{handler, Handler, MessageBus};
use crate::config::KurisuConfig;
use crate::error::ModelError;
use crate::memory::{MemoryChain, MemoryRecord, MemoryStore};
use crate::message::Envelope;
use crate::model::{GenerationPool, ModelPort, Role, Turn};

pub use persona::PersonaTemplate;

/// Reply published while no model is loaded.
pub const MODEL_NOT_LOADED_REPLY: &str = "model not loaded";

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub token_limit: usize,
    pub inbound_topic: String,
    pub outbound_topic: String,
    /// Keep history between exchanges.
    pub use_memories: bool,
    pub save_memories: bool,
    pub add_context: bool,
    pub chat_memory_limit: usize,
    pub user_name: String,
    pub assistant_name: String,
    pub generation_workers: usize,
}

impl ControllerSettings {
    pub fn from_config(config: &KurisuConfig) -> Self {
        Self {
            token_limit: config.token_limit,
            inbound_topic: config.inbound_topic.clone(),
            outbound_topic: config.outbound_topic.clone(),
            use_memories: config.use_memories,
            save_memories: config.save_memories,
            add_context: config.add_context,
            chat_memory_limit: config.chat_memory_limit,
            user_name: config.user_name.clone(),
            assistant_name: config.assistant_name.clone(),
            generation_workers: config.generation_workers,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&KurisuConfig::default())
    }
}

struct ConversationState {
    history: Vec<Turn>,
    loaded: bool,
}

pub struct ConversationController {
    model: Arc<dyn ModelPort>,
    memory: Option<Arc<dyn MemoryStore>>,
    pool: GenerationPool,
    bus: MessageBus,
    settings: ControllerSettings,
    template: PersonaTemplate,
    base_persona: String,
    state: AsyncMutex<ConversationState>,
    subscription: Mutex<Option<Handler>>,
}

impl ConversationController {
    pub fn new(
        model: Arc<dyn ModelPort>,
        memory: Option<Arc<dyn MemoryStore>>,
        bus: MessageBus,
        template: PersonaTemplate,
        settings: ControllerSettings,
    ) -> Result<Self> {
        let base_persona = match template.render("") {
            Ok(persona) => persona,
            Err(e) => {
                tracing::error!("Persona template failed to render, using it as written: {}", e);
                template.source().trim().to_string()
            }
        };
        let pool = GenerationPool::spawn(model.clone(), settings.generation_workers)?;
        tracing::debug!("Base persona installed ({} chars)", base_persona.len());

        Ok(Self {
            model,
            memory,
            pool,
            bus,
            state: AsyncMutex::new(ConversationState {
                history: vec![Turn::system(base_persona.clone())],
                loaded: false,
            }),
            settings,
            template,
            base_persona,
            subscription: Mutex::new(None),
        })
    }

    /// Subscribe to the inbound topic. The bus only holds a weak reference.
    pub fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let listener = handler(move |envelope: Envelope| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(controller) => controller.process_message(envelope).await.map(|_| ()),
                    None => Ok(()),
                }
            }
        });

        self.bus
            .subscribe(&self.settings.inbound_topic, listener.clone());
        if let Ok(mut subscription) = self.subscription.lock() {
            if let Some(previous) = subscription.replace(listener) {
                self.bus.unsubscribe(&self.settings.inbound_topic, &previous);
            }
        }
    }

    pub fn detach(&self) {
        let previous = match self.subscription.lock() {
            Ok(mut subscription) => subscription.take(),
            Err(_) => None,
        };
        if let Some(listener) = previous {
            self.bus.unsubscribe(&self.settings.inbound_topic, &listener);
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn base_persona(&self) -> &str {
        &self.base_persona
    }

    pub async fn history(&self) -> Vec<Turn> {
        self.state.lock().await.history.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.lock().await.loaded
    }

    /// Load the model; on the first successful load with history retention on,
    /// restore recent chat memory after the persona.
    pub async fn load_model(&self) -> bool {
        let loaded = self.model.load().await;
        let mut state = self.state.lock().await;
        let was_loaded = state.loaded;
        state.loaded = loaded;

        if !loaded {
            tracing::error!("Model failed to load; replies will be '{}'", MODEL_NOT_LOADED_REPLY);
            return false;
        }
        if !was_loaded {
            tracing::info!("Model loaded");
            if self.settings.use_memories && state.history.len() == 1 {
                self.restore_history(&mut state.history).await;
            }
        }
        true
    }

    /// Release the model. A later `load_model` is allowed.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.loaded {
            self.model.close().await;
            state.loaded = false;
            tracing::info!("Model closed");
        } else {
            tracing::warn!("No loaded model to close");
        }
    }

    /// Close the model and join the generation workers.
    pub async fn shutdown(&self) {
        self.detach();
        self.close().await;
        self.pool.shutdown();
    }

    /// Evict the oldest non-persona turns until the prompt fits the budget.
    /// Returns the final token count, if it could be measured.
    pub async fn forget(&self) -> Option<usize> {
        let mut state = self.state.lock().await;
        self.forget_turns(&mut state.history).await
    }

    /// Handle one inbound envelope. Returns the envelope that was published, if any.
    pub async fn process_message(&self, mut envelope: Envelope) -> Result<Option<Envelope>> {
        if envelope.response().is_some() {
            bail!("Envelope {} already carries a response", envelope.id);
        }

        let mut state = self.state.lock().await;

        if !state.loaded {
            tracing::warn!("Model is not loaded, answering envelope {} with a notice", envelope.id);
            envelope.set_response(MODEL_NOT_LOADED_REPLY)?;
            self.bus.publish(&self.settings.outbound_topic, envelope.clone());
            return Ok(Some(envelope));
        }

        let Some(text) = envelope.content.as_text().map(str::to_owned) else {
            tracing::warn!(
                "Ignoring {} content from {} ({}): only text is handled",
                envelope.content.kind(),
                envelope.sender.name,
                envelope.origin
            );
            return Ok(None);
        };

        tracing::info!(
            "Got message {} from {} via {}",
            envelope.id,
            envelope.sender.name,
            self.settings.inbound_topic
        );

        if !self.settings.use_memories {
            keep_persona_only(&mut state.history);
        }
        let mut exchange = Exchange::begin(
            &mut state.history,
            &self.base_persona,
            self.settings.use_memories,
        );
        exchange.push(Turn::user(text.clone()));
        self.forget_turns(&mut exchange).await;

        if self.settings.add_context {
            self.install_context(&mut exchange, &text).await;
        }

        let generation = match self.pool.generate(exchange.to_vec()).await {
            Ok(generation) => generation,
            Err(e) => {
                tracing::error!(
                    "{} for envelope {}: {}",
                    generation_failure_reason(&e),
                    envelope.id,
                    e
                );
                return Ok(None);
            }
        };

        tracing::info!(
            "Received response in {:.2}s ({} prompt + {} completion tokens)",
            generation.elapsed.as_secs_f64(),
            generation.usage.prompt_tokens,
            generation.usage.completion_tokens
        );

        exchange.push(Turn::assistant(generation.content.clone()));
        exchange.answered = true;
        envelope.set_response(generation.content.clone())?;

        if self.settings.save_memories {
            self.save_exchange(&text, envelope.timestamp, &generation.content)
                .await;
        }
        drop(exchange);

        self.bus
            .publish(&self.settings.outbound_topic, envelope.clone());
        Ok(Some(envelope))
    }

    async fn forget_turns(&self, history: &mut Vec<Turn>) -> Option<usize> {
        let mut evicted = 0;
        loop {
            let prompt = self.model.format_prompt(history);
            let tokens = match self.model.count_tokens(&prompt).await {
                Ok(tokens) => tokens,
                Err(e) => {
                    tracing::warn!("Unable to count tokens, keeping history as is: {}", e);
                    return None;
                }
            };

            if tokens <= self.settings.token_limit {
                if evicted > 0 {
                    tracing::debug!("Forgot {} turn(s), {} tokens remain", evicted, tokens);
                }
                return Some(tokens);
            }
            if history.len() <= 1 {
                tracing::warn!(
                    "Only the persona remains and it still takes {} tokens (limit {})",
                    tokens,
                    self.settings.token_limit
                );
                return Some(tokens);
            }

            history.remove(1);
            evicted += 1;
        }
    }

    /// Swap turn 0 for a persona carrying retrieved context. Returns whether it did.
    async fn install_context(&self, history: &mut [Turn], query: &str) -> bool {
        let Some(memory) = &self.memory else {
            return false;
        };

        let chain = match memory.get_context(query).await {
            Ok(chain) => chain,
            Err(e) => {
                tracing::warn!("Memory store unavailable, no context added: {}", e);
                return false;
            }
        };
        if chain.is_empty() {
            tracing::info!("No context added");
            return false;
        }

        match self.template.render(&chain.render_context()) {
            Ok(persona) => {
                if let Some(first) = history.first_mut() {
                    *first = Turn::system(persona);
                }
                tracing::info!("Added {} memories as context", chain.len());
                true
            }
            Err(e) => {
                tracing::warn!("Persona render failed, keeping base persona: {}", e);
                false
            }
        }
    }

    async fn save_exchange(&self, text: &str, sent_at: DateTime<Utc>, reply: &str) {
        let Some(memory) = &self.memory else {
            return;
        };
        let chain = MemoryChain::new(vec![
            MemoryRecord::new(self.settings.user_name.clone(), text, sent_at),
            MemoryRecord::new(self.settings.assistant_name.clone(), reply, Utc::now()),
        ]);
        if let Err(e) = memory.add_memories(&chain).await {
            tracing::error!("Could not save exchange to memory: {}", e);
        }
    }

    async fn restore_history(&self, history: &mut Vec<Turn>) {
        let Some(memory) = &self.memory else {
            return;
        };
        let chain = match memory.get_chat_memory(self.settings.chat_memory_limit).await {
            Ok(chain) => chain,
            Err(e) => {
                tracing::error!("Could not restore chat memory: {}", e);
                return;
            }
        };

        let restored = chain.len();
        for record in chain {
            let role = if record.from_name == self.settings.user_name {
                Role::User
            } else {
                Role::Assistant
            };
            history.push(Turn {
                role,
                content: record.message,
            });
        }
        let tokens = self.forget_turns(history).await;
        tracing::info!(
            "Restored {} turn(s) from chat memory, {} kept ({:?} tokens)",
            restored,
            history.len() - 1,
            tokens
        );
    }
}

fn keep_persona_only(history: &mut Vec<Turn>) {
    history.truncate(1);
}

fn generation_failure_reason(error: &ModelError) -> &'static str {
    if error.is_transport() {
        "Unable to reach model"
    } else {
        "Generation failed"
    }
}

/// History while one exchange is in flight. Dropping it, including when the
/// exchange future is cancelled, puts the base persona back in turn 0, rolls
/// back an unanswered user turn, and strips the exchange when history is not
/// retained.
struct Exchange<'a> {
    history: &'a mut Vec<Turn>,
    base_persona: &'a str,
    retain: bool,
    answered: bool,
}

impl<'a> Exchange<'a> {
    fn begin(history: &'a mut Vec<Turn>, base_persona: &'a str, retain: bool) -> Self {
        Self {
            history,
            base_persona,
            retain,
            answered: false,
        }
    }
}

impl Deref for Exchange<'_> {
    type Target = Vec<Turn>;

    fn deref(&self) -> &Vec<Turn> {
        &*self.history
    }
}

impl DerefMut for Exchange<'_> {
    fn deref_mut(&mut self) -> &mut Vec<Turn> {
        &mut *self.history
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        // Eviction may already have taken the user turn; never pop the persona.
        if !self.answered
            && self.history.len() > 1
            && self.history.last().map(|turn| turn.role) == Some(Role::User)
        {
            self.history.pop();
        }
        if let Some(first) = self.history.first_mut() {
            *first = Turn::system(self.base_persona);
        }
        if !self.retain {
            keep_persona_only(&mut *self.history);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MemoryStoreError, ModelError};
    use crate::message::{Content, Sender};
    use crate::model::{Generation, Usage};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::time::Duration;

    /// One token per whitespace-separated word.
    struct FakeModel {
        calls: Mutex<Vec<Vec<Turn>>>,
        loadable: bool,
        fail: bool,
        delay: Duration,
    }

    impl FakeModel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                loadable: true,
                fail: false,
                delay: Duration::ZERO,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                loadable: true,
                fail: true,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                loadable: true,
                fail: false,
                delay,
            })
        }

        fn calls(&self) -> Vec<Vec<Turn>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelPort for FakeModel {
        async fn load(&self) -> bool {
            self.loadable
        }

        async fn generate(&self, turns: &[Turn]) -> Result<Generation, ModelError> {
            self.calls.lock().unwrap().push(turns.to_vec());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(ModelError::Timeout("scripted".to_string()));
            }
            Ok(Generation {
                content: "ok".to_string(),
                finish_reason: Some("stop".to_string()),
                usage: Usage::default(),
                elapsed: Duration::from_millis(1),
            })
        }

        fn format_prompt(&self, turns: &[Turn]) -> String {
            turns
                .iter()
                .map(|turn| turn.content.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        }

        async fn count_tokens(&self, text: &str) -> Result<usize, ModelError> {
            Ok(text.split_whitespace().count())
        }

        async fn close(&self) {}
    }

    #[derive(Default)]
    struct FakeMemory {
        context: MemoryChain,
        chat: MemoryChain,
        fail_add: bool,
        added: Mutex<Vec<MemoryRecord>>,
    }

    #[async_trait]
    impl MemoryStore for FakeMemory {
        async fn connect(&self) -> Result<(), MemoryStoreError> {
            Ok(())
        }

        async fn close(&self) {}

        async fn add_memories(&self, chain: &MemoryChain) -> Result<(), MemoryStoreError> {
            if self.fail_add {
                return Err(MemoryStoreError::Unavailable("scripted".to_string()));
            }
            self.added.lock().unwrap().extend(chain.iter().cloned());
            Ok(())
        }

        async fn get_context(&self, _query: &str) -> Result<MemoryChain, MemoryStoreError> {
            Ok(self.context.clone())
        }

        async fn get_chat_memory(&self, limit: usize) -> Result<MemoryChain, MemoryStoreError> {
            let skip = self.chat.len().saturating_sub(limit);
            Ok(MemoryChain::new(self.chat.iter().skip(skip).cloned().collect()))
        }

        async fn delete_memory(&self, _uuid: &str) -> Result<bool, MemoryStoreError> {
            Ok(false)
        }
    }

    const PERSONA: &str = "You are Assistant.";

    fn settings(token_limit: usize, use_memories: bool) -> ControllerSettings {
        ControllerSettings {
            token_limit,
            use_memories,
            user_name: "User".to_string(),
            assistant_name: "Assistant".to_string(),
            ..ControllerSettings::default()
        }
    }

    fn build_controller(
        model: Arc<FakeModel>,
        memory: Option<Arc<FakeMemory>>,
        settings: ControllerSettings,
    ) -> ConversationController {
        let template = PersonaTemplate::from_source(
            "You are {{ assistant_name }}.\n{{ context }}",
            settings.user_name.clone(),
            settings.assistant_name.clone(),
        )
        .unwrap();
        ConversationController::new(
            model,
            memory.map(|m| m as Arc<dyn MemoryStore>),
            MessageBus::new(Duration::from_millis(10)),
            template,
            settings,
        )
        .unwrap()
    }

    fn message(text: &str) -> Envelope {
        Envelope::text(
            "test",
            Sender {
                id: "1".to_string(),
                name: "User".to_string(),
            },
            text,
        )
    }

    fn words(count: usize) -> String {
        vec!["word"; count].join(" ")
    }

    #[tokio::test]
    async fn end_to_end_single_exchange_without_retention() {
        let model = FakeModel::new();
        let controller = build_controller(model.clone(), None, settings(1000, false));
        assert_eq!(controller.base_persona(), PERSONA);
        assert!(controller.load_model().await);

        let published = controller
            .process_message(message("hi"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.response(), Some("ok"));

        let calls = model.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![Turn::system(PERSONA), Turn::user("hi")]);
        assert_eq!(controller.history().await, vec![Turn::system(PERSONA)]);
    }

    #[tokio::test]
    async fn not_loaded_short_circuits_without_generating() {
        let model = FakeModel::new();
        let controller = build_controller(model.clone(), None, settings(1000, true));

        let published = controller
            .process_message(message("hello?"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.response(), Some(MODEL_NOT_LOADED_REPLY));
        assert!(model.calls().is_empty());
        assert_eq!(controller.history().await.len(), 1);

        assert!(controller.load_model().await);
        controller.close().await;
        assert!(!controller.is_loaded().await);
        let again = controller.process_message(message("still there?")).await.unwrap();
        assert_eq!(again.unwrap().response(), Some(MODEL_NOT_LOADED_REPLY));
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn forget_converges_to_token_budget() {
        let controller = build_controller(FakeModel::new(), None, settings(50, true));
        {
            let mut state = controller.state.lock().await;
            for i in 0..10 {
                let turn = if i % 2 == 0 {
                    Turn::user(words(20))
                } else {
                    Turn::assistant(words(20))
                };
                state.history.push(turn);
            }
        }

        let tokens = controller.forget().await.unwrap();
        let history = controller.history().await;
        assert!(tokens <= 50 || history.len() == 1);
        assert_eq!(history[0], Turn::system(PERSONA));
        // 3 persona words + two 20-word turns
        assert_eq!(history.len(), 3);
        assert_eq!(tokens, 43);
    }

    #[tokio::test]
    async fn oversized_persona_is_kept_alone() {
        let controller = build_controller(FakeModel::new(), None, settings(2, true));
        controller
            .state
            .lock()
            .await
            .history
            .push(Turn::user("short"));

        let tokens = controller.forget().await.unwrap();
        assert_eq!(tokens, 3);
        assert_eq!(controller.history().await, vec![Turn::system(PERSONA)]);
    }

    #[tokio::test]
    async fn persona_stays_pinned_across_exchanges() {
        let model = FakeModel::new();
        let controller = build_controller(model.clone(), None, settings(30, true));
        assert!(controller.load_model().await);

        for _ in 0..5 {
            controller.process_message(message(&words(8))).await.unwrap();
        }

        for call in model.calls() {
            assert_eq!(call[0], Turn::system(PERSONA));
            let tokens: usize = call
                .iter()
                .map(|turn| turn.content.split_whitespace().count())
                .sum();
            assert!(tokens <= 30);
        }
        let history = controller.history().await;
        assert_eq!(history[0], Turn::system(PERSONA));
        assert_eq!(history.last(), Some(&Turn::assistant("ok")));
    }

    #[tokio::test]
    async fn context_persona_is_reset_after_exchange() {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let memory = Arc::new(FakeMemory {
            context: MemoryChain::new(vec![MemoryRecord::new("User", "I like tea", time)]),
            ..FakeMemory::default()
        });
        let model = FakeModel::new();
        let mut settings = settings(1000, true);
        settings.add_context = true;
        let controller = build_controller(model.clone(), Some(memory), settings);
        assert!(controller.load_model().await);

        controller.process_message(message("what do I like?")).await.unwrap();

        let calls = model.calls();
        assert_eq!(
            calls[0][0].content,
            "You are Assistant.\nUser: I like tea sent at 2024-01-02 03:04:05"
        );
        assert_eq!(controller.history().await[0], Turn::system(PERSONA));
    }

    #[tokio::test]
    async fn empty_context_leaves_base_persona() {
        let model = FakeModel::new();
        let mut settings = settings(1000, true);
        settings.add_context = true;
        let controller = build_controller(model.clone(), Some(Arc::new(FakeMemory::default())), settings);
        assert!(controller.load_model().await);

        controller.process_message(message("anything")).await.unwrap();
        assert_eq!(model.calls()[0][0], Turn::system(PERSONA));
    }

    #[tokio::test]
    async fn saves_exchange_and_tolerates_store_failure() {
        let memory = Arc::new(FakeMemory::default());
        let mut with_save = settings(1000, true);
        with_save.save_memories = true;
        let controller = build_controller(FakeModel::new(), Some(memory.clone()), with_save.clone());
        assert!(controller.load_model().await);
        controller.process_message(message("remember me")).await.unwrap();

        let added = memory.added.lock().unwrap().clone();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].from_name, "User");
        assert_eq!(added[0].message, "remember me");
        assert_eq!(added[1].from_name, "Assistant");
        assert_eq!(added[1].message, "ok");

        let broken = Arc::new(FakeMemory {
            fail_add: true,
            ..FakeMemory::default()
        });
        let controller = build_controller(FakeModel::new(), Some(broken), with_save);
        assert!(controller.load_model().await);
        let published = controller
            .process_message(message("remember me"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.response(), Some("ok"));
    }

    #[tokio::test]
    async fn generation_failure_publishes_nothing_and_rolls_back() {
        let controller = build_controller(FakeModel::failing(), None, settings(1000, true));
        assert!(controller.load_model().await);

        let published = controller.process_message(message("hi")).await.unwrap();
        assert!(published.is_none());
        assert_eq!(controller.history().await, vec![Turn::system(PERSONA)]);
    }

    #[test]
    fn transport_failures_read_as_unreachable_model() {
        assert_eq!(
            generation_failure_reason(&ModelError::Timeout("slow".to_string())),
            "Unable to reach model"
        );
        assert_eq!(
            generation_failure_reason(&ModelError::Connection("refused".to_string())),
            "Unable to reach model"
        );
        assert_eq!(
            generation_failure_reason(&ModelError::Api {
                status: 500,
                body: "oops".to_string()
            }),
            "Generation failed"
        );
    }

    #[tokio::test]
    async fn unrenderable_persona_falls_back_to_template_text() {
        let template = PersonaTemplate::from_source("Hi {{ mood }}", "User", "Assistant").unwrap();
        let controller = ConversationController::new(
            FakeModel::new(),
            None,
            MessageBus::new(Duration::from_millis(10)),
            template,
            settings(1000, true),
        )
        .unwrap();

        assert_eq!(controller.base_persona(), "Hi {{ mood }}");
        assert_eq!(
            controller.history().await,
            vec![Turn::system("Hi {{ mood }}")]
        );
    }

    #[tokio::test]
    async fn overlapping_exchanges_see_whole_histories() {
        let model = FakeModel::slow(Duration::from_millis(100));
        let controller = build_controller(model.clone(), None, settings(1000, true));
        assert!(controller.load_model().await);

        let (first, second) = tokio::join!(
            controller.process_message(message("one")),
            controller.process_message(message("two"))
        );
        assert!(first.unwrap().is_some());
        assert!(second.unwrap().is_some());

        assert_eq!(
            model.calls(),
            vec![
                vec![Turn::system(PERSONA), Turn::user("one")],
                vec![
                    Turn::system(PERSONA),
                    Turn::user("one"),
                    Turn::assistant("ok"),
                    Turn::user("two"),
                ],
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_exchange_restores_persona_and_drops_user_turn() {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let memory = Arc::new(FakeMemory {
            context: MemoryChain::new(vec![MemoryRecord::new("User", "secret", time)]),
            ..FakeMemory::default()
        });
        let model = FakeModel::slow(Duration::from_millis(300));
        let mut settings = settings(1000, true);
        settings.add_context = true;
        let controller = build_controller(model.clone(), Some(memory), settings);
        assert!(controller.load_model().await);

        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            controller.process_message(message("hi")),
        )
        .await;
        assert!(outcome.is_err());

        assert_eq!(model.calls().len(), 1);
        assert_eq!(controller.history().await, vec![Turn::system(PERSONA)]);
    }

    #[tokio::test]
    async fn stopping_the_bus_lets_the_exchange_in_flight_finish() {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let memory = Arc::new(FakeMemory {
            context: MemoryChain::new(vec![MemoryRecord::new("User", "secret", time)]),
            ..FakeMemory::default()
        });
        let model = FakeModel::slow(Duration::from_millis(300));
        let mut settings = settings(1000, true);
        settings.add_context = true;
        let controller = Arc::new(build_controller(model.clone(), Some(memory), settings));
        assert!(controller.load_model().await);
        controller.attach();

        let bus = controller.bus.clone();
        bus.start().unwrap();
        assert!(bus.publish("input", message("hi")));
        for _ in 0..300 {
            if !model.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(model.calls().len(), 1);

        bus.stop();
        assert_eq!(
            controller.history().await,
            vec![Turn::system(PERSONA), Turn::user("hi"), Turn::assistant("ok")]
        );
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn non_text_content_is_ignored() {
        let model = FakeModel::new();
        let controller = build_controller(model.clone(), None, settings(1000, true));
        assert!(controller.load_model().await);

        let photo = Envelope::new(
            "test",
            Sender {
                id: "1".to_string(),
                name: "User".to_string(),
            },
            Content::Photo(vec![1, 2, 3]),
        );
        assert!(controller.process_message(photo).await.unwrap().is_none());
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn answered_envelope_is_rejected() {
        let controller = build_controller(FakeModel::new(), None, settings(1000, true));
        let mut envelope = message("hi");
        envelope.set_response("already").unwrap();
        assert!(controller.process_message(envelope).await.is_err());
    }

    #[tokio::test]
    async fn restores_chat_memory_on_load() {
        let time = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let memory = Arc::new(FakeMemory {
            chat: MemoryChain::new(vec![
                MemoryRecord::new("User", "first question", time),
                MemoryRecord::new("Assistant", "first answer", time),
            ]),
            ..FakeMemory::default()
        });
        let controller = build_controller(FakeModel::new(), Some(memory), settings(1000, true));

        assert!(controller.load_model().await);
        assert!(controller.load_model().await);
        assert_eq!(
            controller.history().await,
            vec![
                Turn::system(PERSONA),
                Turn::user("first question"),
                Turn::assistant("first answer"),
            ]
        );
    }

    #[tokio::test]
    async fn attached_controller_answers_over_the_bus() {
        let bus = MessageBus::new(Duration::from_millis(5));
        let template = PersonaTemplate::from_source(PERSONA, "User", "Assistant").unwrap();
        let controller = Arc::new(
            ConversationController::new(
                FakeModel::new(),
                None,
                bus.clone(),
                template,
                settings(1000, false),
            )
            .unwrap(),
        );
        assert!(controller.load_model().await);
        controller.attach();
        assert_eq!(bus.listener_count("input"), 1);

        let (reply_tx, reply_rx) = flume::unbounded::<Envelope>();
        bus.subscribe(
            "back_response",
            handler(move |envelope: Envelope| {
                let reply_tx = reply_tx.clone();
                async move {
                    let _ = reply_tx.send(envelope);
                    anyhow::Ok(())
                }
            }),
        );
        bus.start().unwrap();
        assert!(bus.publish("input", message("hi")));

        let reply = tokio::time::timeout(Duration::from_secs(5), reply_rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.response(), Some("ok"));

        controller.detach();
        assert!(!bus.has_topic("input"));
        bus.stop();
    }
}
