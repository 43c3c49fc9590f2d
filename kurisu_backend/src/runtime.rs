use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::bus::MessageBus;
use crate::config::{KurisuConfig, MemoryBackend};
use crate::conversation::{ControllerSettings, ConversationController, PersonaTemplate};
use crate::memory::{HttpMemoryStore, MemoryStore, SqliteMemoryStore};
use crate::model::{ModelPort, OpenAiCompatibleModel};

/// Everything one assistant process runs: bus, ports, and the controller wired to them.
pub struct AssistantRuntime {
    pub config: KurisuConfig,
    pub bus: MessageBus,
    pub controller: Arc<ConversationController>,
    pub memory: Option<Arc<dyn MemoryStore>>,
}

pub struct AssistantRuntimeBuilder {
    config: KurisuConfig,
    model: Option<Arc<dyn ModelPort>>,
    memory: Option<Arc<dyn MemoryStore>>,
    persona: Option<PersonaTemplate>,
}

impl AssistantRuntimeBuilder {
    pub fn new(config: KurisuConfig) -> Self {
        Self {
            config,
            model: None,
            memory: None,
            persona: None,
        }
    }

    /// Use this model instead of the configured OpenAI-compatible endpoint.
    pub fn with_model(mut self, model: Arc<dyn ModelPort>) -> Self {
        self.model = Some(model);
        self
    }

    /// Use this store instead of the configured memory backend.
    pub fn with_memory_store(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Use this persona instead of reading the template from `profiles_dir`.
    pub fn with_persona(mut self, persona: PersonaTemplate) -> Self {
        self.persona = Some(persona);
        self
    }

    pub fn build(self) -> Result<AssistantRuntime> {
        let config = self.config;
        let bus = MessageBus::new(Duration::from_millis(config.poll_interval_ms.max(1)));

        let model: Arc<dyn ModelPort> = match self.model {
            Some(model) => model,
            None => Arc::new(
                OpenAiCompatibleModel::new(config.llm.clone())
                    .context("Failed to create model client")?,
            ),
        };

        let memory = match self.memory {
            Some(memory) => Some(memory),
            None => build_memory_store(&config)?,
        };
        if memory.is_none() && (config.save_memories || config.add_context) {
            tracing::warn!("save_memories/add_context are set but no memory backend is configured");
        }

        let persona = match self.persona {
            Some(persona) => persona,
            None => {
                let path = config.persona_path();
                PersonaTemplate::load(&path, config.user_name.clone(), config.assistant_name.clone())
                    .with_context(|| format!("Failed to load persona from {:?}", path))?
            }
        };

        let controller = Arc::new(
            ConversationController::new(
                model,
                memory.clone(),
                bus.clone(),
                persona,
                ControllerSettings::from_config(&config),
            )
            .context("Failed to create conversation controller")?,
        );
        controller.attach();

        Ok(AssistantRuntime {
            config,
            bus,
            controller,
            memory,
        })
    }
}

impl AssistantRuntime {
    pub fn bootstrap(config: KurisuConfig) -> Result<Self> {
        AssistantRuntimeBuilder::new(config).build()
    }

    /// Start the bus worker, connect memory, and load the model. A model that
    /// fails to load leaves the controller answering "model not loaded".
    pub async fn start(&self) -> Result<()> {
        self.bus.start().context("Failed to start message bus")?;

        if let Some(memory) = &self.memory {
            if let Err(e) = memory.connect().await {
                tracing::warn!("Memory store unavailable, continuing without it: {}", e);
            }
        }

        if !self.controller.load_model().await {
            tracing::warn!("Model is not available yet; call load_model again once it is");
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.bus.stop();
        if let Some(memory) = &self.memory {
            memory.close().await;
        }
        self.controller.shutdown().await;
        tracing::info!("Assistant runtime stopped");
    }
}

fn build_memory_store(config: &KurisuConfig) -> Result<Option<Arc<dyn MemoryStore>>> {
    let settings = &config.memory;
    let store: Arc<dyn MemoryStore> = match settings.backend {
        MemoryBackend::Disabled => return Ok(None),
        MemoryBackend::Sqlite => {
            tracing::info!("Using sqlite memory at {}", settings.database_path);
            Arc::new(
                SqliteMemoryStore::open(
                    &settings.database_path,
                    config.assistant_name.clone(),
                    settings.context_limit,
                    settings.max_distance,
                )
                .with_context(|| format!("Failed to open {}", settings.database_path))?,
            )
        }
        MemoryBackend::Http => {
            tracing::info!("Using memory server at {}", settings.base_url);
            Arc::new(HttpMemoryStore::new(settings.base_url.clone())?)
        }
    };
    Ok(Some(store))
}
