use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flume::Sender;
use tokio::task::JoinHandle;

use crate::automation::executor::{ActionExecutor, HttpActionExecutor, LoggingActionExecutor};
use crate::automation::trigger::TriggerEvaluator;
use crate::automation::{AutomationEngine, EngineEvent};
use crate::clock::{Clock, SystemClock};
use crate::config::BackendConfig;
use crate::database::AutomationDatabase;
use crate::learning::LearningEngine;
use crate::mood::MoodArbiter;

pub struct BackendRuntime {
    pub config: BackendConfig,
    pub database: Arc<AutomationDatabase>,
    pub engine: Arc<AutomationEngine>,
}

pub struct BackendRuntimeBuilder {
    config: BackendConfig,
    event_tx: Sender<EngineEvent>,
    executor: Option<Arc<dyn ActionExecutor>>,
    clock: Option<Arc<dyn Clock>>,
    database: Option<Arc<AutomationDatabase>>,
}

impl BackendRuntimeBuilder {
    pub fn new(config: BackendConfig, event_tx: Sender<EngineEvent>) -> Self {
        Self {
            config,
            event_tx,
            executor: None,
            clock: None,
            database: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use an already-open database instead of `config.database_path`.
    pub fn with_database(mut self, database: Arc<AutomationDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    pub fn build(self) -> Result<BackendRuntime> {
        let config = self.config;

        let database = match self.database {
            Some(database) => database,
            None => Arc::new(
                AutomationDatabase::open(&config.database_path).with_context(|| {
                    format!("failed to open automation database {}", config.database_path)
                })?,
            ),
        };

        let executor = match self.executor {
            Some(executor) => executor,
            None => build_executor(&config)?,
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let mood = Arc::new(
            MoodArbiter::new(database.clone(), clock.clone())
                .with_default_override_minutes(config.mood.default_override_minutes)
                .with_stats_window(config.mood.stats_window),
        );

        let mut learning =
            LearningEngine::new().with_history_limit(config.learning.history_limit);
        learning.set_learning_rate(config.learning.learning_rate);

        let engine = Arc::new(
            AutomationEngine::new(database.clone(), mood, executor, clock, self.event_tx)
                .with_evaluator(TriggerEvaluator::from_offset_minutes(
                    config.timezone_offset_minutes,
                ))
                .with_learning(learning)
                .with_learning_refresh_limit(config.learning.refresh_limit),
        );

        let init_rt = tokio::runtime::Runtime::new()?;
        init_rt
            .block_on(engine.initialize())
            .context("failed to initialize automation engine")?;

        Ok(BackendRuntime {
            config,
            database,
            engine,
        })
    }
}

impl BackendRuntime {
    pub fn bootstrap(config: BackendConfig, event_tx: Sender<EngineEvent>) -> Result<Self> {
        BackendRuntimeBuilder::new(config, event_tx).build()
    }

    /// Start the pipeline, tick loop and change-feed listeners on the
    /// current tokio runtime.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.engine.spawn_pipeline(),
            self.engine
                .spawn_tick_loop(Duration::from_millis(self.config.tick_interval_ms.max(50))),
            self.engine
                .spawn_transcript_listener(&self.config.transcript_table),
        ];
        for table in &self.config.watched_tables {
            handles.push(self.engine.spawn_table_listener(table));
        }
        tracing::info!(
            "Automation background tasks started ({} watched table(s))",
            self.config.watched_tables.len()
        );
        handles
    }
}

fn build_executor(config: &BackendConfig) -> Result<Arc<dyn ActionExecutor>> {
    match config
        .action_webhook_url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
    {
        Some(url) => {
            tracing::info!("Routing actions to {}", url);
            let executor = HttpActionExecutor::new(
                url,
                Duration::from_secs(config.action_timeout_secs.max(1)),
            )?;
            Ok(Arc::new(executor))
        }
        None => {
            tracing::warn!("No action webhook configured; actions will only be logged");
            Ok(Arc::new(LoggingActionExecutor))
        }
    }
}
