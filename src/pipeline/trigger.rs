use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::domain::CacheSettings;
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::{Message, QueueName};
use crate::records::MetadataStore;

use super::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A Submit, Cache or Finish job is already in flight.
    Busy,
    Disabled,
    Dispatched,
}

impl<S, C, P, L, A, R> Pipeline<S, C, P, L, A, R>
where
    S: MetadataStore + Clone,
    C: RepositoryClient,
    P: PublicLinkService,
    L: ProjectLoadStatus,
    A: AlertSink,
    R: Archiver,
{
    /// Ensure the configuration record exists with `enable_cache = enable`,
    /// queue an immediate Trigger and (re)register the recurring ones.
    pub fn enable_and_trigger(&self, enable: bool) -> Result<CacheSettings, CacheError> {
        let settings = self.settings.set_enabled(enable)?;
        self.queues.enqueue(Message::Trigger);
        self.schedule_recurring();
        tracing::info!(enable_cache = settings.enable_cache, "download cache triggered");
        Ok(settings)
    }

    /// (Re)register the recurring Trigger and Sweep jobs.
    pub fn schedule_recurring(&self) {
        self.queues
            .register_repeat(Message::Trigger, self.schedule.trigger_interval);
        self.queues
            .register_repeat(Message::Sweep, self.schedule.sweep_interval);
    }

    /// Single-flight gate: dispatch Submit only when no population cycle is running.
    pub fn process_trigger(&self) -> Result<TriggerOutcome, CacheError> {
        if let Some(queue) = QueueName::CYCLE
            .into_iter()
            .find(|queue| self.queues.active_count(*queue) > 0)
        {
            tracing::info!(%queue, "cache cycle in progress, not dispatching");
            return Ok(TriggerOutcome::Busy);
        }

        if !self.settings.get()?.enable_cache {
            tracing::info!("download cache disabled");
            return Ok(TriggerOutcome::Disabled);
        }

        match self
            .queues
            .enqueue_if_idle(Message::Submit, &QueueName::CYCLE)
        {
            Some(_) => {
                tracing::info!("submit dispatched");
                Ok(TriggerOutcome::Dispatched)
            }
            None => Ok(TriggerOutcome::Busy),
        }
    }
}
