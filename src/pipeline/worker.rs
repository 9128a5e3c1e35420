use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::adc::RepositoryClient;
use crate::alert::AlertSink;
use crate::archive::Archiver;
use crate::error::CacheError;
use crate::load_status::ProjectLoadStatus;
use crate::postit::PublicLinkService;
use crate::queue::{Job, Message, QueueName};
use crate::records::MetadataStore;

use super::Pipeline;

const CLAIM_TIMEOUT: Duration = Duration::from_secs(1);
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

impl<S, C, P, L, A, R> Pipeline<S, C, P, L, A, R>
where
    S: MetadataStore + Clone,
    C: RepositoryClient,
    P: PublicLinkService,
    L: ProjectLoadStatus,
    A: AlertSink,
    R: Archiver,
{
    /// Run one job's stage and return the messages it hands on.
    pub fn run_job(&self, job: &Job) -> Result<Vec<Message>, CacheError> {
        let follow_ups = match &job.message {
            Message::Trigger => {
                self.process_trigger()?;
                Vec::new()
            }
            Message::Submit => self.process_submit()?.follow_up().into_iter().collect(),
            Message::Cache {
                repertoire_cache_uuid,
            } => self
                .process_cache(repertoire_cache_uuid)?
                .follow_up()
                .into_iter()
                .collect(),
            Message::Finish(request) => self
                .process_finish(request)?
                .follow_up()
                .into_iter()
                .collect(),
            Message::FinishStudy { study_cache_uuid } => self
                .process_finish_study(study_cache_uuid)?
                .follow_up()
                .into_iter()
                .collect(),
            Message::Clear {
                repository_id,
                study_id,
            } => {
                self.process_clear(repository_id, study_id)?;
                Vec::new()
            }
            Message::Sweep => self.process_sweep()?.follow_ups(),
        };
        Ok(follow_ups)
    }

    /// Claim and run one job from `queue`. `None` when nothing was waiting,
    /// otherwise whether the job succeeded.
    pub fn run_queue_once(&self, queue: QueueName) -> Option<bool> {
        let job = self.queues.claim(queue)?;
        Some(self.execute(job))
    }

    /// Drain every queue in stage order until nothing is waiting or
    /// `max_jobs` have run. Returns the number of jobs run.
    pub fn run_until_idle(&self, max_jobs: usize) -> usize {
        let mut ran = 0;
        while ran < max_jobs {
            let Some(queue) = QueueName::ALL
                .into_iter()
                .find(|queue| self.queues.waiting_count(*queue) > 0)
            else {
                break;
            };
            if self.run_queue_once(queue).is_some() {
                ran += 1;
            }
        }
        ran
    }

    fn execute(&self, job: Job) -> bool {
        let queue = job.queue();
        let span = tracing::info_span!("job", %queue, job_id = job.id);
        let _guard = span.enter();

        match self.run_job(&job) {
            Ok(follow_ups) => {
                self.queues.complete_and_enqueue(&job, true, follow_ups);
                true
            }
            Err(err) => {
                self.report(queue.as_str(), &err);
                self.queues.complete(&job, false);
                false
            }
        }
    }
}

impl<S, C, P, L, A, R> Pipeline<S, C, P, L, A, R>
where
    S: MetadataStore + Clone + 'static,
    C: RepositoryClient + 'static,
    P: PublicLinkService + 'static,
    L: ProjectLoadStatus + 'static,
    A: AlertSink + 'static,
    R: Archiver + 'static,
{
    /// One worker thread per queue plus a scheduler thread firing recurring
    /// jobs, all running until `shutdown` is set.
    pub fn spawn_workers(
        self: Arc<Self>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>, CacheError> {
        let mut handles = Vec::with_capacity(QueueName::ALL.len() + 1);
        for queue in QueueName::ALL {
            let pipeline = Arc::clone(&self);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("adc-cache-{queue}"))
                .spawn(move || {
                    tracing::debug!(%queue, "worker started");
                    while !shutdown.load(Ordering::Relaxed) {
                        if let Some(job) = pipeline.queues.claim_timeout(queue, CLAIM_TIMEOUT) {
                            pipeline.execute(job);
                        }
                    }
                    tracing::debug!(%queue, "worker stopped");
                })
                .map_err(|err| CacheError::Worker(format!("spawn {queue} worker: {err}")))?;
            handles.push(handle);
        }

        let pipeline = Arc::clone(&self);
        let scheduler = thread::Builder::new()
            .name("adc-cache-scheduler".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::Relaxed) {
                    let fired = pipeline.queues.fire_due(Instant::now());
                    if fired > 0 {
                        tracing::debug!(fired, "recurring jobs enqueued");
                    }
                    thread::sleep(SCHEDULER_TICK);
                }
                pipeline.queues.close();
            })
            .map_err(|err| CacheError::Worker(format!("spawn scheduler: {err}")))?;
        handles.push(scheduler);
        Ok(handles)
    }
}
