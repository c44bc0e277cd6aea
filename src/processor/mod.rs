//! Processing groups: named worker lanes that run handlers.
//!
//! Every routing entry names the group its handler runs on. A group owns a
//! bounded queue of [`RoutedContext`]s, its pre and post
//! [`ManipulatorCollection`]s, and one or more worker threads:
//!
//! - [`LaneMode::Single`]: one worker, requests complete in the order they
//!   were enqueued.
//! - [`LaneMode::Multi`]: several workers share the queue; no ordering
//!   guarantee between requests, same per-request contract.
//!
//! The framework's internal manipulators are installed the first time the
//! group starts. Collections are snapshotted at start, so user manipulators
//! added while the group runs take effect on the next start.

mod dispatch;

use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use tracing::info;

use crate::config::{GroupConfig, LaneMode, ServiceConfig};
use crate::context::HttpContext;
use crate::manipulation::{
    ContentTypePostSetter, ContentTypePreSetter, CorsHeaderSetter, Manipulator,
    ManipulatorCollection, Phase,
};
use crate::pipeline::{self, PipelineError, StageHandle};
use crate::router::RoutingEntry;

pub use dispatch::DispatchFault;
pub(crate) use dispatch::{Chains, GroupWorker};

/// A request paired with the entry that will handle it.
#[derive(Debug)]
pub struct RoutedContext {
    pub ctx: HttpContext,
    pub entry: Arc<RoutingEntry>,
}

/// What a group needs from its service when it starts.
pub(crate) struct GroupRuntime {
    pub(crate) config: Arc<ServiceConfig>,
    pub(crate) cors: Arc<CorsHeaderSetter>,
    pub(crate) output: Sender<HttpContext>,
}

pub struct ProcessingGroup {
    config: GroupConfig,
    pre: ManipulatorCollection,
    post: ManipulatorCollection,
    sender: Sender<RoutedContext>,
    receiver: Receiver<RoutedContext>,
    workers: Vec<StageHandle>,
    initialized: bool,
}

impl ProcessingGroup {
    pub fn new(config: GroupConfig) -> Self {
        let (sender, receiver) = pipeline::pipe(config.queue_capacity);
        Self {
            config,
            pre: ManipulatorCollection::new(Phase::Pre),
            post: ManipulatorCollection::new(Phase::Post),
            sender,
            receiver,
            workers: Vec::new(),
            initialized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    pub fn lanes(&self) -> LaneMode {
        self.config.lanes
    }

    /// Appends a user pre-manipulator.
    pub fn add_pre<M>(&mut self, manipulator: M) -> &mut Self
    where
        M: Manipulator + 'static,
    {
        self.pre.add(manipulator);
        self
    }

    /// Appends a user post-manipulator.
    pub fn add_post<M>(&mut self, manipulator: M) -> &mut Self
    where
        M: Manipulator + 'static,
    {
        self.post.add(manipulator);
        self
    }

    pub fn pre(&self) -> &ManipulatorCollection {
        &self.pre
    }

    pub fn post(&self) -> &ManipulatorCollection {
        &self.post
    }

    pub fn pre_mut(&mut self) -> &mut ManipulatorCollection {
        &mut self.pre
    }

    pub fn post_mut(&mut self) -> &mut ManipulatorCollection {
        &mut self.post
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Requests waiting in the group queue.
    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub(crate) fn sender(&self) -> &Sender<RoutedContext> {
        &self.sender
    }

    fn init(&mut self, runtime: &GroupRuntime) {
        if self.initialized {
            return;
        }
        self.pre.add_internal(Arc::new(ContentTypePreSetter::new(
            runtime.config.default_content_type.clone(),
        )));
        self.pre.add_internal(runtime.cors.clone());
        self.post.add_internal(Arc::new(ContentTypePostSetter));
        self.post.add_internal(runtime.cors.clone());
        self.initialized = true;
    }

    /// Installs the internal manipulators on first use and spawns the workers.
    /// Does nothing if the group is already running.
    pub(crate) fn start(&mut self, runtime: &GroupRuntime) -> Result<(), PipelineError> {
        if self.is_running() {
            return Ok(());
        }
        self.init(runtime);

        let chains = Arc::new(Chains {
            pre: self.pre.clone(),
            post: self.post.clone(),
        });
        let lanes = self.config.lanes.workers();
        for lane in 0..lanes {
            let worker = GroupWorker {
                group: self.config.name.clone(),
                lane,
                chains: Arc::clone(&chains),
                input: self.receiver.clone(),
                output: runtime.output.clone(),
            };
            let name = format!("restline-{}-{lane}", self.config.name);
            match StageHandle::start(name, worker, self.config.timeout()) {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
        }

        info!(group = %self.config.name, lanes, "processing group started");
        Ok(())
    }

    /// Asks every worker to exit after its current request. Does not wait.
    pub(crate) fn signal_stop(&self) {
        for worker in &self.workers {
            worker.signal_stop();
        }
    }

    /// Signals every worker, then waits for all of them.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.signal_stop();
        for mut worker in self.workers.drain(..) {
            worker.stop();
        }
        info!(group = %self.config.name, "processing group stopped");
    }
}

impl Drop for ProcessingGroup {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ProcessingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingGroup")
            .field("config", &self.config)
            .field("pre", &self.pre)
            .field("post", &self.post)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
