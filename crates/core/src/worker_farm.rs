use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::diagnostic::Diagnostic;
use crate::plugin::{PluginConfig, PluginRegistry};
use crate::transformers::{run_transform_unit, PipelineRunOutput, TransformWorkUnit};
use crate::types::{Asset, BuildOptions};

/// The fixed RPC surface workers expose.
pub enum WorkerRequest {
  Transform(TransformWorkUnit),
  Validate(ValidateWorkUnit),
  /// Broadcast when a plugin's configuration changes so workers drop any
  /// cached module state for it.
  InvalidateRequireCache { specifier: String },
  Ping,
}

pub enum WorkerResponse {
  Transform(Result<PipelineRunOutput, Vec<Diagnostic>>),
  Validate(Result<Vec<Diagnostic>, Vec<Diagnostic>>),
  Invalidated,
  Pong,
}

pub struct ValidateWorkUnit {
  pub plugin: String,
  pub asset: Asset,
}

/// A request a worker makes back to the master, e.g. to load a plugin
/// configuration it is missing mid-pipeline.
pub enum MasterRequest {
  LoadConfig { plugin: String, search_path: PathBuf },
}

pub enum MasterResponse {
  Config(Result<PluginConfig, Vec<Diagnostic>>),
}

struct MasterMessage {
  request: MasterRequest,
  response: Sender<MasterResponse>,
}

pub type ReverseHandler = Arc<dyn Fn(&MasterRequest) -> MasterResponse + Send + Sync>;

struct WorkerMessage {
  #[allow(dead_code)]
  index: u64,
  request: WorkerRequest,
  response: Sender<WorkerResponse>,
}

/// Shared state each worker thread executes against.
pub struct WorkerContext {
  pub options: Arc<BuildOptions>,
  pub plugins: Arc<PluginRegistry>,
  master: Sender<MasterMessage>,
}

impl WorkerContext {
  /// A reverse call to the master, blocking until it answers. Bounded by the
  /// per-worker concurrency cap via the master channel capacity.
  pub fn load_config(
    &self,
    plugin: &str,
    search_path: PathBuf,
  ) -> Result<PluginConfig, Vec<Diagnostic>> {
    let (tx, rx) = bounded(1);
    let message = MasterMessage {
      request: MasterRequest::LoadConfig {
        plugin: plugin.to_string(),
        search_path,
      },
      response: tx,
    };
    if self.master.send(message).is_err() {
      return Err(vec![Diagnostic::new(
        crate::diagnostic::DiagnosticKind::Unknown,
        "worker-farm",
        "master channel closed".into(),
      )]);
    }
    match rx.recv() {
      Ok(MasterResponse::Config(result)) => result,
      Err(_) => Err(vec![Diagnostic::new(
        crate::diagnostic::DiagnosticKind::Unknown,
        "worker-farm",
        "master dropped a reverse call".into(),
      )]),
    }
  }
}

struct Worker {
  sender: Sender<WorkerMessage>,
  handle: Option<JoinHandle<()>>,
}

/// A response that has been dispatched but not yet received. Dropping it
/// without waiting abandons the result.
pub struct PendingResponse {
  pub index: u64,
  receiver: Receiver<WorkerResponse>,
}

impl PendingResponse {
  pub fn wait(self) -> WorkerResponse {
    self.receiver.recv().unwrap_or(WorkerResponse::Pong)
  }
}

/// A pool of worker threads processing typed requests. Requests carry a
/// monotonically increasing index; responses arrive out of order on
/// per-request channels. Master→worker sends block once a worker has
/// `max_concurrent_calls_per_worker` requests in flight.
pub struct WorkerFarm {
  workers: Vec<Worker>,
  next_worker: AtomicUsize,
  next_index: AtomicU64,
  master_handle: Option<JoinHandle<()>>,
}

impl WorkerFarm {
  pub fn new(
    worker_count: usize,
    max_concurrent_calls_per_worker: usize,
    options: Arc<BuildOptions>,
    plugins: Arc<PluginRegistry>,
    reverse_handler: ReverseHandler,
  ) -> WorkerFarm {
    let worker_count = worker_count.max(1);
    let (master_tx, master_rx) = unbounded::<MasterMessage>();

    let master_handle = std::thread::Builder::new()
      .name("baler-master".into())
      .spawn(move || {
        while let Ok(message) = master_rx.recv() {
          let response = reverse_handler(&message.request);
          let _ = message.response.send(response);
        }
      })
      .expect("failed to spawn master service thread");

    let workers = (0..worker_count)
      .map(|id| {
        let (tx, rx) = bounded::<WorkerMessage>(max_concurrent_calls_per_worker.max(1));
        let ctx = WorkerContext {
          options: Arc::clone(&options),
          plugins: Arc::clone(&plugins),
          master: master_tx.clone(),
        };
        let handle = std::thread::Builder::new()
          .name(format!("baler-worker-{}", id))
          .spawn(move || worker_loop(rx, ctx))
          .expect("failed to spawn worker thread");
        Worker {
          sender: tx,
          handle: Some(handle),
        }
      })
      .collect();

    WorkerFarm {
      workers,
      next_worker: AtomicUsize::new(0),
      next_index: AtomicU64::new(0),
      master_handle: Some(master_handle),
    }
  }

  /// Dispatches a request without waiting for its response.
  pub fn start(&self, request: WorkerRequest) -> PendingResponse {
    let index = self.next_index.fetch_add(1, Ordering::Relaxed);
    let worker = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
    let (tx, rx) = bounded(1);
    let message = WorkerMessage {
      index,
      request,
      response: tx,
    };
    // Blocks when the worker is saturated, which is the backpressure policy.
    let _ = self.workers[worker].sender.send(message);
    PendingResponse {
      index,
      receiver: rx,
    }
  }

  pub fn run(&self, request: WorkerRequest) -> WorkerResponse {
    self.start(request).wait()
  }

  /// Sends a request to every worker and waits for all of them, used for
  /// require-cache invalidation when dev-deps change.
  pub fn broadcast(&self, make_request: impl Fn() -> WorkerRequest) {
    let pending: Vec<PendingResponse> = self
      .workers
      .iter()
      .map(|worker| {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        let _ = worker.sender.send(WorkerMessage {
          index,
          request: make_request(),
          response: tx,
        });
        PendingResponse {
          index,
          receiver: rx,
        }
      })
      .collect();
    for response in pending {
      let _ = response.wait();
    }
  }

  pub fn worker_count(&self) -> usize {
    self.workers.len()
  }
}

impl Drop for WorkerFarm {
  fn drop(&mut self) {
    for worker in &mut self.workers {
      // Dropping the sender ends the worker loop.
      let (empty_tx, _) = bounded(0);
      let _ = std::mem::replace(&mut worker.sender, empty_tx);
    }
    for worker in &mut self.workers {
      if let Some(handle) = worker.handle.take() {
        let _ = handle.join();
      }
    }
    if let Some(handle) = self.master_handle.take() {
      drop(handle);
    }
  }
}

fn worker_loop(rx: Receiver<WorkerMessage>, ctx: WorkerContext) {
  while let Ok(message) = rx.recv() {
    let response = match message.request {
      WorkerRequest::Transform(unit) => WorkerResponse::Transform(run_transform_unit(unit, &ctx)),
      WorkerRequest::Validate(unit) => WorkerResponse::Validate(run_validate_unit(unit, &ctx)),
      WorkerRequest::InvalidateRequireCache { specifier: _ } => {
        // In-process plugins hold no module cache; acknowledging keeps the
        // broadcast protocol uniform.
        WorkerResponse::Invalidated
      }
      WorkerRequest::Ping => WorkerResponse::Pong,
    };
    let _ = message.response.send(response);
  }
}

fn run_validate_unit(
  unit: ValidateWorkUnit,
  ctx: &WorkerContext,
) -> Result<Vec<Diagnostic>, Vec<Diagnostic>> {
  let validator = ctx.plugins.validator(&unit.plugin).map_err(|d| vec![d])?;
  let code = ctx
    .options
    .cache
    .get_blob(&unit.asset.content_key)
    .unwrap_or_default();
  validator.validate(&unit.asset, &code).map_err(|err| {
    vec![Diagnostic::plugin_error(
      &unit.plugin,
      Some(unit.asset.file_path.as_ref()),
      err,
    )]
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Cache;
  use crate::file_system::MemoryFileSystem;
  use std::collections::BTreeMap;

  fn options() -> Arc<BuildOptions> {
    let fs = Arc::new(MemoryFileSystem::new());
    Arc::new(BuildOptions {
      mode: crate::types::BuildMode::Development,
      project_root: "/app".into(),
      cache_dir: "/cache".into(),
      dist_dir: None,
      config_path: None,
      env: BTreeMap::new(),
      input_fs: fs.clone(),
      output_fs: fs.clone(),
      cache: Arc::new(Cache::new(fs, "/cache".into())),
      source_maps: false,
      lazy: false,
      worker_count: 2,
    })
  }

  #[test]
  fn ping_round_trip() {
    let farm = WorkerFarm::new(
      2,
      4,
      options(),
      Arc::new(PluginRegistry::new()),
      Arc::new(|_req| MasterResponse::Config(Err(vec![]))),
    );
    match farm.run(WorkerRequest::Ping) {
      WorkerResponse::Pong => {}
      _ => panic!("expected pong"),
    }
  }

  #[test]
  fn indices_are_monotonic() {
    let farm = WorkerFarm::new(
      1,
      4,
      options(),
      Arc::new(PluginRegistry::new()),
      Arc::new(|_req| MasterResponse::Config(Err(vec![]))),
    );
    let a = farm.start(WorkerRequest::Ping);
    let b = farm.start(WorkerRequest::Ping);
    assert!(b.index > a.index);
    a.wait();
    b.wait();
  }

  #[test]
  fn broadcast_reaches_every_worker() {
    let farm = WorkerFarm::new(
      3,
      4,
      options(),
      Arc::new(PluginRegistry::new()),
      Arc::new(|_req| MasterResponse::Config(Err(vec![]))),
    );
    // Completes only if every worker acknowledges.
    farm.broadcast(|| WorkerRequest::InvalidateRequireCache {
      specifier: "transformer-js".into(),
    });
  }
}
