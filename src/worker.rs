//! Worker-process runtime.
//!
//! A worker binary calls [`serve_stdio`] with its [`ModelLoader`]. The loop
//! reads [`WorkerCommand`] frames from stdin and answers every `Simulate` with
//! exactly one [`WorkerReply::Outcome`] on stdout. The model handle is loaded on
//! the first request and kept for the life of the process.
//!
//! stdout carries the protocol; anything else (logs) must go to stderr.

use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info, warn};

use crate::error::LoadError;
use crate::model::{ModelHandle, ModelLoader, ModelRef};
use crate::outcome::{strip, Failure, FailureKind, ResultPolicy, SimulationValue};
use crate::platform::PlatformKey;
use crate::protocol::{self, WorkerCommand, WorkerReply};
use crate::request::SimulationRequest;

enum HandleState {
    Unloaded,
    Loaded(Box<dyn ModelHandle>),
    Failed(LoadError),
}

struct Worker<L> {
    loader: L,
    target: Option<(ModelRef, PlatformKey)>,
    handle: HandleState,
    served: usize,
}

impl<L: ModelLoader> Worker<L> {
    fn new(loader: L) -> Self {
        Self {
            loader,
            target: None,
            handle: HandleState::Unloaded,
            served: 0,
        }
    }

    fn init(&mut self, model: ModelRef, platform: PlatformKey) {
        info!(model = %model.path.display(), %platform, "worker initialized");
        self.target = Some((model, platform));
        self.handle = HandleState::Unloaded;
    }

    fn ensure_loaded(&mut self) -> Result<&mut Box<dyn ModelHandle>, LoadError> {
        if matches!(self.handle, HandleState::Unloaded) {
            if let Some((model, platform)) = &self.target {
                self.handle = match self.loader.load(model, platform) {
                    Ok(handle) => {
                        debug!(model = %model.path.display(), "model loaded");
                        HandleState::Loaded(handle)
                    }
                    Err(err) => {
                        error!(%err, "model load failed");
                        HandleState::Failed(err)
                    }
                };
            }
        }
        match &mut self.handle {
            HandleState::Loaded(handle) => Ok(handle),
            HandleState::Failed(err) => Err(err.clone()),
            HandleState::Unloaded => Err(LoadError {
                path: String::new(),
                message: "simulate received before init".to_string(),
            }),
        }
    }

    fn simulate(
        &mut self,
        index: usize,
        request: &SimulationRequest,
        policy: ResultPolicy,
    ) -> Result<SimulationValue, Failure> {
        self.served += 1;
        let handle = self.ensure_loaded().map_err(|e| Failure::from_load(index, &e))?;

        let raw = match panic::catch_unwind(AssertUnwindSafe(|| handle.simulate(request))) {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                debug!(index, %err, "simulation failed");
                return Err(Failure::from_simulate(index, &err));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(index, %message, "model panicked, discarding handle");
                // The handle may be left inconsistent; reload on next request.
                self.handle = HandleState::Unloaded;
                return Err(Failure::new(index, FailureKind::Panic, message));
            }
        };

        strip(&raw, request.output_names(), policy).map_err(|e| Failure::from_strip(index, &e))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "model panicked".to_string()
    }
}

/// Runs the command loop until `Shutdown` or end of input.
///
/// # Errors
/// Returns an error if a frame cannot be decoded or a reply cannot be written.
pub fn serve<L, R, W>(loader: L, mut reader: R, mut writer: W) -> io::Result<()>
where
    L: ModelLoader,
    R: Read,
    W: Write,
{
    let mut worker = Worker::new(loader);

    loop {
        let body = match protocol::read_frame(&mut reader) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!("coordinator closed the command stream");
                break;
            }
            Err(err) => return Err(err),
        };
        let command: WorkerCommand = match protocol::parse(&body) {
            Ok(command) => command,
            Err(err) => {
                // The frame arrived intact; only this request is unusable.
                let Some(index) = protocol::frame_index(&body) else {
                    return Err(err);
                };
                warn!(index, %err, "unreadable request");
                let failure = Failure::new(index, FailureKind::InvalidParameter, format!("malformed request: {err}"));
                protocol::send(&mut writer, &WorkerReply::Outcome { index, result: Err(failure) })?;
                continue;
            }
        };

        match command {
            WorkerCommand::Init { model, platform } => worker.init(model, platform),
            WorkerCommand::Simulate {
                index,
                request,
                policy,
            } => {
                let result = worker.simulate(index, &request, policy);
                protocol::send(&mut writer, &WorkerReply::Outcome { index, result })?;
            }
            WorkerCommand::Shutdown => break,
        }
    }

    info!(served = worker.served, "worker exiting");
    Ok(())
}

/// Serves the protocol on the process's stdin and stdout.
///
/// # Errors
/// See [`serve`].
pub fn serve_stdio<L: ModelLoader>(loader: L) -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(
        loader,
        BufReader::new(stdin.lock()),
        BufWriter::new(stdout.lock()),
    )
}
