use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::launcher_dto::{LaunchAuth, LaunchCommand, LaunchEndpoint, LaunchReply};
use crate::domain::collaborators::rpc::{RpcRequest, call_checked};
use crate::domain::model::flow::{Flow, FlowEndpoint, FlowState};
use crate::domain::model::raw_job::{RawJob, RawJobState};
use crate::domain::model::sjob::{SJob, SJobState};
use crate::domain::model::stage::Stage;
use crate::domain::scheduler::SchedulerContext;
use crate::domain::scheduler::config::{SchedulerConfig, TransferAuth};
use crate::domain::scheduler::job_book::JobKey;
use crate::domain::scheduler::lane::{SchedulerLane, WorkerOutcome};
use crate::domain::utils::id::{SJobId, SiteId, TaskId};
use crate::error::TransferError;

pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Builds the `mdtm_launch` body for the block `flow` currently carries.
pub fn build_launch_command(config: &SchedulerConfig, raw: &RawJob, sjob: &SJob, flow: &Flow) -> Result<LaunchCommand, TransferError> {
    let (Some(src), Some(dst)) = (&flow.src, &flow.dst) else {
        return Err(TransferError::Validation(format!("task {} has no DTN pair", flow.task)));
    };
    let block = flow
        .block_index
        .and_then(|index| sjob.blocks.get(index))
        .ok_or_else(|| TransferError::Validation(format!("task {} carries no block", flow.task)))?;

    let auth = match &config.transfer_auth {
        TransferAuth::Password { username, password } => LaunchAuth::Password { username: username.clone(), password: password.clone() },
        TransferAuth::Certificate => {
            let proxy = |site: &SiteId| {
                raw.proxies
                    .get(site)
                    .cloned()
                    .ok_or_else(|| TransferError::Validation(format!("RawJob {} has no proxy credential for site {}", raw.id, site)))
            };
            LaunchAuth::Certificate { src_proxy: proxy(&sjob.src_site)?, dst_proxy: proxy(&sjob.dst_site)? }
        }
    };

    let checksum_algorithm = (config.checksum.enabled && block.has_checksums()).then(|| config.checksum.algorithm.clone());

    Ok(LaunchCommand {
        task: flow.task.clone(),
        sjob: sjob.id.clone(),
        block: block.id.clone(),
        src: launch_endpoint(src),
        dst: launch_endpoint(dst),
        port_range: config.port_range,
        auth,
        src_root: block.root.clone(),
        dst_dir: sjob.dst_path.clone(),
        files: block.files.clone(),
        checksum_algorithm,
    })
}

fn launch_endpoint(endpoint: &FlowEndpoint) -> LaunchEndpoint {
    LaunchEndpoint {
        dtn: endpoint.dtn.id.clone(),
        ctrl_ip: endpoint.dtn.ctrl_ip.clone(),
        data_ip: endpoint.dtn.data_ip.clone(),
        port: endpoint.dtn.port,
    }
}

/// Writes the command to `<dir>/<task>.json`.
pub async fn write_command_file(dir: &Path, command: &LaunchCommand) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.json", command.task));
    let body = serde_json::to_vec_pretty(command)?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// Sends `mdtm_launch` to the launcher agent. An `error` in the reply is a failure.
pub async fn dispatch_launch(ctx: &SchedulerContext, command: &LaunchCommand) -> Result<(), TransferError> {
    let queue = ctx.graph.launcher_queue().ok_or_else(|| TransferError::ResourceUnavailable("launcher agent went away".to_string()))?;

    if let Some(dir) = &ctx.config.command_file_dir {
        match write_command_file(dir, command).await {
            Ok(path) => log::debug!("Task {}: launch command written to {}", command.task, path.display()),
            Err(e) => log::warn!("Task {}: could not write command file into {}: {}", command.task, dir.display(), e),
        }
    }

    let params = serde_json::to_value(command).map_err(|e| TransferError::Validation(format!("launch command not serializable: {}", e)))?;
    let request = RpcRequest::new("mdtm_launch", command.src.dtn.as_str(), params);
    let _: LaunchReply = call_checked(ctx.rpc.as_ref(), &queue, request, LAUNCH_TIMEOUT).await?;

    log::info!("Task {}: block {} launched {} -> {}", command.task, command.block, command.src.dtn, command.dst.dtn);
    Ok(())
}

impl SchedulerLane {
    /// Starts the flow's current block: block `transferring`, flow `setting`, then the launch RPC.
    pub(crate) fn begin_launch(&mut self, key: JobKey, sjob_id: SJobId, task: TaskId) {
        let now = self.ctx.now();
        let command = {
            let Some(entry) = self.book.entry_mut(key) else {
                return;
            };
            let raw = &entry.raw;
            let Some(sjob) = entry.sjobs.iter_mut().find(|s| s.id == sjob_id) else {
                return;
            };
            let Some(flow_index) = sjob.flows.iter().position(|f| f.task == task) else {
                return;
            };

            let started = match sjob.flows[flow_index].block_index.and_then(|index| sjob.blocks.get_mut(index)) {
                Some(block) => block.start_transfer().map_err(|e| TransferError::Validation(e.to_string())),
                None => Err(TransferError::Validation(format!("task {} carries no block", task))),
            };

            let flow = &mut sjob.flows[flow_index];
            flow.state = FlowState::Setting;
            flow.rate = 0.0;
            flow.reported_bytes = 0;
            flow.last_active = now;
            sjob.state = SJobState::Launching;
            sjob.stage.working(Stage::TransferLaunch);

            started.and_then(|_| build_launch_command(&self.ctx.config, raw, sjob, &sjob.flows[flow_index]))
        };
        self.persist_sjob(key, &sjob_id);

        match command {
            Ok(command) => {
                let ctx = self.ctx.clone();
                self.spawn_worker(Some(key), async move {
                    let result = dispatch_launch(&ctx, &command).await;
                    WorkerOutcome::Launched { key, sjob: sjob_id, task, result }
                });
            }
            Err(error) => self.fail_flow(key, &sjob_id, &task, error, Stage::TransferLaunch),
        }
    }

    pub(crate) fn on_launched(&mut self, key: JobKey, sjob_id: SJobId, task: TaskId, result: Result<(), TransferError>) {
        let Some(entry) = self.book.entry_mut(key) else {
            return;
        };
        let Some(sjob) = entry.sjob_mut(&sjob_id) else {
            return;
        };
        if !sjob.flow(&task).is_some_and(|f| f.state.is_launched()) {
            log::debug!("Task {}: launch reply ignored, flow was retired meanwhile", task);
            return;
        }

        if let Err(error) = result {
            self.fail_flow(key, &sjob_id, &task, error, Stage::TransferLaunch);
            return;
        }

        sjob.stage.success(Stage::TransferLaunch);
        if sjob.state == SJobState::Launching {
            sjob.state = SJobState::Transferring;
        }
        let raw_started = entry.raw.state == RawJobState::Waiting;
        if raw_started {
            entry.raw.state = RawJobState::Transferring;
        }

        self.persist_sjob(key, &sjob_id);
        if raw_started {
            self.persist_raw_state(key);
        }
    }
}
