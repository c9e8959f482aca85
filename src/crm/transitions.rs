//! Per-state transition functions of the service state machine.
//!
//! Each function evolves one cloned [`ServiceStatus`] record; the caller
//! detects changes, refreshes the transition uid and re-runs the pass
//! until a fixpoint is reached.

use super::manager::Manager;
use crate::cluster::SelectPreference;
use crate::types::{
    RequestState, ServiceCommand, ServiceConfig, ServiceId, ServiceState, ServiceStatus,
    EXIT_ERROR, EXIT_IGNORED, EXIT_SUCCESS, EXIT_WRONG_NODE,
};
use tracing::{error, info, warn};

impl Manager {
    pub(super) fn next_state_stopped(
        &mut self,
        sid: &ServiceId,
        cd: &ServiceConfig,
        sd: &mut ServiceStatus,
        now: u64,
    ) {
        if let Some(cmd) = sd.cmd.take() {
            match cmd {
                ServiceCommand::Migrate { target } | ServiceCommand::Relocate { target }
                    if !self.node_online(&target) =>
                {
                    info!(sid = %sid, target = %target,
                        "Ignoring move of stopped service, target not online");
                }
                ServiceCommand::Migrate { target } | ServiceCommand::Relocate { target }
                    if target == sd.node =>
                {
                    info!(sid = %sid, node = %target,
                        "Ignoring move request, service already on node");
                }
                ServiceCommand::Migrate { target } => {
                    sd.state = ServiceState::Migrate;
                    sd.target = Some(target);
                    return;
                }
                ServiceCommand::Relocate { target } => {
                    sd.state = ServiceState::Relocate;
                    sd.target = Some(target);
                    return;
                }
                ServiceCommand::Stop { .. } => {
                    info!(sid = %sid, "Ignoring stop request, service already stopped");
                }
            }
        }

        if self.tracker().node_is_offline_delayed(&sd.node, now) {
            self.tracker().start_fence(&sd.node);
            sd.state = ServiceState::Fence;
            return;
        }

        if cd.state == RequestState::Started {
            sd.state = ServiceState::RequestStart;
        }
    }

    pub(super) fn next_state_request_start(
        &mut self,
        sid: &ServiceId,
        cd: &ServiceConfig,
        sd: &mut ServiceStatus,
    ) {
        if self.crs().rebalance_on_request_start {
            if let Some(better) = self.select_node(sid, cd, sd, SelectPreference::BestScore) {
                if better != sd.node {
                    info!(sid = %sid, node = %sd.node, target = %better,
                        "Rebalancing service on start");
                    self.charge_usage(&better, sid);
                    sd.state = ServiceState::RequestStartBalance;
                    sd.target = Some(better);
                    return;
                }
            }
        }
        sd.state = ServiceState::Started;
    }

    pub(super) fn next_state_started(
        &mut self,
        sid: &ServiceId,
        cd: &ServiceConfig,
        sd: &mut ServiceStatus,
        lrm_res: Option<i32>,
        now: u64,
    ) {
        if !self.node_online(&sd.node) {
            if self.tracker().node_is_offline_delayed(&sd.node, now) {
                self.tracker().start_fence(&sd.node);
                sd.state = ServiceState::Fence;
                return;
            }
            if self.tracker().get(&sd.node) != crate::types::NodeState::Maintenance {
                // Not yet eligible for fencing; wait.
                return;
            }
            // Save the current node as fallback for when it comes out of
            // maintenance, then let placement move the service away.
            if sd.maintenance_node.is_none() {
                info!(sid = %sid, node = %sd.node, "Recording maintenance fallback node");
                sd.maintenance_node = Some(sd.node.clone());
            }
        }

        if matches!(cd.state, RequestState::Stopped | RequestState::Disabled) {
            sd.state = ServiceState::RequestStop;
            return;
        }

        if let Some(cmd) = sd.cmd.take() {
            match cmd {
                ServiceCommand::Migrate { target } | ServiceCommand::Relocate { target }
                    if !self.node_online(&target) =>
                {
                    info!(sid = %sid, target = %target,
                        "Ignoring move request, target not online");
                }
                ServiceCommand::Migrate { target } | ServiceCommand::Relocate { target }
                    if target == sd.node =>
                {
                    info!(sid = %sid, node = %target,
                        "Ignoring move request, service already on node");
                }
                ServiceCommand::Migrate { target } => {
                    sd.state = ServiceState::Migrate;
                    sd.target = Some(target);
                    return;
                }
                ServiceCommand::Relocate { target } => {
                    sd.state = ServiceState::Relocate;
                    sd.target = Some(target);
                    return;
                }
                ServiceCommand::Stop { timeout } => {
                    sd.timeout = Some(timeout);
                    sd.state = ServiceState::RequestStop;
                    return;
                }
            }
        }

        let mut preference = SelectPreference::None;
        match lrm_res {
            None => {}
            Some(EXIT_SUCCESS) => {
                sd.failed_nodes.clear();
                sd.running = true;
            }
            Some(EXIT_ERROR) | Some(EXIT_WRONG_NODE) => {
                sd.running = false;
                if !sd.failed_nodes.contains(&sd.node) {
                    sd.failed_nodes.push(sd.node.clone());
                }
                if sd.failed_nodes.len() as u32 > cd.max_relocate {
                    error!(sid = %sid, failed_nodes = ?sd.failed_nodes,
                        "Start failed on too many nodes, no more relocation attempts");
                    sd.state = ServiceState::Error;
                    return;
                }
                warn!(sid = %sid, node = %sd.node, "Service start failed, trying another node");
                preference = SelectPreference::TryNext;
            }
            Some(code) => {
                error!(sid = %sid, exit_code = code, "Unexpected worker exit code");
                sd.state = ServiceState::Error;
                return;
            }
        }

        match self.select_node(sid, cd, sd, preference) {
            Some(target) if target != sd.node => {
                self.charge_usage(&target, sid);
                sd.state = if sid.kind() == "vm" {
                    ServiceState::Migrate
                } else {
                    ServiceState::Relocate
                };
                sd.target = Some(target);
            }
            _ => {
                // Staying put: a consumed result means the LRM is asked to
                // run the service again under a fresh transition token.
                if lrm_res.is_some() {
                    sd.uid = crate::types::fresh_uid();
                }
            }
        }
    }

    /// Shared transition for migrate, relocate and balance-start states.
    pub(super) fn next_state_moving(
        &mut self,
        sid: &ServiceId,
        cd: &ServiceConfig,
        sd: &mut ServiceStatus,
        lrm_res: Option<i32>,
        now: u64,
    ) {
        let Some(target) = sd.target.clone() else {
            warn!(sid = %sid, state = %sd.state, "Move without target, falling back to started");
            sd.state = ServiceState::Started;
            return;
        };

        match lrm_res {
            Some(EXIT_SUCCESS) => {
                if sd.maintenance_node.as_deref() == Some(target.as_str()) {
                    info!(sid = %sid, node = %target, "Service back on maintenance fallback node");
                    sd.maintenance_node = None;
                }
                sd.node = target;
                sd.target = None;
                sd.state = if matches!(cd.state, RequestState::Stopped | RequestState::Disabled) {
                    ServiceState::RequestStop
                } else {
                    ServiceState::Started
                };
            }
            Some(EXIT_WRONG_NODE) => {
                error!(sid = %sid, node = %sd.node, target = %target,
                    "Service configuration is on an unexpected node");
                sd.target = None;
                sd.state = ServiceState::Error;
            }
            Some(EXIT_IGNORED) if sd.state == ServiceState::RequestStartBalance => {
                info!(sid = %sid, node = %sd.node,
                    "Service already running, rebalance-on-start skipped");
                sd.target = None;
                sd.state = ServiceState::Started;
            }
            Some(code) => {
                warn!(sid = %sid, target = %target, exit_code = code,
                    "Move failed, service stays on current node");
                sd.target = None;
                sd.state = ServiceState::Started;
            }
            None => {
                if self.tracker().node_is_offline_delayed(&sd.node, now) {
                    self.tracker().start_fence(&sd.node);
                    sd.target = None;
                    sd.state = ServiceState::Fence;
                }
            }
        }
    }

    pub(super) fn next_state_request_stop(
        &mut self,
        sid: &ServiceId,
        _cd: &ServiceConfig,
        sd: &mut ServiceStatus,
        lrm_res: Option<i32>,
        now: u64,
    ) {
        match lrm_res {
            Some(EXIT_SUCCESS) => {
                sd.state = ServiceState::Stopped;
                sd.running = false;
                sd.timeout = None;
            }
            Some(code) => {
                error!(sid = %sid, exit_code = code, "Stop request failed");
                sd.state = ServiceState::Error;
            }
            None => {
                if self.tracker().node_is_offline_delayed(&sd.node, now) {
                    self.tracker().start_fence(&sd.node);
                    sd.state = ServiceState::Fence;
                }
            }
        }
    }

    pub(super) fn next_state_freeze(
        &mut self,
        _sid: &ServiceId,
        cd: &ServiceConfig,
        sd: &mut ServiceStatus,
    ) {
        if self.lrm_mode(&sd.node) == Some(crate::types::LrmMode::Active) {
            sd.state = if cd.state == RequestState::Started {
                ServiceState::Started
            } else {
                ServiceState::RequestStop
            };
        }
    }

    pub(super) fn next_state_error(
        &mut self,
        sid: &ServiceId,
        cd: &ServiceConfig,
        sd: &mut ServiceStatus,
    ) {
        if cd.state == RequestState::Disabled {
            info!(sid = %sid, "Disabled by admin, leaving error state");
            sd.failed_nodes.clear();
            sd.running = false;
            sd.state = ServiceState::Stopped;
        }
    }

    pub(super) async fn next_state_recovery(
        &mut self,
        sid: &ServiceId,
        cd: &ServiceConfig,
        sd: &mut ServiceStatus,
    ) {
        match self.select_node(sid, cd, sd, SelectPreference::BestScore) {
            Some(target) => {
                self.recover_service(sid, cd, sd, &target).await;
            }
            None => {
                if cd.state == RequestState::Disabled {
                    sd.state = ServiceState::Stopped;
                    return;
                }
                warn!(sid = %sid, "Recovery: no suitable node found, retrying next tick");
            }
        }
    }
}
