//! Launching the process set.
//!
//! A run is the manager plus `2 + inputs + correlators` worker ranks. This
//! module spawns every worker rank as a thread of the current process,
//! wired to the manager over loopback TCP; the transport contract is
//! identical to a multi-host deployment, so node code never knows the
//! difference. Each worker learns its role from the first control message
//! it receives.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use log::trace;

use crate::context::RunContext;
use crate::corr::CorrelatorNode;
use crate::error::FxcorrError;
use crate::input::InputNode;
use crate::log_node::LogNode;
use crate::manager::Manager;
use crate::msg::{CtrlMsg, Endpoint};
use crate::output::OutputNode;
use crate::transport::{
    ControlClient, ControlServer, DataListener, TransportError, RANK_MANAGER,
};

/// One worker rank: dial the manager, learn the role from the first
/// message, run the node.
fn node_main(manager: Endpoint, rank: u16, ctx: Arc<RunContext>) -> Result<(), FxcorrError> {
    let listener = DataListener::bind()?;
    let endpoint = listener.endpoint();
    let mut client = ControlClient::connect(&manager, rank, Some(endpoint))?;
    let first = client
        .inbox()
        .recv()
        .map_err(|_| TransportError::Closed { rank })?;
    client.send(RANK_MANAGER, CtrlMsg::NodeInitialised)?;
    match first.msg {
        CtrlMsg::SetLogNode { file } => {
            LogNode::new(client, file)?.run()?;
        }
        CtrlMsg::SetOutputNode => {
            OutputNode::new(client, listener).run_reporting();
        }
        CtrlMsg::SetInputNode {
            input_nr,
            station,
            datastream,
            format,
        } => {
            InputNode::new(ctx, rank, input_nr, station, datastream, format, client)
                .run_reporting();
        }
        CtrlMsg::SetCorrelatorNode { corr_nr, n_inputs } => {
            CorrelatorNode::new(rank, corr_nr, n_inputs, client, listener).run_reporting();
        }
        CtrlMsg::EndNode { .. } => {}
        other => {
            return Err(TransportError::Protocol {
                what: format!("unexpected bootstrap message {other:?}"),
            }
            .into())
        }
    }
    Ok(())
}

/// Launch the whole process set and run the manager to completion.
pub fn run_cluster(
    ctx: Arc<RunContext>,
    vex_path: PathBuf,
    num_correlators: usize,
) -> Result<(), FxcorrError> {
    let n_inputs = ctx.control.number_inputs();
    let n_nodes = 2 + n_inputs + num_correlators;
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let manager_endpoint = Endpoint {
        addrs: vec!["127.0.0.1".to_string()],
        port: listener.local_addr()?.port(),
    };

    let mut handles = Vec::new();
    for rank in 1..=n_nodes as u16 {
        let endpoint = manager_endpoint.clone();
        let ctx = ctx.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || node_main(endpoint, rank, ctx))
                .expect("spawn node"),
        );
    }

    let server = ControlServer::accept(&listener, n_nodes)?;
    let result = Manager::new(ctx, server, vex_path)?.run();

    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!("node exited with: {e}"),
            Err(_) => trace!("node thread panicked"),
        }
    }
    result
}
