//! The log node: serialises diagnostic output from every rank.
//!
//! Nodes ship their diagnostic lines as control messages addressed to this
//! rank; the manager relays them here, and they come out through one sink
//! (the process logger, or a file when the manager configured one), so
//! lines from different ranks never interleave mid-line.

use std::fs::File;
use std::io::{BufWriter, Write};

use crossbeam_channel::Receiver;
use log::{info, log, Level};

use crate::error::FxcorrError;
use crate::input::reader::uri_to_path;
use crate::msg::CtrlMsg;
use crate::node::Node;
use crate::transport::{ControlClient, Envelope};

pub struct LogNode {
    /// Never written to, but dropping it would close the control link.
    #[allow(dead_code)]
    client: ControlClient,
    inbox: Receiver<Envelope>,
    file: Option<BufWriter<File>>,
    max_level: i32,
    terminated: bool,
}

impl LogNode {
    pub fn new(client: ControlClient, file: Option<String>) -> Result<Self, FxcorrError> {
        let inbox = client.inbox().clone();
        let file = match file {
            Some(path) => Some(BufWriter::new(File::create(uri_to_path(&path))?)),
            None => None,
        };
        Ok(Self {
            client,
            inbox,
            file,
            max_level: 1,
            terminated: false,
        })
    }

    pub fn run(&mut self) -> Result<(), FxcorrError> {
        self.run_to_completion()
    }
}

impl Node for LogNode {
    fn receiver(&self) -> Receiver<Envelope> {
        self.inbox.clone()
    }

    fn handle_message(&mut self, envelope: Envelope) -> Result<(), FxcorrError> {
        match envelope.msg {
            CtrlMsg::LogMessage { rank, level, text } => {
                if level > self.max_level {
                    return Ok(());
                }
                match &mut self.file {
                    Some(file) => writeln!(file, "[rank {rank}] {text}")?,
                    None => {
                        let level = if level <= 0 { Level::Warn } else { Level::Info };
                        log!(level, "[rank {rank}] {text}");
                    }
                }
            }
            CtrlMsg::SetMessageLevel(level) => {
                self.max_level = level;
            }
            CtrlMsg::EndNode { .. } => {
                if let Some(file) = &mut self.file {
                    let _ = file.flush();
                }
                info!("log node closing");
                self.terminated = true;
            }
            _ => {}
        }
        Ok(())
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}
