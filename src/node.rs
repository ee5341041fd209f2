//! The cooperative event loop every rank runs.
//!
//! A node's state advances only inside [`Node::handle_message`]; the
//! provided probe methods are the only suspension points of the control
//! plane. This mirrors the single-threaded cooperative model of the
//! design: helper threads feed the inbox, the main loop mutates state.

use crossbeam_channel::{Receiver, TryRecvError};

use crate::error::FxcorrError;
use crate::transport::Envelope;

/// The outcome of one probe of the inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageResult {
    /// A message was consumed and handled
    Processed,
    /// The inbox was empty
    NoMessage,
    /// Every sender is gone; no message can ever arrive again
    Disconnected,
}

/// One rank's event loop.
pub trait Node {
    /// The inbox fed by the transport receive threads. Cloning a
    /// crossbeam receiver shares the queue, so default methods can probe
    /// it while `handle_message` holds `&mut self`.
    fn receiver(&self) -> Receiver<Envelope>;

    /// Dispatch one message. A node switches on the message variant, one
    /// handler per variant; re-entrant sends are fine, re-entrant receives
    /// are not.
    fn handle_message(&mut self, envelope: Envelope) -> Result<(), FxcorrError>;

    /// Whether the node has been told to end.
    fn is_terminated(&self) -> bool;

    /// Block for the next message and handle it.
    fn check_and_process_message(&mut self) -> Result<MessageResult, FxcorrError> {
        match self.receiver().recv() {
            Ok(envelope) => {
                self.handle_message(envelope)?;
                Ok(MessageResult::Processed)
            }
            Err(_) => Ok(MessageResult::Disconnected),
        }
    }

    /// Handle one message if one is waiting.
    fn check_and_process_waiting_message(&mut self) -> Result<MessageResult, FxcorrError> {
        match self.receiver().try_recv() {
            Ok(envelope) => {
                self.handle_message(envelope)?;
                Ok(MessageResult::Processed)
            }
            Err(TryRecvError::Empty) => Ok(MessageResult::NoMessage),
            Err(TryRecvError::Disconnected) => Ok(MessageResult::Disconnected),
        }
    }

    /// Drain the inbox without blocking.
    fn process_all_waiting_messages(&mut self) -> Result<MessageResult, FxcorrError> {
        loop {
            match self.check_and_process_waiting_message()? {
                MessageResult::Processed => continue,
                other => return Ok(other),
            }
        }
    }

    /// Run to termination: block on each message in turn.
    fn run_to_completion(&mut self) -> Result<(), FxcorrError> {
        while !self.is_terminated() {
            if self.check_and_process_message()? == MessageResult::Disconnected {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::CtrlMsg;
    use crossbeam_channel::unbounded;

    struct CountingNode {
        rx: Receiver<Envelope>,
        handled: usize,
        terminated: bool,
    }

    impl Node for CountingNode {
        fn receiver(&self) -> Receiver<Envelope> {
            self.rx.clone()
        }
        fn handle_message(&mut self, envelope: Envelope) -> Result<(), FxcorrError> {
            self.handled += 1;
            if matches!(envelope.msg, CtrlMsg::EndNode { .. }) {
                self.terminated = true;
            }
            Ok(())
        }
        fn is_terminated(&self) -> bool {
            self.terminated
        }
    }

    #[test]
    fn test_process_all_waiting_messages_drains() {
        let (tx, rx) = unbounded();
        let mut node = CountingNode {
            rx,
            handled: 0,
            terminated: false,
        };
        for _ in 0..3 {
            tx.send(Envelope {
                from: 0,
                to: 1,
                msg: CtrlMsg::SetMessageLevel(1),
            })
            .unwrap();
        }
        assert_eq!(
            node.process_all_waiting_messages().unwrap(),
            MessageResult::NoMessage
        );
        assert_eq!(node.handled, 3);
    }

    #[test]
    fn test_run_to_completion_stops_on_end_node() {
        let (tx, rx) = unbounded();
        let mut node = CountingNode {
            rx,
            handled: 0,
            terminated: false,
        };
        tx.send(Envelope {
            from: 0,
            to: 1,
            msg: CtrlMsg::SetMessageLevel(2),
        })
        .unwrap();
        tx.send(Envelope {
            from: 0,
            to: 1,
            msg: CtrlMsg::EndNode { error: false },
        })
        .unwrap();
        node.run_to_completion().unwrap();
        assert_eq!(node.handled, 2);
        assert!(node.is_terminated());
    }
}
