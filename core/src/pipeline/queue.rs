use crate::pipeline::record::{RawTrain, TrainRecord};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("inbound source disconnected")]
    Disconnected,
    #[error("inbound source failed: {0}")]
    Failed(String),
}

/// Pull interface over the upstream bridge client.
pub trait TrainSource: Send {
    /// Wait at most `timeout` for the next train; `Ok(None)` on timeout.
    fn next_train(&mut self, timeout: Duration) -> Result<Option<RawTrain>, SourceError>;
}

impl TrainSource for Receiver<RawTrain> {
    fn next_train(&mut self, timeout: Duration) -> Result<Option<RawTrain>, SourceError> {
        match self.recv_timeout(timeout) {
            Ok(train) => Ok(Some(train)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Disconnected),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    /// Queue full; the record was discarded.
    Dropped,
    /// Consumer gone.
    Closed,
}

/// Non-blocking producer end of the outbound result queue.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: Sender<TrainRecord>,
}

impl OutboundQueue {
    pub fn push(&self, record: TrainRecord) -> PushOutcome {
        match self.sender.try_send(record) {
            Ok(()) => PushOutcome::Sent,
            Err(TrySendError::Full(_)) => PushOutcome::Dropped,
            Err(TrySendError::Disconnected(_)) => PushOutcome::Closed,
        }
    }
}

pub fn outbound_queue(capacity: usize) -> (OutboundQueue, Receiver<TrainRecord>) {
    let (sender, receiver) = bounded(capacity);
    (OutboundQueue { sender }, receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlSnapshot;
    use crate::geometry::ModuleAxis;
    use crate::pipeline::record::{ModuleStack, RawImages};
    use ndarray::Array4;

    fn raw(train_id: u64) -> RawTrain {
        RawTrain {
            train_id,
            images: RawImages::F32(ModuleStack::Dense {
                data: Array4::zeros((1, 1, 1, 1)),
                order: ModuleAxis::PulsesFirst,
            }),
        }
    }

    #[test]
    fn full_queue_drops() {
        let (queue, receiver) = outbound_queue(1);
        let record = |id| TrainRecord::new(raw(id), ControlSnapshot::default());
        assert_eq!(queue.push(record(1)), PushOutcome::Sent);
        assert_eq!(queue.push(record(2)), PushOutcome::Dropped);
        assert_eq!(receiver.recv().unwrap().train_id, 1);
        drop(receiver);
        assert_eq!(queue.push(record(3)), PushOutcome::Closed);
    }

    #[test]
    fn receiver_times_out_then_disconnects() {
        let (sender, mut receiver) = crossbeam_channel::unbounded();
        assert!(receiver
            .next_train(Duration::from_millis(1))
            .unwrap()
            .is_none());
        sender.send(raw(5)).unwrap();
        drop(sender);
        assert_eq!(
            receiver
                .next_train(Duration::from_millis(1))
                .unwrap()
                .unwrap()
                .train_id,
            5
        );
        assert_eq!(
            receiver.next_train(Duration::from_millis(1)).unwrap_err(),
            SourceError::Disconnected
        );
    }
}
