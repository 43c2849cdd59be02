use super::Topology;
use crate::engine::InterPartitionCommandSender;
use crate::logstream::encode_batch;
use crate::protocol::Record;
use crate::raft::{GenericMessage, NodeId, Payload, Transport};
use slog::{debug, warn, Logger};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Sends commands to another partition through the peer transport.
///
/// The command goes to every replica of the target partition; only the
/// current leader appends it, the others drop it.
#[derive(Clone)]
pub struct TransportCommandSender {
    node_id: NodeId,
    topology: Topology,
    transport: Arc<dyn Transport>,
    handle: Handle,
    logger: Logger,
}

impl TransportCommandSender {
    pub fn new(node_id: NodeId, topology: Topology, transport: Arc<dyn Transport>, handle: Handle, logger: Logger) -> Self {
        Self {
            node_id,
            topology,
            transport,
            handle,
            logger,
        }
    }
}

impl InterPartitionCommandSender for TransportCommandSender {
    fn send_command(&self, receiver_partition_id: u32, command: Record) {
        let data = match encode_batch(&[command]) {
            Ok(data) => data,
            Err(e) => {
                warn!(self.logger, "Failed to encode inter-partition command";
                    "partition" => receiver_partition_id, "error" => %e);
                return;
            }
        };
        for &target in self.topology.replicas(receiver_partition_id) {
            let message = GenericMessage {
                partition_id: receiver_partition_id,
                from: self.node_id,
                to: target,
                payload: Payload::InterPartitionCommand(data.clone()),
            };
            let transport = self.transport.clone();
            let logger = self.logger.clone();
            self.handle.spawn(async move {
                if let Err(e) = transport.send_message(target, message).await {
                    debug!(logger, "Inter-partition command not delivered";
                        "partition" => receiver_partition_id, "target" => target, "error" => %e);
                }
            });
        }
    }
}
