use crossbeam_channel::{bounded, Receiver, Sender};

/// Sender side of the repair fan-out, held by the engine.
///
/// Both channels are unit-valued with capacity 1: a signal that is already
/// pending absorbs further sends, so a burst of root bubbles wakes the
/// repair loops at most once.
pub struct RepairSignals {
    repair_needed: Sender<()>,
    stuck_chunk_found: Sender<()>,
}

/// Receiver side, handed to the repair subsystem.
pub struct SignalReceivers {
    pub repair_needed: Receiver<()>,
    pub stuck_chunk_found: Receiver<()>,
}

impl RepairSignals {
    pub fn new() -> (RepairSignals, SignalReceivers) {
        let (repair_tx, repair_rx) = bounded(1);
        let (stuck_tx, stuck_rx) = bounded(1);
        (
            RepairSignals {
                repair_needed: repair_tx,
                stuck_chunk_found: stuck_tx,
            },
            SignalReceivers {
                repair_needed: repair_rx,
                stuck_chunk_found: stuck_rx,
            },
        )
    }

    pub(crate) fn notify_repair_needed(&self) {
        let _ = self.repair_needed.try_send(());
    }

    pub(crate) fn notify_stuck_chunk_found(&self) {
        let _ = self.stuck_chunk_found.try_send(());
    }
}
