use tokio::sync::watch;

/// Sender side used by the transport when the caller goes away.
#[derive(Debug)]
pub struct CancellationHandle {
    sender: watch::Sender<bool>,
}

impl CancellationHandle {
    /// Marks the request as cancelled.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// Receiver side checked before new deferred queries are scheduled.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    receiver: Option<watch::Receiver<bool>>,
}

impl CancellationSignal {
    /// Returns a signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.receiver
            .as_ref()
            .is_some_and(|receiver| *receiver.borrow())
    }
}

/// Creates a connected handle and signal.
#[must_use]
pub fn cancellation_pair() -> (CancellationHandle, CancellationSignal) {
    let (sender, receiver) = watch::channel(false);
    (
        CancellationHandle { sender },
        CancellationSignal {
            receiver: Some(receiver),
        },
    )
}
