//! Builder for [`Messenger`]

use uuid::Uuid;

use super::{Messenger, DEFAULT_TIMEOUT};

/// Builder for a [`Messenger`]
#[derive(Debug, Clone)]
pub struct Builder {
    name: Option<String>,
    timeout: i64,
    incoming_window: usize,
    outgoing_window: usize,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Creates a builder with the default configuration: a random
    /// container name, no tracker windows and an unbounded timeout
    pub fn new() -> Self {
        Self {
            name: None,
            timeout: DEFAULT_TIMEOUT,
            incoming_window: 0,
            outgoing_window: 0,
        }
    }

    /// Container name used as the AMQP identity of this endpoint and in
    /// reply-to defaulting.
    ///
    /// Defaults to a random UUID.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Timeout in milliseconds bounding every blocking operation.
    ///
    /// Negative means wait forever.
    pub fn timeout(mut self, timeout: i64) -> Self {
        self.timeout = timeout;
        self
    }

    /// How many settled incoming deliveries stay addressable by tracker
    pub fn incoming_window(mut self, window: usize) -> Self {
        self.incoming_window = window;
        self
    }

    /// How many settled outgoing deliveries stay addressable by tracker
    pub fn outgoing_window(mut self, window: usize) -> Self {
        self.outgoing_window = window;
        self
    }

    /// Build the messenger; it still has to be started
    pub fn build(self) -> Messenger {
        let name = self
            .name
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut messenger = Messenger::new(name);
        messenger.set_timeout(self.timeout);
        messenger.set_incoming_window(self.incoming_window);
        messenger.set_outgoing_window(self.outgoing_window);
        messenger
    }
}
